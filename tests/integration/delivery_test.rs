//! End-to-end delivery through the queue manager.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use spillway::buffer::{TempDirSpool, TempFileProvider};
use spillway::{Config, DirectoryQueueManager, QueueManager, QueueOptions, Row, SystemClock};
use tokio_util::sync::CancellationToken;

fn seq_row(seq: u64) -> Row {
    json!({ "seq": seq, "payload": "x".repeat(32) })
        .as_object()
        .unwrap()
        .clone()
}

fn manager(dir: &std::path::Path) -> (DirectoryQueueManager, Arc<TempDirSpool>) {
    let spool = Arc::new(TempDirSpool::in_dir(dir));
    let manager =
        DirectoryQueueManager::with_parts(Config::for_test(dir), spool.clone(), Arc::new(SystemClock));
    (manager, spool)
}

/// A slow and a fast watcher on the same queue both see every row in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_and_fast_watchers_see_every_row_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, spool) = manager(dir.path());
    let ctx = CancellationToken::new();
    let total = 300u64;

    let (slow, unwatch_slow) = manager
        .watch(&ctx, "events", QueueOptions::owned_by("slow"))
        .await;
    let (fast, unwatch_fast) = manager
        .watch(&ctx, "events", QueueOptions::owned_by("fast"))
        .await;

    let slow_reader = tokio::spawn(async move {
        slow.then(|row| async move {
            tokio::time::sleep(Duration::from_micros(200)).await;
            row
        })
        .take(total as usize)
        .map(|row| row["seq"].as_u64().unwrap())
        .collect::<Vec<_>>()
        .await
    });
    let fast_reader = tokio::spawn(
        fast.take(total as usize)
            .map(|row| row["seq"].as_u64().unwrap())
            .collect::<Vec<_>>(),
    );

    for seq in 0..total {
        manager.push_event_rows("events", vec![seq_row(seq)]).await;
    }

    let expected: Vec<u64> = (0..total).collect();
    let fast_rows = tokio::time::timeout(Duration::from_secs(10), fast_reader)
        .await
        .unwrap()
        .unwrap();
    let slow_rows = tokio::time::timeout(Duration::from_secs(10), slow_reader)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fast_rows, expected);
    assert_eq!(slow_rows, expected);

    unwatch_slow.cancel().await;
    unwatch_fast.cancel().await;
    manager.shutdown().await;
    assert!(spool.tracked().is_empty());
}

/// Every delivered row carries the manager's timestamp column.
#[tokio::test]
async fn test_rows_are_timestamped() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, _spool) = manager(dir.path());
    let ctx = CancellationToken::new();

    let (mut stream, unwatch) = manager.watch(&ctx, "q", QueueOptions::default()).await;
    manager.push_event_rows("q", vec![seq_row(0)]).await;

    let row = stream.next().await.unwrap();
    let ts = row["_ts"].as_i64().unwrap();
    assert!(ts > 1_600_000_000);
    assert_eq!(row["seq"], Value::from(0));

    unwatch.cancel().await;
}

/// Unwatching ends the subscriber's stream.
#[tokio::test]
async fn test_unwatch_ends_stream() {
    let dir = tempfile::tempdir().unwrap();
    let (manager, spool) = manager(dir.path());
    let ctx = CancellationToken::new();

    let (stream, unwatch) = manager.watch(&ctx, "q", QueueOptions::default()).await;
    for seq in 0..20 {
        manager.push_event_rows("q", vec![seq_row(seq)]).await;
    }
    unwatch.cancel().await;

    let remaining: Vec<Row> = tokio::time::timeout(Duration::from_secs(1), stream.collect())
        .await
        .expect("stream should end after unwatch");
    assert!(remaining.len() < 20);
    assert!(spool.tracked().is_empty());
    assert!(manager.watchers().await.is_empty());
}
