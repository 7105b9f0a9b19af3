//! Damaged spool files are discarded and delivery carries on.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use spillway::buffer::TempDirSpool;
use spillway::{Config, QueueOptions, QueuePool, Row};
use tokio_util::sync::CancellationToken;

fn seq_row(seq: u64) -> Row {
    json!({ "seq": seq }).as_object().unwrap().clone()
}

#[tokio::test]
async fn test_corrupted_spool_is_discarded_and_delivery_continues() {
    let dir = tempfile::tempdir().unwrap();
    let pool = QueuePool::with_spool(
        Config::for_test(dir.path()),
        Arc::new(TempDirSpool::in_dir(dir.path())),
    );
    let ctx = CancellationToken::new();

    let (mut stream, unsubscribe) = pool.register(&ctx, "t", &QueueOptions::default()).await;
    for seq in 0..10 {
        pool.broadcast("t", seq_row(seq)).await;
    }

    let debug = pool.debug().await;
    let path = debug["t"][0].backing_file.clone().unwrap();
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.write_all_at(b"XXXX", 0).unwrap();
    drop(file);

    let first = stream.next().await.unwrap();
    assert_eq!(first["seq"], json!(0));

    pool.broadcast("t", seq_row(100)).await;
    let next = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(next["seq"], json!(100));

    unsubscribe.cancel().await;
    assert!(!path.exists());
    assert!(stream.next().await.is_none());
}
