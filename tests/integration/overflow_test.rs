//! Spool files stay within their size limit under sustained pressure.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::json;
use spillway::buffer::TempDirSpool;
use spillway::config::BufferConfig;
use spillway::{Config, QueueOptions, QueuePool, Row};
use tokio_util::sync::CancellationToken;

const MAX_SIZE: u64 = 4096;

fn padded_row(seq: u64) -> Row {
    json!({ "seq": seq, "pad": "p".repeat(100) })
        .as_object()
        .unwrap()
        .clone()
}

#[tokio::test]
async fn test_overflow_keeps_newest_rows_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::for_test(dir.path());
    config.buffer = BufferConfig::default()
        .with_max_size(MAX_SIZE)
        .with_spool_dir(dir.path());
    let pool = QueuePool::with_spool(config, Arc::new(TempDirSpool::in_dir(dir.path())));
    let ctx = CancellationToken::new();

    let options = QueueOptions {
        lease_size: Some(10),
        ..Default::default()
    };
    let (stream, unsubscribe) = pool.register(&ctx, "t", &options).await;

    for seq in 0..200 {
        pool.broadcast("t", padded_row(seq)).await;
        let stats = pool.debug().await;
        let file_size = stats["t"][0].file_size;
        assert!(file_size <= MAX_SIZE, "spool grew to {file_size}");
    }

    let reader = tokio::spawn(
        stream
            .map(|row| row["seq"].as_u64().unwrap())
            .collect::<Vec<_>>(),
    );
    unsubscribe.cancel().await;
    let seen = reader.await.unwrap();

    assert!(seen.len() < 200, "some backlog should have been discarded");
    assert_eq!(seen[0], 0);
    assert_eq!(*seen.last().unwrap(), 199);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}
