//! Configuration files drive pool behavior.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use spillway::{Config, DirectoryQueueManager, QueueManager, QueueOptions};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_manager_from_yaml_file() {
    let dir = tempfile::tempdir().unwrap();
    let spool_dir = dir.path().join("spool");
    let config_path = dir.path().join("spillway.yaml");
    std::fs::write(
        &config_path,
        format!(
            "buffer:\n  max_size_bytes: 65536\n  lease_size: 5\n  spool_dir: {}\nlistener:\n  channel_capacity: 2\n",
            spool_dir.display()
        ),
    )
    .unwrap();

    let config = Config::load(config_path.to_str()).unwrap();
    assert_eq!(config.buffer.max_size_bytes, 65536);
    assert_eq!(config.buffer.lease_size, 5);
    assert_eq!(config.listener.channel_capacity, 2);

    let manager = DirectoryQueueManager::new(config);
    let ctx = CancellationToken::new();
    let (mut stream, unwatch) = manager.watch(&ctx, "q", QueueOptions::default()).await;

    for seq in 0..10 {
        let row = json!({ "seq": seq }).as_object().unwrap().clone();
        manager.push_event_rows("q", vec![row]).await;
    }
    assert!(spool_dir.exists(), "spool directory created on first spill");

    for seq in 0..10 {
        let row = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["seq"], json!(seq));
    }

    unwatch.cancel().await;
    manager.shutdown().await;
}
