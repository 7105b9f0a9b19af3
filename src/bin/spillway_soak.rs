//! spillway-soak: overflow soak test
//!
//! Floods one topic while a deliberately slow subscriber and a fast
//! subscriber watch it, then logs per-listener stats as JSON and checks
//! that both subscribers saw every row in order.
//!
//! ## Configuration
//! - First argument: optional config file (YAML)
//! - SPILLWAY_SOAK_ROWS: rows to publish (default: 10000)
//! - SPILLWAY_SOAK_DELAY_MS: slow subscriber delay per row (default: 1)
//! - SPILLWAY_LOG: log filter (default: info)

use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use spillway::utils::bootstrap::init_tracing;
use spillway::{Config, DirectoryQueueManager, QueueManager, QueueOptions, Row};

const TOPIC: &str = "Soak.Events";
const DEFAULT_ROWS: u64 = 10_000;
const DEFAULT_DELAY_MS: u64 = 1;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Read until the stream ends, returning the number of rows seen in order.
async fn consume(mut stream: ReceiverStream<Row>, delay: Duration) -> (u64, u64) {
    let mut seen = 0;
    let mut out_of_order = 0;
    while let Some(row) = stream.next().await {
        if row.get("seq").and_then(Value::as_u64) != Some(seen) {
            out_of_order += 1;
        }
        seen += 1;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    (seen, out_of_order)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    let rows = env_u64("SPILLWAY_SOAK_ROWS", DEFAULT_ROWS);
    let delay = Duration::from_millis(env_u64("SPILLWAY_SOAK_DELAY_MS", DEFAULT_DELAY_MS));

    let manager = DirectoryQueueManager::new(config);
    let ctx = CancellationToken::new();

    let (slow, unwatch_slow) = manager
        .watch(&ctx, TOPIC, QueueOptions::owned_by("slow"))
        .await;
    let (fast, unwatch_fast) = manager
        .watch(&ctx, TOPIC, QueueOptions::owned_by("fast"))
        .await;

    let slow_reader = tokio::spawn(consume(slow, delay));
    let fast_reader = tokio::spawn(consume(fast, Duration::ZERO));

    info!(rows, delay_ms = delay.as_millis() as u64, "spillway-soak started");
    let started = Instant::now();
    for seq in 0..rows {
        let mut row = Row::new();
        row.insert("seq".to_string(), Value::from(seq));
        manager.push_event_rows(TOPIC, vec![row]).await;
    }
    info!(elapsed_ms = started.elapsed().as_millis() as u64, "Publishing finished");

    let stats = manager.debug().await;
    info!(stats = %serde_json::to_string(&stats)?, "Listener stats after publish");

    // Unwatching discards backlog, so let both subscribers catch up first.
    loop {
        let stats = manager.debug().await;
        let caught_up = stats
            .get(TOPIC)
            .is_some_and(|listeners| listeners.iter().all(|l| l.delivered >= rows));
        if caught_up {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    unwatch_fast.cancel().await;
    unwatch_slow.cancel().await;

    let (slow_seen, slow_disorder) = slow_reader.await?;
    let (fast_seen, fast_disorder) = fast_reader.await?;
    info!(
        slow_seen,
        fast_seen,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "spillway-soak finished"
    );

    if slow_disorder > 0 || fast_disorder > 0 {
        warn!(slow_disorder, fast_disorder, "Rows arrived out of order");
    }

    manager.shutdown().await;
    Ok(())
}
