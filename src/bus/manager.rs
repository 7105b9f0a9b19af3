//! Queue manager: the producer-facing side of the bus.
//!
//! Wraps a [`QueuePool`] with row timestamping and watcher announcements.
//! Every change to the set of watched queues is published as
//! `{"Events": [...]}` on [`REGISTRATIONS_QUEUE`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::listener::ListenerStats;
use super::pool::QueuePool;
use super::QueueOptions;
use crate::buffer::{TempDirSpool, TempFileProvider};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::Row;

/// Queue receiving the list of watched queues after every change.
pub const REGISTRATIONS_QUEUE: &str = "Server.Internal.MasterRegistrations";

/// Column stamped onto every pushed row.
pub const TIMESTAMP_COLUMN: &str = "_ts";

/// Handle ending one watch.
///
/// Consumed by [`cancel`](Self::cancel); dropping it unused leaves the
/// watcher registered.
#[must_use = "dropping an Unwatch leaves the watcher registered"]
pub struct Unwatch {
    cancel: BoxFuture<'static, ()>,
}

impl std::fmt::Debug for Unwatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unwatch").finish_non_exhaustive()
    }
}

impl Unwatch {
    pub fn new(cancel: BoxFuture<'static, ()>) -> Self {
        Self { cancel }
    }

    /// Stop watching. The watcher's backlog is discarded.
    pub async fn cancel(self) {
        self.cancel.await
    }
}

/// Publish/subscribe interface over named queues.
#[async_trait]
pub trait QueueManager: Send + Sync {
    /// Stamp rows with the current time and deliver them, in order, to
    /// every watcher of `queue`.
    async fn push_event_rows(&self, queue: &str, rows: Vec<Row>);

    /// Start watching a queue.
    ///
    /// The watcher stops delivering once `ctx` is cancelled.
    async fn watch(
        &self,
        ctx: &CancellationToken,
        queue: &str,
        options: QueueOptions,
    ) -> (ReceiverStream<Row>, Unwatch);

    /// Queues with at least one watcher, sorted.
    async fn watchers(&self) -> Vec<String>;

    /// Per-queue listener stats.
    async fn debug(&self) -> BTreeMap<String, Vec<ListenerStats>>;
}

struct Inner {
    pool: QueuePool,
    clock: Arc<dyn Clock>,
}

/// [`QueueManager`] backed by a pool of file-buffered listeners.
#[derive(Clone)]
pub struct DirectoryQueueManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DirectoryQueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryQueueManager")
            .field("pool", &self.inner.pool)
            .field("clock", &self.inner.clock)
            .finish()
    }
}

impl DirectoryQueueManager {
    /// Create a manager using the system clock.
    pub fn new(config: Config) -> Self {
        let spool = Arc::new(TempDirSpool::new(config.buffer.spool_dir.clone().into()));
        Self::with_parts(config, spool, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: Config,
        spool: Arc<dyn TempFileProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pool: QueuePool::with_spool(config, spool),
                clock,
            }),
        }
    }

    pub fn pool(&self) -> &QueuePool {
        &self.inner.pool
    }

    fn stamp(&self, mut row: Row) -> Row {
        let now = self.inner.clock.now().timestamp();
        row.insert(TIMESTAMP_COLUMN.to_string(), Value::from(now));
        row
    }

    async fn publish_watchers(&self) {
        let watchers = self.inner.pool.topics().await;
        let mut row = Row::new();
        row.insert(
            "Events".to_string(),
            Value::Array(watchers.into_iter().map(Value::String).collect()),
        );
        self.push_event_rows(REGISTRATIONS_QUEUE, vec![row]).await;
    }

    /// Close every watcher, discarding backlogs, and remove leftover spool
    /// files.
    pub async fn shutdown(&self) {
        self.inner.pool.close_all().await;
        let removed = self.inner.pool.spool().remove_all();
        info!(removed, "Queue manager shut down");
    }
}

#[async_trait]
impl QueueManager for DirectoryQueueManager {
    async fn push_event_rows(&self, queue: &str, rows: Vec<Row>) {
        for row in rows {
            let row = self.stamp(row);
            self.inner.pool.broadcast(queue, row).await;
        }
    }

    async fn watch(
        &self,
        ctx: &CancellationToken,
        queue: &str,
        options: QueueOptions,
    ) -> (ReceiverStream<Row>, Unwatch) {
        let watcher = options.owner_name.clone().unwrap_or_default();
        info!(queue, watcher = %watcher, "Watching for events");

        let subctx = ctx.child_token();
        let (stream, unsubscribe) = self.inner.pool.register(&subctx, queue, &options).await;

        self.publish_watchers().await;

        let manager = self.clone();
        let queue = queue.to_string();
        let unwatch = Unwatch::new(
            async move {
                subctx.cancel();
                unsubscribe.cancel().await;
                debug!(queue = %queue, watcher = %watcher, "Watcher removed");
                manager.publish_watchers().await;
            }
            .boxed(),
        );

        (stream, unwatch)
    }

    async fn watchers(&self) -> Vec<String> {
        self.inner.pool.topics().await
    }

    async fn debug(&self) -> BTreeMap<String, Vec<ListenerStats>> {
        self.inner.pool.debug().await
    }
}
