//! Topic registry.
//!
//! A [`QueuePool`] maps topic names to the listeners subscribed to them and
//! fans rows out to every listener on a topic. Each listener buffers
//! independently, so one slow subscriber never holds up the others.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::listener::{Listener, ListenerStats};
use super::QueueOptions;
use crate::buffer::{TempDirSpool, TempFileProvider};
use crate::config::Config;
use crate::Row;

type Registrations = HashMap<String, Vec<Arc<Listener>>>;

/// Registry of listeners keyed by topic.
///
/// Cheap to clone; clones share the same registrations.
#[derive(Clone)]
pub struct QueuePool {
    registrations: Arc<Mutex<Registrations>>,
    config: Arc<Config>,
    spool: Arc<dyn TempFileProvider>,
}

impl std::fmt::Debug for QueuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuePool")
            .field("spool", &self.spool)
            .finish_non_exhaustive()
    }
}

impl QueuePool {
    /// Create a pool whose listeners spool into `config.buffer.spool_dir`.
    pub fn new(config: Config) -> Self {
        let spool = Arc::new(TempDirSpool::new(config.buffer.spool_dir.clone().into()));
        Self::with_spool(config, spool)
    }

    pub fn with_spool(config: Config, spool: Arc<dyn TempFileProvider>) -> Self {
        Self {
            registrations: Arc::new(Mutex::new(HashMap::new())),
            config: Arc::new(config),
            spool,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn spool(&self) -> &Arc<dyn TempFileProvider> {
        &self.spool
    }

    /// Subscribe to a topic.
    ///
    /// The listener lives until the returned [`Unsubscribe`] is invoked. If
    /// `ctx` is cancelled first, the listener stops delivering and discards
    /// its backlog, but stays registered until unsubscribed.
    pub async fn register(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        options: &QueueOptions,
    ) -> (ReceiverStream<Row>, Unsubscribe) {
        let (listener, stream) =
            Listener::spawn(topic, options, &self.config, self.spool.clone(), ctx);

        let unsubscribe = Unsubscribe {
            pool: self.clone(),
            topic: topic.to_string(),
            id: listener.id(),
            token: listener.token().clone(),
        };

        let count = {
            let mut registrations = self.registrations.lock().await;
            let listeners = registrations.entry(topic.to_string()).or_default();
            listeners.push(listener);
            listeners.len()
        };

        info!(topic, listener = %unsubscribe.id, listeners = count, "Listener registered");

        (stream, unsubscribe)
    }

    /// Remove a listener and close it. Unknown ids are ignored.
    async fn unregister(&self, topic: &str, id: Uuid) {
        let removed = {
            let mut registrations = self.registrations.lock().await;
            let Some(listeners) = registrations.get_mut(topic) else {
                return;
            };
            let removed = listeners
                .iter()
                .position(|l| l.id() == id)
                .map(|pos| listeners.remove(pos));
            if listeners.is_empty() {
                registrations.remove(topic);
            }
            removed
        };

        if let Some(listener) = removed {
            listener.close().await;
            info!(topic, listener = %id, "Listener unregistered");
        }
    }

    /// Snapshot of the listeners on a topic.
    ///
    /// Taken under the lock so callers can deliver without holding it.
    async fn registrations_for(&self, topic: &str) -> Vec<Arc<Listener>> {
        self.registrations
            .lock()
            .await
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver a row to every listener on a topic.
    ///
    /// A no-op when nobody is subscribed.
    pub async fn broadcast(&self, topic: &str, row: Row) {
        let listeners = self.registrations_for(topic).await;
        match listeners.as_slice() {
            [] => {}
            [only] => only.send(row).await,
            _ => {
                join_all(listeners.iter().map(|l| l.send(row.clone()))).await;
            }
        }
    }

    /// Deliver several rows in order.
    pub async fn broadcast_all(&self, topic: &str, rows: impl IntoIterator<Item = Row>) {
        for row in rows {
            self.broadcast(topic, row).await;
        }
    }

    /// Topics with at least one listener, sorted.
    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registrations.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn listener_count(&self, topic: &str) -> usize {
        self.registrations
            .lock()
            .await
            .get(topic)
            .map(Vec::len)
            .unwrap_or_default()
    }

    /// Per-topic listener stats.
    pub async fn debug(&self) -> BTreeMap<String, Vec<ListenerStats>> {
        let snapshot: Vec<(String, Vec<Arc<Listener>>)> = self
            .registrations
            .lock()
            .await
            .iter()
            .map(|(topic, listeners)| (topic.clone(), listeners.clone()))
            .collect();

        let mut out = BTreeMap::new();
        for (topic, listeners) in snapshot {
            let mut stats = Vec::with_capacity(listeners.len());
            for listener in listeners {
                stats.push(listener.stats().await);
            }
            out.insert(topic, stats);
        }
        out
    }

    /// Close every listener and clear the registry.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Listener>> = {
            let mut registrations = self.registrations.lock().await;
            registrations.drain().flat_map(|(_, l)| l).collect()
        };

        debug!(listeners = drained.len(), "Closing all listeners");
        for listener in drained {
            listener.token().cancel();
            listener.close().await;
        }
    }
}

/// Handle that removes one listener from its pool.
///
/// Consumed by [`cancel`](Self::cancel) or [`abort`](Self::abort), so it
/// fires at most once. Dropping it unused leaves the listener registered.
#[derive(Debug)]
pub struct Unsubscribe {
    pool: QueuePool,
    topic: String,
    id: Uuid,
    token: CancellationToken,
}

impl Unsubscribe {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn listener_id(&self) -> Uuid {
        self.id
    }

    /// Unregister and close the listener, flushing its backlog to the
    /// subscriber unless its context was already cancelled.
    pub async fn cancel(self) {
        self.pool.unregister(&self.topic, self.id).await;
    }

    /// Unregister the listener, discarding its backlog.
    pub async fn abort(self) {
        self.token.cancel();
        self.pool.unregister(&self.topic, self.id).await;
    }
}
