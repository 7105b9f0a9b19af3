//! In-process event fan-out with per-subscriber disk overflow.
//!
//! This module contains:
//! - [`Listener`]: one subscriber's delivery state machine (direct or buffered)
//! - [`QueuePool`]: topic registry and broadcaster
//! - [`QueueManager`] trait and [`DirectoryQueueManager`]: timestamping,
//!   watch handles and watcher announcements on top of a pool

pub mod listener;
pub mod manager;
pub mod pool;

pub use listener::{Listener, ListenerStats, Mode};
pub use manager::{DirectoryQueueManager, QueueManager, Unwatch, REGISTRATIONS_QUEUE};
pub use pool::{QueuePool, Unsubscribe};

/// Per-subscription options.
///
/// Unset fields fall back to the [`Config`](crate::config::Config) the pool
/// was built with.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    /// Names the subscriber in spool file names. Default: `master`.
    pub owner_name: Option<String>,
    /// Block the producer instead of spooling to disk.
    pub disable_file_buffering: bool,
    /// Rows the pump leases per batch.
    pub lease_size: Option<usize>,
    /// Capacity of the subscriber's channel.
    pub channel_capacity: Option<usize>,
}

impl QueueOptions {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner_name: Some(owner.into()),
            ..Default::default()
        }
    }
}
