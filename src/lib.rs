//! Spillway - overflow broadcast
//!
//! Fans rows published on a topic out to every registered listener.
//! Each listener delivers straight to its subscriber while the subscriber
//! keeps up, and spills to a private on-disk ring buffer when it does not,
//! preserving per-listener order across both paths.

pub mod buffer;
pub mod bus;
pub mod clock;
pub mod config;
pub mod utils;

/// A structured row: JSON object with insertion order preserved.
pub type Row = serde_json::Map<String, serde_json::Value>;

pub use buffer::{BufferError, BufferStats, RingBufferFile};
pub use bus::{
    DirectoryQueueManager, Listener, ListenerStats, Mode, QueueManager, QueueOptions, QueuePool,
    Unsubscribe, Unwatch,
};
pub use clock::{Clock, MockClock, SystemClock};
pub use config::Config;
