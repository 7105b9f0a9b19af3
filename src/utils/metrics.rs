//! OTel-native metrics instruments.
//!
//! Centralized metric definitions using OpenTelemetry meters.
//! All instruments are lazily initialized and feature-gated behind `otel`.
//!
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("spillway"));

// ============================================================================
// Spool buffer
// ============================================================================

/// Bytes of backlog discarded because a spool file hit its size limit.
pub static BUFFER_DISCARDED_BYTES: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("spillway.buffer.discarded_bytes")
        .with_description("Spooled bytes discarded on overflow")
        .with_unit("By")
        .build()
});

/// Spool resets, labelled by reason (overflow, corruption, io_error, reset).
pub static BUFFER_RESETS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("spillway.buffer.resets")
        .with_description("Spool buffer resets")
        .build()
});

// ============================================================================
// Listener
// ============================================================================

/// Rows handed to subscribers.
pub static LISTENER_DELIVERED: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("spillway.listener.delivered")
        .with_description("Rows delivered to subscribers")
        .build()
});

// ============================================================================
// Attribute helpers
// ============================================================================

/// Create a buffer label (spool file prefix).
pub fn buffer_attr(buffer: &str) -> KeyValue {
    KeyValue::new("buffer", buffer.to_string())
}

/// Create a reason label.
pub fn reason_attr(reason: &str) -> KeyValue {
    KeyValue::new("reason", reason.to_string())
}

/// Create a topic label.
pub fn topic_attr(topic: &str) -> KeyValue {
    KeyValue::new("topic", topic.to_string())
}

/// Create a delivery mode label (direct, buffered).
pub fn mode_attr(mode: &str) -> KeyValue {
    KeyValue::new("mode", mode.to_string())
}
