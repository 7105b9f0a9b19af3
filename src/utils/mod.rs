//! Process-level helpers shared by binaries and the library.

pub mod bootstrap;
#[cfg(feature = "otel")]
pub mod metrics;
