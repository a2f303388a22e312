//! Process-wide tracing setup shared by the hireflow binaries.

pub mod tracing;

pub use self::tracing::{LogFormat, TracingConfig};

/// Install the default subscriber: JSON lines, `RUST_LOG` filter, `info` otherwise.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init(&TracingConfig::default());
}
