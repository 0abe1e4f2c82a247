//! Process-wide tracing setup shared by conductor binaries.

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};

/// Initialize tracing with defaults (`info`, JSON lines, `RUST_LOG` overrides).
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    tracing::init(&LogConfig::default());
}

/// Initialize tracing from explicit configuration.
pub fn init_with(config: &LogConfig) {
    tracing::init(config);
}
