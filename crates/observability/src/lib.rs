//! Process-wide logging setup for herald binaries.

pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize logging with the format named by `HERALD_LOG_FORMAT`
/// (`json` by default).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let format = std::env::var("HERALD_LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    crate::tracing::init(format);
}
