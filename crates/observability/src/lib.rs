//! Tracing/logging setup shared by every service binary.

/// Initialize process-wide logging for `service`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(service: &'static str) {
    tracing::init(LogFormat::from_env());
    ::tracing::info!(service, "logging initialised");
}

pub use self::tracing::LogFormat;

/// Tracing configuration (filters, layers).
pub mod tracing;
