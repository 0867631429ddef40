//! Tracing/logging setup shared by every crosswalk process.
//!
//! This is the channel integrity failures and terminal-hook failures are
//! reported through, so workers should call [`init`] before touching the
//! job engine.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;
