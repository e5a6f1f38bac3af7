//! A narrow logging seam.
//!
//! spec.md treats logging as an external collaborator but the component
//! table (spec.md §2) still budgets a "structured logger shim" inside the
//! core — mirrors the Go source's `logger.go`, which wraps *some* logging
//! backend behind a small interface rather than hard-coding one. `Logger`
//! is that interface; [`TracingLogger`] is the default, backed by the
//! `tracing` crate the way the rest of the crate (and its teacher) logs.

use std::fmt;

/// Severity of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A pluggable sink for `ripple`'s internal diagnostics.
///
/// Implementations must not block the caller for long — log calls happen
/// on the reactor's hot path (handshake rejection, eviction, dispatch).
pub trait Logger: Send + Sync + 'static {
    fn log(&self, level: Level, target: &str, message: &dyn fmt::Display);
}

/// Default [`Logger`] backed by the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: Level, target: &str, message: &dyn fmt::Display) {
        match level {
            Level::Trace => tracing::trace!(target: "ripple", %target, "{}", message),
            Level::Debug => tracing::debug!(target: "ripple", %target, "{}", message),
            Level::Info => tracing::info!(target: "ripple", %target, "{}", message),
            Level::Warn => tracing::warn!(target: "ripple", %target, "{}", message),
            Level::Error => tracing::error!(target: "ripple", %target, "{}", message),
        }
    }
}

/// Install a sane default `tracing` subscriber for binaries embedding
/// `ripple` that don't want to configure `tracing-subscriber` themselves.
/// Safe to call more than once — later calls are no-ops.
pub fn init_default_tracing(env_filter: &str) {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter.to_string())
            .compact()
            .try_init();
    });
}

