//! Runtime logging.
//!
//! Log records emitted by effects are routed through the runtime's
//! [`Logger`] together with the emitting fiber's id, its active log spans,
//! and its annotations. The default logger forwards to `tracing`.

use rustc_hash::FxHashMap;
use strand_core::{Cause, FiberId};

/// Severity of a log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Fine-grained interpreter-level detail.
    Trace,
    /// Diagnostic detail.
    Debug,
    /// Normal operational messages.
    Info,
    /// Something unexpected but recoverable.
    Warn,
    /// A failure.
    Error,
}

/// Sink for log records emitted by running fibers.
pub trait Logger: Send + Sync {
    /// Deliver one record. `spans` is innermost-last; `annotations` is the
    /// emitting fiber's current annotation map.
    fn log(
        &self,
        fiber: FiberId,
        level: LogLevel,
        message: &str,
        cause: Option<&Cause>,
        spans: &[String],
        annotations: &FxHashMap<String, String>,
    );
}

/// Forwards records to the `tracing` ecosystem.
#[derive(Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(
        &self,
        fiber: FiberId,
        level: LogLevel,
        message: &str,
        cause: Option<&Cause>,
        spans: &[String],
        annotations: &FxHashMap<String, String>,
    ) {
        let spans = spans.join(" > ");
        let cause = cause.map(Cause::to_string).unwrap_or_default();
        match level {
            LogLevel::Trace => {
                tracing::trace!(%fiber, %spans, ?annotations, %cause, "{message}");
            }
            LogLevel::Debug => {
                tracing::debug!(%fiber, %spans, ?annotations, %cause, "{message}");
            }
            LogLevel::Info => {
                tracing::info!(%fiber, %spans, ?annotations, %cause, "{message}");
            }
            LogLevel::Warn => {
                tracing::warn!(%fiber, %spans, ?annotations, %cause, "{message}");
            }
            LogLevel::Error => {
                tracing::error!(%fiber, %spans, ?annotations, %cause, "{message}");
            }
        }
    }
}

/// Discards all records. Useful in tests asserting on other channels.
#[derive(Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(
        &self,
        _fiber: FiberId,
        _level: LogLevel,
        _message: &str,
        _cause: Option<&Cause>,
        _spans: &[String],
        _annotations: &FxHashMap<String, String>,
    ) {
    }
}
