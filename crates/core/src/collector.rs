//! Logging collaborator used at the runtime's failure boundaries.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Fire-and-forget sink for runtime diagnostics.
///
/// Calls are never awaited and implementations must never panic back into the
/// caller; the task loop relies on this.
pub trait DataCollector: Send + Sync {
    fn log_message(&self, level: LogLevel, text: &str);

    fn log_exception(&self, context: &str, error: &(dyn std::error::Error + 'static));
}

/// Default collector that forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCollector;

impl DataCollector for TracingCollector {
    fn log_message(&self, level: LogLevel, text: &str) {
        match level {
            LogLevel::Trace => tracing::trace!("{text}"),
            LogLevel::Debug => tracing::debug!("{text}"),
            LogLevel::Info => tracing::info!("{text}"),
            LogLevel::Warning => tracing::warn!("{text}"),
            LogLevel::Error => tracing::error!("{text}"),
        }
    }

    fn log_exception(&self, context: &str, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(context, error = %error, "unhandled exception");
    }
}
