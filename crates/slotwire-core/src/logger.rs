//! Error sink injected into clients and servers.
//!
//! Transport failures never surface as panics or raised errors to callers;
//! their details go to this sink instead. `error` is used for recoverable
//! conditions (a peer disconnected, a connect attempt failed), `fatal` for
//! conditions that indicate a bug or corrupted state (a message failed to
//! pack, a handler panicked).

use std::sync::{Arc, Mutex, PoisonError};

use tracing::error;

/// Two-method logging capability.
pub trait ErrorLogger: Send + Sync {
    fn error(&self, message: &str);

    fn fatal(&self, message: &str);
}

/// Shared handle to an error sink.
pub type SharedErrorLogger = Arc<dyn ErrorLogger>;

/// Forwards to `tracing` at ERROR level; fatal lines carry `fatal = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorLogger;

impl ErrorLogger for TracingErrorLogger {
    fn error(&self, message: &str) {
        error!(fatal = false, "{message}");
    }

    fn fatal(&self, message: &str) {
        error!(fatal = true, "{message}");
    }
}

/// Returns the default sink.
pub fn default_error_logger() -> SharedErrorLogger {
    Arc::new(TracingErrorLogger)
}

/// Sink that keeps every line in memory.
///
/// Handy for tests and for embedding applications that surface transport
/// errors in their own UI.
#[derive(Debug, Default)]
pub struct CollectingLogger {
    lines: Mutex<Vec<LoggedLine>>,
}

/// One line recorded by [`CollectingLogger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedLine {
    pub fatal: bool,
    pub message: String,
}

impl CollectingLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded lines.
    pub fn lines(&self) -> Vec<LoggedLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// True if any recorded line contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.message.contains(needle))
    }

    fn push(&self, fatal: bool, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LoggedLine {
                fatal,
                message: message.to_string(),
            });
    }
}

impl ErrorLogger for CollectingLogger {
    fn error(&self, message: &str) {
        self.push(false, message);
    }

    fn fatal(&self, message: &str) {
        self.push(true, message);
    }
}
