//! Server error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors returned by the server's control surface.
///
/// Failures on individual connections never surface here; they go to the
/// injected error logger.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error (bind, listen).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (unknown message type, bad catalog).
    #[error("Protocol error: {0}")]
    Protocol(#[from] slotwire_protocol::ProtocolError),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A handler is already registered for this request type.
    #[error("Handler already registered for {name}")]
    HandlerExists { name: &'static str },

    /// `listen` was called while a listener is active.
    #[error("Server is already listening on {addr}")]
    AlreadyListening { addr: SocketAddr },

    /// `stop` was called without an active listener.
    #[error("Server is not listening")]
    NotListening,
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
