//! Client error types.

use std::io;

use slotwire_core::TracingError;
use slotwire_protocol::{ProtocolError, StatusCode};
use slotwire_server::ServerError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by the client's control surface and the CLI.
///
/// Individual requests never fail with this type; they resolve with a
/// [`CallError`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol error (bad catalog, unknown message type).
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Error from the embedded server (CLI `serve`).
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// Tracing could not be initialized.
    #[error("tracing error: {0}")]
    Tracing(#[from] TracingError),

    /// The demo server could not bind its port.
    #[error("could not listen on port {port}")]
    Listen { port: u16 },

    /// `connect` was called while the client was not disconnected.
    #[error("a connection is already established or in progress")]
    ConnectInProgress,

    /// The TCP connection could not be established.
    #[error("could not connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Why a request did not produce a response.
///
/// One variant per non-success [`StatusCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum CallError {
    /// Local encode/decode failure, oversize message or unexpected response
    /// type.
    #[error("internal error")]
    InternalError,

    /// The request's slot was still occupied by an earlier request.
    #[error("request queue overflow")]
    RequestQueueOverflow,

    /// The connection was closed (or never open) before the response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("remote service internal error")]
    RemoteServiceInternalError,

    #[error("remote service external error")]
    RemoteServiceExternalError,
}

impl CallError {
    pub const fn status(self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::InternalError,
            Self::RequestQueueOverflow => StatusCode::RequestQueueOverflow,
            Self::ConnectionClosed => StatusCode::ConnectionClosed,
            Self::RemoteServiceInternalError => StatusCode::RemoteServiceInternalError,
            Self::RemoteServiceExternalError => StatusCode::RemoteServiceExternalError,
        }
    }
}

impl From<CallError> for StatusCode {
    fn from(err: CallError) -> Self {
        err.status()
    }
}

impl TryFrom<StatusCode> for CallError {
    /// `Success` has no error counterpart and is handed back.
    type Error = StatusCode;

    fn try_from(status: StatusCode) -> Result<Self, Self::Error> {
        match status {
            StatusCode::Success => Err(status),
            StatusCode::InternalError => Ok(Self::InternalError),
            StatusCode::RequestQueueOverflow => Ok(Self::RequestQueueOverflow),
            StatusCode::ConnectionClosed => Ok(Self::ConnectionClosed),
            StatusCode::RemoteServiceInternalError => Ok(Self::RemoteServiceInternalError),
            StatusCode::RemoteServiceExternalError => Ok(Self::RemoteServiceExternalError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_error_maps_every_failure_status() {
        for byte in 1..=5u8 {
            let status = StatusCode::try_from(byte).unwrap();
            let err = CallError::try_from(status).unwrap();
            assert_eq!(StatusCode::from(err), status);
            assert_eq!(err.to_string(), status.to_string());
        }
        assert_eq!(
            CallError::try_from(StatusCode::Success),
            Err(StatusCode::Success)
        );
    }

    #[test]
    fn connect_error_names_the_address() {
        let err = ClientError::Connect {
            addr: "127.0.0.1:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().starts_with("could not connect to 127.0.0.1:1"));
    }
}
