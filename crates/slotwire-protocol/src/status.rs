//! Response status codes.

use std::fmt;

use crate::error::ProtocolError;

/// Status byte carried by every response frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Success = 0,
    /// Local encode/decode failure or oversize message.
    InternalError = 1,
    /// The slot for this request was still occupied.
    RequestQueueOverflow = 2,
    /// The connection went away before the response arrived.
    ConnectionClosed = 3,
    RemoteServiceInternalError = 4,
    RemoteServiceExternalError = 5,
}

impl StatusCode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl TryFrom<u8> for StatusCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::InternalError),
            2 => Ok(Self::RequestQueueOverflow),
            3 => Ok(Self::ConnectionClosed),
            4 => Ok(Self::RemoteServiceInternalError),
            5 => Ok(Self::RemoteServiceExternalError),
            other => Err(ProtocolError::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "success",
            Self::InternalError => "internal error",
            Self::RequestQueueOverflow => "request queue overflow",
            Self::ConnectionClosed => "connection closed",
            Self::RemoteServiceInternalError => "remote service internal error",
            Self::RemoteServiceExternalError => "remote service external error",
        };
        f.write_str(name)
    }
}
