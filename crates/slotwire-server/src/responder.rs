//! Reply handle given to request handlers.

use std::any::{Any, type_name};
use std::net::SocketAddr;
use std::sync::Arc;

use slotwire_protocol::{StatusCode, Wire};
use tracing::trace;

use crate::connection::ConnectionContext;

/// Reply queued on a connection's response queue.
pub(crate) struct Outgoing {
    pub(crate) id: u32,
    pub(crate) reply: Reply,
}

pub(crate) enum Reply {
    Success {
        kind: u8,
        message: Box<dyn Any + Send>,
    },
    Failure(StatusCode),
}

/// Answers exactly one request.
///
/// Each answering method consumes the responder. A responder dropped without
/// an answer logs an error and replies `RemoteServiceInternalError`, so the
/// caller is never left waiting and the connection's concurrency slot is
/// released. A responder may be moved to another task and answered later.
pub struct Responder {
    id: u32,
    connection: Arc<ConnectionContext>,
    answered: bool,
}

impl Responder {
    pub(crate) fn new(id: u32, connection: Arc<ConnectionContext>) -> Self {
        Self {
            id,
            connection,
            answered: false,
        }
    }

    /// Wire id of the request being answered.
    pub fn request_id(&self) -> u32 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer()
    }

    /// Sends a typed success response.
    ///
    /// A response type missing from the catalog is logged as fatal and
    /// answered with `RemoteServiceInternalError` instead.
    pub fn send<R: Wire>(mut self, response: R) {
        let reply = match self.connection.catalog().responses().kind_of::<R>() {
            Ok(kind) => Reply::Success {
                kind,
                message: Box::new(response),
            },
            Err(err) => {
                self.connection.logger().fatal(&format!(
                    "could not send {} to {}: {err}",
                    type_name::<R>(),
                    self.connection.peer()
                ));
                Reply::Failure(StatusCode::RemoteServiceInternalError)
            }
        };
        self.answer(reply);
    }

    /// Signals a failure inside the service.
    pub fn internal_error(mut self) {
        self.answer(Reply::Failure(StatusCode::RemoteServiceInternalError));
    }

    /// Signals a failure caused by something outside the service.
    pub fn external_error(mut self) {
        self.answer(Reply::Failure(StatusCode::RemoteServiceExternalError));
    }

    fn answer(&mut self, reply: Reply) {
        self.answered = true;
        if !self.connection.enqueue(Outgoing { id: self.id, reply }) {
            trace!(id = self.id, "connection gone, reply dropped");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.answered {
            return;
        }
        self.connection.logger().error(&format!(
            "request {} from {} was dropped without a response",
            self.id,
            self.connection.peer()
        ));
        self.answer(Reply::Failure(StatusCode::RemoteServiceInternalError));
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("id", &self.id)
            .field("peer", &self.connection.peer())
            .field("answered", &self.answered)
            .finish()
    }
}
