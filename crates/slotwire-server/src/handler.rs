//! Handler table keyed by request kind.

use std::any::Any;
use std::sync::OnceLock;

use slotwire_protocol::{Pong, ProtocolError, Registry};

use crate::error::{ServerError, ServerResult};
use crate::responder::Responder;

/// A type-erased request handler.
pub(crate) type ErasedHandler = Box<dyn Fn(Box<dyn Any + Send>, Responder) + Send + Sync>;

/// One write-once handler cell per request kind.
pub(crate) struct HandlerTable {
    cells: Vec<OnceLock<ErasedHandler>>,
}

impl HandlerTable {
    /// Creates a table sized for `requests`, with the keepalive handler
    /// already in place.
    pub(crate) fn new(requests: &Registry) -> Self {
        let table = Self {
            cells: (0..requests.len()).map(|_| OnceLock::new()).collect(),
        };
        // A fresh table has every cell empty.
        let _ = table.cells[usize::from(requests.ping_kind())]
            .set(Box::new(|_: Box<dyn Any + Send>, responder: Responder| {
                responder.send(Pong {});
            }));
        table
    }

    pub(crate) fn register(
        &self,
        kind: u8,
        name: &'static str,
        handler: ErasedHandler,
    ) -> ServerResult<()> {
        let cell = self
            .cells
            .get(usize::from(kind))
            .ok_or(ProtocolError::UnknownKind {
                direction: "request",
                kind,
            })?;
        cell.set(handler)
            .map_err(|_| ServerError::HandlerExists { name })
    }

    pub(crate) fn get(&self, kind: u8) -> Option<&ErasedHandler> {
        self.cells.get(usize::from(kind)).and_then(OnceLock::get)
    }
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<usize> = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(kind, _)| kind)
            .collect();
        f.debug_struct("HandlerTable")
            .field("registered", &registered)
            .finish()
    }
}
