//! Demo service used by `slotwire serve` and `slotwire bench`.

use std::sync::Arc;

use slotwire_protocol::{Catalog, ProtocolResult, wire_message};
use slotwire_server::{Server, ServerResult};

wire_message! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProcessStringRequest {
        pub source_string: String,
    }
}

wire_message! {
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ProcessStringResponse {
        pub processed_string: String,
    }
}

/// Catalog shared by the demo server and clients.
pub fn catalog() -> ProtocolResult<Arc<Catalog>> {
    Catalog::builder()
        .request::<ProcessStringRequest>()
        .response::<ProcessStringResponse>()
        .build()
}

pub fn process_string(request: ProcessStringRequest) -> ProcessStringResponse {
    ProcessStringResponse {
        processed_string: format!("{}_processed", request.source_string),
    }
}

/// Registers the `ProcessString` handler on `server`.
pub fn register_handlers(server: &Server) -> ServerResult<()> {
    server.set_handler(|request: ProcessStringRequest, responder| {
        responder.send(process_string(request));
    })
}
