//! Wire protocol for slotwire: frame headers, batch framing and the
//! schema-driven binary codec.
//!
//! # Frames
//!
//! Every message travels as a fixed header followed by its payload, all
//! little-endian:
//!
//! ```text
//! request:  [id:u32][kind:u8][size:u16][payload]
//! response: [id:u32][kind:u8][status:u8][size:u16][payload if status == 0]
//! ```
//!
//! Several frames are batched back-to-back into one socket write.
//!
//! # Example
//!
//! ```rust
//! use slotwire_protocol::{Catalog, FrameReader, FrameWriter, RequestHeader, wire_message};
//!
//! wire_message! {
//!     #[derive(Debug, Clone, PartialEq)]
//!     pub struct Greet {
//!         pub name: String,
//!     }
//! }
//!
//! let catalog = Catalog::builder().request::<Greet>().build().unwrap();
//! let kind = catalog.requests().kind_of::<Greet>().unwrap();
//! let message = Greet { name: "ada".into() };
//!
//! let mut batch = FrameWriter::<RequestHeader>::new();
//! batch
//!     .push(RequestHeader::new(1, kind), |w| catalog.requests().pack(kind, &message, w))
//!     .unwrap();
//!
//! let mut reader = FrameReader::<RequestHeader>::new();
//! reader.extend_from_slice(batch.as_bytes());
//! let frame = reader.next_frame().unwrap().unwrap();
//! let decoded = catalog.requests().decode(frame.header.kind, &frame.payload).unwrap();
//! assert_eq!(decoded.downcast_ref::<Greet>(), Some(&message));
//! ```

pub mod codec;
mod error;
mod framing;
mod status;

pub use codec::{Catalog, CatalogBuilder, Composite, Ping, Pong, Reader, Registry, Wire, Writer};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{
    Frame, FrameHeader, FrameReader, FrameWriter, MAX_PAYLOAD_SIZE, NO_RESPONSE_ID, RequestHeader,
    ResponseHeader,
};
pub use status::StatusCode;
