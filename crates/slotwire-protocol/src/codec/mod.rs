//! Schema-driven binary codec.

mod catalog;
mod schema;
mod wire;

pub use catalog::{Catalog, CatalogBuilder, MAX_KINDS, Ping, Pong, Registry};
pub use schema::{Composite, Field, MAX_SCHEMA_DEPTH, Schema};
pub use wire::{FieldKind, Reader, Wire, Writer};
