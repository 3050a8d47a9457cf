//! Server side of the slotwire transport.
//!
//! A [`Server`] listens on a TCP port and runs two tasks per accepted
//! connection:
//! - a read task that reassembles request frames, enforces the
//!   per-connection concurrency cap and calls the registered handler inline
//! - a flush task that batches replies into as few socket writes as possible
//!
//! Handlers answer through a [`Responder`]. Connection-level failures
//! (corrupt frames, a client over its cap, a request nobody handles) close
//! that connection and are reported to the injected error logger.
//!
//! # Example
//!
//! ```rust,no_run
//! use slotwire_core::default_error_logger;
//! use slotwire_protocol::{Catalog, wire_message};
//! use slotwire_server::{DEFAULT_BACKLOG, Server, ServerConfig};
//!
//! wire_message! {
//!     pub struct Shout { pub text: String }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Catalog::builder().request::<Shout>().response::<Shout>().build()?;
//!     let server = Server::new(catalog, ServerConfig::default(), default_error_logger())?;
//!     server.set_handler(|shout: Shout, responder| {
//!         responder.send(Shout { text: shout.text.to_uppercase() });
//!     })?;
//!
//!     if !server.listen(7000, DEFAULT_BACKLOG).await {
//!         return Err("port 7000 unavailable".into());
//!     }
//!     tokio::signal::ctrl_c().await?;
//!     server.stop()?;
//!     Ok(())
//! }
//! ```

mod config;
mod connection;
mod error;
mod handler;
mod responder;
mod server;
#[cfg(test)]
mod testing;

pub use config::{DEFAULT_BACKLOG, DEFAULT_MAX_CONCURRENT_REQUESTS, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use responder::Responder;
pub use server::Server;
