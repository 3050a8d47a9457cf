//! Client side of the slotwire transport, plus the `slotwire` CLI.
//!
//! A [`Client`] drives one TCP connection. Requests are pipelined: each
//! takes a slot in a fixed-size table, its wire id is the slot index, and
//! responses may come back in any order. Queued requests are packed into
//! batches so that many requests share one socket write.
//!
//! Every request resolves exactly once, either with its response or with a
//! [`CallError`]. When a connection ends, whether closed locally, dropped by
//! the server, timed out by the keepalive or torn down on a corrupt frame,
//! all pending requests resolve with [`CallError::ConnectionClosed`].
//!
//! Clients created through a [`ClientManager`] are pinged when idle and
//! disconnected when a ping goes unanswered.
//!
//! # Example
//!
//! ```rust,no_run
//! use slotwire_client::demo::{self, ProcessStringRequest, ProcessStringResponse};
//! use slotwire_client::{ClientConfig, ClientManager};
//! use slotwire_core::default_error_logger;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = ClientManager::new(ClientConfig::default(), default_error_logger())?;
//!     let client = manager.create_client(demo::catalog()?)?;
//!     client.connect("127.0.0.1:7000").await?;
//!
//!     let response: ProcessStringResponse = client
//!         .send_request(ProcessStringRequest { source_string: "abc".into() })
//!         .await?;
//!     assert_eq!(response.processed_string, "abc_processed");
//!     Ok(())
//! }
//! ```

pub mod cli;
mod client;
pub mod commands;
pub mod config;
pub mod demo;
pub mod error;
mod keepalive;
mod response;
mod slots;

pub use cli::Cli;
pub use client::{Client, ConnectionState};
pub use config::{ClientConfig, KeepaliveSettings};
pub use error::{CallError, ClientError, ClientResult};
pub use keepalive::{ClientManager, KeepaliveCommand};
pub use response::ResponseFuture;
