//! Server configuration.

use slotwire_core::DEFAULT_FLUSH_BUDGET;

use crate::error::{ServerError, ServerResult};

/// Default per-connection cap on requests awaiting their response.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 1000;

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 32;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Requests a single connection may have in flight. A client going past
    /// it is disconnected.
    pub max_concurrent_requests: usize,

    /// Set `TCP_NODELAY` on accepted sockets.
    pub nodelay: bool,

    /// Back-to-back response batches before the flush task yields.
    pub flush_budget: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            nodelay: true,
            flush_budget: DEFAULT_FLUSH_BUDGET,
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with the given per-connection cap.
    pub fn new(max_concurrent_requests: usize) -> Self {
        Self {
            max_concurrent_requests,
            ..Default::default()
        }
    }

    /// Builder: set the per-connection cap.
    pub fn with_max_concurrent_requests(mut self, max: usize) -> Self {
        self.max_concurrent_requests = max;
        self
    }

    /// Builder: set `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Builder: set the flush budget.
    pub fn with_flush_budget(mut self, budget: u32) -> Self {
        self.flush_budget = budget;
        self
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.max_concurrent_requests == 0 {
            return Err(ServerError::config(
                "max_concurrent_requests must be greater than zero",
            ));
        }
        Ok(())
    }
}
