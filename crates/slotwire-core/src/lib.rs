//! Shared plumbing for the slotwire transport: tracing setup, the injected
//! error sink, and the flush budget used by send loops.

pub mod budget;
pub mod logger;
pub mod tracing;

pub use budget::{DEFAULT_FLUSH_BUDGET, FlushBudget};
pub use logger::{
    CollectingLogger, ErrorLogger, LoggedLine, SharedErrorLogger, TracingErrorLogger,
    default_error_logger,
};
pub use self::tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
