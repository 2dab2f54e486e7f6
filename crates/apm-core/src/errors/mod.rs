//! Exception capture and error batching
//!
//! Exceptions are reduced to a [`CapturedException`], snapshotted with the
//! current request context into an [`ErrorEvent`], queued by
//! [`ErrorHandling`] and sent to the sink as one `ErrorBatch` whenever the
//! queue reaches the configured threshold or is flushed explicitly.

mod event;
mod handling;
mod panic;

pub use event::{
    CapturedException, ErrorContext, ErrorEvent, ErrorRecord, RequestComponents, StackFrame,
    PANIC_CLASS,
};
pub(crate) use handling::run_previous;
pub use handling::{
    ErrorCategory, ErrorHandling, LastError, PreviousHandler, SharedPreviousHandler,
    FATAL_ERROR_CLASS,
};
pub use panic::install_panic_hook;
