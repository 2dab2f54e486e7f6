//! APM Core - request tracing, command batching and error capture
//!
//! This crate provides the in-process bookkeeping of the APM agent:
//!
//! - **Request**: the span tree for one unit of work, rendered into a command batch
//! - **Errors**: exception capture, batching and threshold flushing
//! - **Config**: layered key/value configuration with documented defaults
//! - **Sink**: the seam through which batches leave the process

pub mod agent;
pub mod clock;
pub mod command;
pub mod config;
pub mod errors;
pub mod host;
pub mod id;
pub mod logging;
pub mod memory;
pub mod metadata;
pub mod request;
pub mod sink;
pub mod timer;
pub mod uri;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export commonly used types
pub use agent::Agent;
pub use clock::{Clock, SystemClock};
pub use command::{BatchCommand, Payload, TagValue, WireCommand};
pub use config::{Config, ConfigKey, ConfigLoader};
pub use errors::{CapturedException, ErrorEvent, ErrorHandling, LastError};
pub use id::{RequestId, SpanId};
pub use memory::{MemorySampler, MemoryUsage, ProcessMemory};
pub use metadata::RequestMetadata;
pub use request::{Request, Span, SpanIndex, TraceError, TraceResult};
pub use sink::{Sink, SinkError, SinkResult};
pub use timer::{Timer, TimerError};

/// Agent version reported alongside batches
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
