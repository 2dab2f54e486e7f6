//! Export sinks for the APM agent
//!
//! The core hands batches to a synchronous [`apm_core::Sink`]. This crate
//! bridges that to asynchronous exporters: a [`ChannelSink`] queues batches
//! on a bounded channel and a [`Forwarder`] task drains it into every
//! registered [`BatchExporter`].

use apm_core::Payload;
use async_trait::async_trait;
use thiserror::Error;

pub mod forwarder;

#[cfg(feature = "jsonl")]
pub mod jsonl;

#[cfg(feature = "webhook")]
pub mod webhook;

pub use forwarder::{
    channel, ChannelSink, Forwarder, ForwarderSnapshot, ForwarderStats, DEFAULT_CHANNEL_CAPACITY,
};

#[cfg(feature = "jsonl")]
pub use jsonl::{JsonlExporter, JsonlExporterConfig};

#[cfg(feature = "webhook")]
pub use webhook::{WebhookAuth, WebhookExporter, WebhookExporterConfig};

/// Export errors
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    #[error("Export failed: {0}")]
    OperationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ExportResult<T> = Result<T, ExportError>;

/// Destination for batches drained from the channel
#[async_trait]
pub trait BatchExporter: Send + Sync {
    /// Exporter name, for logs
    fn name(&self) -> &str;

    async fn export(&self, payload: &Payload) -> ExportResult<()>;

    /// Flush anything buffered
    async fn flush(&self) -> ExportResult<()> {
        Ok(())
    }
}
