//! The seam through which batches leave the process
//!
//! Both request command batches and error batches go through a [`Sink`].
//! Callers in this crate never propagate sink failures into application
//! code: they log them and drop the batch.

use crate::command::Payload;
use std::sync::Arc;
use thiserror::Error;

/// Sink errors
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Sink is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SinkResult<T> = Result<T, SinkError>;

/// Accepts serialized batches for transmission to the collector
pub trait Sink: Send + Sync {
    /// Sink name, for logs
    fn name(&self) -> &str;

    /// Hand over one batch. Must not block on the network for long.
    fn send(&self, payload: &Payload) -> SinkResult<()>;
}

impl<S: Sink + ?Sized> Sink for Arc<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn send(&self, payload: &Payload) -> SinkResult<()> {
        (**self).send(payload)
    }
}

/// Sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl Sink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn send(&self, _payload: &Payload) -> SinkResult<()> {
        Ok(())
    }
}
