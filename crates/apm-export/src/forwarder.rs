//! Channel sink and the task forwarding its batches to exporters

use crate::BatchExporter;
use apm_core::{Payload, Sink, SinkError, SinkResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Batches buffered between the agent and the forwarder
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Create a connected sink/forwarder pair
pub fn channel(capacity: usize) -> (ChannelSink, Forwarder) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stats = Arc::new(ForwarderStats::default());

    (
        ChannelSink { tx },
        Forwarder {
            rx,
            exporters: Vec::new(),
            stats,
        },
    )
}

/// Non-blocking sink feeding a [`Forwarder`]
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Payload>,
}

impl Sink for ChannelSink {
    fn name(&self) -> &str {
        "channel"
    }

    fn send(&self, payload: &Payload) -> SinkResult<()> {
        self.tx.try_send(payload.clone()).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::Transport("export queue is full".to_string()),
            TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Forwarder counters
#[derive(Debug, Default)]
pub struct ForwarderStats {
    received: AtomicU64,
    exported: AtomicU64,
    failed: AtomicU64,
    last_export: LastExport,
}

/// Point-in-time copy of [`ForwarderStats`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ForwarderSnapshot {
    pub received: u64,
    pub exported: u64,
    pub failed: u64,
    pub last_export: Option<DateTime<Utc>>,
}

impl ForwarderStats {
    pub fn snapshot(&self) -> ForwarderSnapshot {
        ForwarderSnapshot {
            received: self.received.load(Ordering::Relaxed),
            exported: self.exported.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_export: self.last_export.get(),
        }
    }
}

/// Drains the channel into exporters until every [`ChannelSink`] is dropped
pub struct Forwarder {
    rx: mpsc::Receiver<Payload>,
    exporters: Vec<Arc<dyn BatchExporter>>,
    stats: Arc<ForwarderStats>,
}

impl Forwarder {
    pub fn add_exporter(&mut self, exporter: Arc<dyn BatchExporter>) {
        info!("Registered exporter: {}", exporter.name());
        self.exporters.push(exporter);
    }

    pub fn stats(&self) -> Arc<ForwarderStats> {
        self.stats.clone()
    }

    pub async fn run(mut self) {
        info!(exporters = self.exporters.len(), "Forwarder started");

        while let Some(payload) = self.rx.recv().await {
            self.stats.received.fetch_add(1, Ordering::Relaxed);
            debug!(kind = payload.kind(), items = payload.len(), "Forwarding batch");

            for exporter in &self.exporters {
                match exporter.export(&payload).await {
                    Ok(()) => {
                        self.stats.exported.fetch_add(1, Ordering::Relaxed);
                        self.stats.last_export.set(Utc::now());
                    }
                    Err(e) => {
                        self.stats.failed.fetch_add(1, Ordering::Relaxed);
                        warn!("Exporter {} failed: {}", exporter.name(), e);
                    }
                }
            }
        }

        for exporter in &self.exporters {
            if let Err(e) = exporter.flush().await {
                warn!("Exporter {} flush failed: {}", exporter.name(), e);
            }
        }

        info!("Forwarder stopped");
    }
}

const UNSET_MICROS: i64 = i64::MIN;

/// Time of the last successful export, stored as epoch microseconds
#[derive(Debug)]
struct LastExport(AtomicI64);

impl Default for LastExport {
    fn default() -> Self {
        Self(AtomicI64::new(UNSET_MICROS))
    }
}

impl LastExport {
    fn set(&self, at: DateTime<Utc>) {
        self.0.store(at.timestamp_micros(), Ordering::Relaxed);
    }

    fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Relaxed) {
            UNSET_MICROS => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }
}
