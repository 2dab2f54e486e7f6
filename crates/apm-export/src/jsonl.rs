//! JSONL file exporter
//!
//! Writes one batch envelope per line, in the same JSON the collector
//! receives.

use crate::{BatchExporter, ExportError, ExportResult};
use apm_core::Payload;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::info;

/// JSONL exporter configuration
#[derive(Debug, Clone)]
pub struct JsonlExporterConfig {
    /// Output file path
    pub path: PathBuf,

    /// Whether to append to existing file
    pub append: bool,

    /// Flush after each write
    pub flush_each: bool,
}

impl Default for JsonlExporterConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/apm-batches.jsonl"),
            append: true,
            flush_each: true,
        }
    }
}

/// JSONL file exporter
pub struct JsonlExporter {
    config: JsonlExporterConfig,
    writer: Mutex<BufWriter<File>>,
    batches_written: AtomicU64,
}

impl JsonlExporter {
    pub fn new(config: JsonlExporterConfig) -> ExportResult<Self> {
        let file = if config.append {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?
        } else {
            File::create(&config.path)?
        };

        info!("JSONL exporter writing to: {:?}", config.path);

        Ok(Self {
            config,
            writer: Mutex::new(BufWriter::new(file)),
            batches_written: AtomicU64::new(0),
        })
    }

    pub fn batches_written(&self) -> u64 {
        self.batches_written.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BatchExporter for JsonlExporter {
    fn name(&self) -> &str {
        "jsonl-exporter"
    }

    async fn export(&self, payload: &Payload) -> ExportResult<()> {
        let json = serde_json::to_string(payload)?;

        let mut w = self
            .writer
            .lock()
            .map_err(|e| ExportError::OperationFailed(format!("Lock poisoned: {}", e)))?;

        writeln!(w, "{}", json)?;

        if self.config.flush_each {
            w.flush()?;
        }

        self.batches_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn flush(&self) -> ExportResult<()> {
        let mut w = self
            .writer
            .lock()
            .map_err(|e| ExportError::OperationFailed(format!("Lock poisoned: {}", e)))?;
        w.flush()?;
        Ok(())
    }
}
