//! Deterministic collaborators for tests

use crate::clock::Clock;
use crate::command::Payload;
use crate::memory::{MemorySampler, MemoryUsage};
use crate::sink::{Sink, SinkError, SinkResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Clock that only moves when told to
#[derive(Debug)]
pub struct FixedClock {
    bits: AtomicU64,
}

impl FixedClock {
    pub fn new(now: f64) -> Self {
        Self {
            bits: AtomicU64::new(now.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: f64) {
        self.set(self.now() + seconds);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}

/// Memory sampler returning whatever was last set
#[derive(Debug, Default)]
pub struct FixedMemory {
    bytes: AtomicU64,
}

impl FixedMemory {
    pub fn new(bytes: u64) -> Self {
        Self {
            bytes: AtomicU64::new(bytes),
        }
    }

    pub fn set(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::SeqCst);
    }
}

impl MemorySampler for FixedMemory {
    fn sample(&self) -> MemoryUsage {
        MemoryUsage::from_bytes(self.bytes.load(Ordering::SeqCst))
    }
}

/// Sink that keeps every payload it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<Payload>>,
    failing: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail with a transport error
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Payload> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn send(&self, payload: &Payload) -> SinkResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SinkError::Transport("collector unreachable".to_string()));
        }
        self.sent.lock().push(payload.clone());
        Ok(())
    }
}
