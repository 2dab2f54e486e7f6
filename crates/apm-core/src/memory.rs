//! Process memory sampling

use tracing::debug;

const BYTES_IN_A_MEGABYTE: f64 = 1024.0 * 1024.0;

/// A point-in-time reading of process resident memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    bytes: u64,
}

impl MemoryUsage {
    pub fn from_bytes(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Signed megabytes between `earlier` and this sample, rounded to 3 places
    pub fn used_difference_in_megabytes(&self, earlier: &MemoryUsage) -> f64 {
        let delta = self.bytes as f64 - earlier.bytes as f64;
        ((delta / BYTES_IN_A_MEGABYTE) * 1000.0).round() / 1000.0
    }
}

/// Memory reading primitive
pub trait MemorySampler: Send + Sync {
    fn sample(&self) -> MemoryUsage;
}

/// Resident set size of the current process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessMemory;

impl MemorySampler for ProcessMemory {
    fn sample(&self) -> MemoryUsage {
        MemoryUsage::from_bytes(resident_bytes().unwrap_or_else(|| {
            debug!("Resident memory unavailable on this platform");
            0
        }))
    }
}

#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    // statm: size resident shared text lib data dt (in pages)
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;

    // SAFETY: sysconf has no preconditions
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }

    Some(resident_pages * page_size as u64)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}
