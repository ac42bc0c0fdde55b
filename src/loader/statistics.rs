//! Loader statistics
//!
//! Counters are accumulated (added) into a caller-owned `Statistics`, so the
//! totals of several loaders can be summed into one value.

use serde::Serialize;
use std::time::Duration;

/// Per-device transfer and memory totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceStatistics {
    /// Device index
    pub device: u32,

    /// Device memory held by page tables and fault buffers
    pub memory_used: u64,

    /// Bytes written to device page tables
    pub bytes_uploaded: u64,

    /// Bytes read back from fault buffers
    pub bytes_read_back: u64,

    /// Pages staged or resident across the device's contexts
    pub resident_pages: u64,
}

/// Loader-wide totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Statistics {
    /// Time spent reading back faults and dispatching fills
    pub request_processing_time: Duration,

    /// Resources created
    pub num_resources: u32,

    /// Textures created (variants included)
    pub num_textures: u32,

    /// Fills that staged a mapping
    pub pages_filled: u64,

    /// Fills skipped because a racing fill won
    pub pages_already_resident: u64,

    /// Fills the callback deferred
    pub pages_deferred: u64,

    /// Fills that failed or panicked
    pub pages_failed: u64,

    /// Device-reported pages outside every allocated range
    pub pages_rejected: u64,

    /// Faults lost to fault buffer overflow
    pub faults_overflowed: u64,

    /// Pages reclaimed by LRU eviction
    pub pages_evicted: u64,

    /// Pages discarded by invalidation
    pub pages_invalidated: u64,

    /// Number of `push_mappings` calls
    pub num_pushes: u64,

    /// Number of `pull_requests` calls
    pub num_pulls: u64,

    /// Per-device totals, ordered by device index
    pub per_device: Vec<DeviceStatistics>,
}

impl Statistics {
    /// Entry for `device`, inserted in index order if missing
    pub fn device_mut(&mut self, device: u32) -> &mut DeviceStatistics {
        let index = match self.per_device.binary_search_by_key(&device, |d| d.device) {
            Ok(index) => index,
            Err(index) => {
                self.per_device.insert(
                    index,
                    DeviceStatistics {
                        device,
                        ..DeviceStatistics::default()
                    },
                );
                index
            }
        };
        &mut self.per_device[index]
    }

    /// Device memory used across all devices
    #[must_use]
    pub fn total_memory_used(&self) -> u64 {
        self.per_device.iter().map(|d| d.memory_used).sum()
    }

    /// Bytes moved in either direction across all devices
    #[must_use]
    pub fn total_bytes_transferred(&self) -> u64 {
        self.per_device
            .iter()
            .map(|d| d.bytes_uploaded + d.bytes_read_back)
            .sum()
    }
}
