//! Per-context device memory manager
//!
//! Owns the fault-buffer slots of one context and tracks the device memory
//! and transfer volume attributed to it.

use super::statistics::DeviceStatistics;
use crate::paging::device_table::{SlotLease, SlotPool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Device memory bookkeeping for one accelerator context
#[derive(Debug)]
pub struct DeviceMemoryManager {
    device: u32,
    slots: Arc<SlotPool>,
    table_bytes: u64,
    bytes_uploaded: AtomicU64,
    bytes_read_back: AtomicU64,
}

impl DeviceMemoryManager {
    pub(crate) fn new(device: u32, num_slots: usize, table_bytes: u64) -> Self {
        Self {
            device,
            slots: SlotPool::new(num_slots),
            table_bytes,
            bytes_uploaded: AtomicU64::new(0),
            bytes_read_back: AtomicU64::new(0),
        }
    }

    /// Lease a free fault-buffer slot for one launch
    pub(crate) fn allocate_device_context(&self) -> Option<SlotLease> {
        self.slots.acquire()
    }

    /// Slots not currently leased
    #[must_use]
    pub fn available_device_contexts(&self) -> usize {
        self.slots.available()
    }

    /// Device index
    #[must_use]
    pub const fn device(&self) -> u32 {
        self.device
    }

    /// Device memory held by the page table and fault buffers
    #[must_use]
    pub const fn memory_used(&self) -> u64 {
        self.table_bytes
    }

    pub(crate) fn record_upload(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_read_back(&self, bytes: u64) {
        self.bytes_read_back.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add this context's totals to `stats`
    pub fn accumulate(&self, stats: &mut DeviceStatistics) {
        stats.memory_used += self.table_bytes;
        stats.bytes_uploaded += self.bytes_uploaded.load(Ordering::Relaxed);
        stats.bytes_read_back += self.bytes_read_back.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_return_on_drop() {
        let memory = DeviceMemoryManager::new(0, 2, 1024);
        let a = memory.allocate_device_context().unwrap();
        let b = memory.allocate_device_context().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(memory.allocate_device_context().is_none());

        drop(a);
        assert_eq!(memory.available_device_contexts(), 1);
        assert!(memory.allocate_device_context().is_some());
    }

    #[test]
    fn test_accumulate_adds_totals() {
        let memory = DeviceMemoryManager::new(1, 1, 100);
        memory.record_upload(40);
        memory.record_read_back(8);

        let mut stats = DeviceStatistics {
            device: 1,
            memory_used: 10,
            ..DeviceStatistics::default()
        };
        memory.accumulate(&mut stats);
        assert_eq!(stats.memory_used, 110);
        assert_eq!(stats.bytes_uploaded, 40);
        assert_eq!(stats.bytes_read_back, 8);
    }
}
