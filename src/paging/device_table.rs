//! Device-visible page table and fault buffers
//!
//! The table is the producer/consumer boundary between kernels and the host:
//! kernels read residency bits and entry words and append faulting page ids
//! to a fixed-capacity buffer; the host writes the table only from
//! `push_mappings` and drains fault buffers only from `pull_requests`.
//!
//! Each accelerator context has `max_active_streams` fault buffers ("slots").
//! A `DeviceContext` leases one slot for a launch; the slot returns to the
//! pool when the last clone of the context drops.

use super::device::Stream;
use crate::error::PagingError;
use crate::options::Options;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// One staged mapping uploaded by a push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMapping {
    /// Logical page index
    pub page: u32,

    /// Entry word (ignored for unbacked pages)
    pub entry: u64,
}

/// Faults drained from one slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultBatch {
    /// Faulting page ids in arrival order (may contain pages refreshed for LRU)
    pub pages: Vec<u32>,

    /// Faults dropped because the buffer was full
    pub overflowed: u32,

    /// Bytes copied back from device memory
    pub bytes_read_back: u64,
}

/// Device-side page table of one accelerator context
pub trait DevicePageTable: Send + Sync + fmt::Debug {
    /// Apply unmaps then mappings, and reset the fault buffer of `slot`
    ///
    /// Returns the number of bytes uploaded.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Device` if the upload fails
    fn apply(
        &self,
        slot: usize,
        mappings: &[PageMapping],
        unmaps: &[u32],
    ) -> Result<u64, PagingError>;

    /// Drain the fault buffer of `slot`
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Device` if readback fails
    fn take_requests(&self, slot: usize) -> Result<FaultBatch, PagingError>;

    /// Kernel-side lookup: the entry if `page` is resident, else record a fault
    ///
    /// Resident pages are also recorded when `request_if_resident` is set so
    /// the host can refresh their LRU stamps.
    fn map_or_request(&self, slot: usize, page: u32, request_if_resident: bool) -> Option<u64>;

    /// Device memory held by the table and its fault buffers
    fn memory_bytes(&self) -> u64;

    /// Downcast support for backend-specific access
    fn as_any(&self) -> &dyn Any;
}

fn num_words(bits: u32) -> usize {
    bits.div_ceil(32) as usize
}

fn bit(page: u32) -> (usize, u32) {
    ((page / 32) as usize, 1 << (page % 32))
}

#[derive(Debug)]
struct FaultBuffer {
    requested: Box<[AtomicU32]>,
    pages: Box<[AtomicU32]>,
    len: AtomicU32,
    overflowed: AtomicU32,
}

impl FaultBuffer {
    fn new(num_pages: u32, capacity: u32) -> Self {
        Self {
            requested: (0..num_words(num_pages)).map(|_| AtomicU32::new(0)).collect(),
            pages: (0..capacity).map(|_| AtomicU32::new(0)).collect(),
            len: AtomicU32::new(0),
            overflowed: AtomicU32::new(0),
        }
    }

    fn record(&self, page: u32) {
        let (word, mask) = bit(page);
        if self.requested[word].fetch_or(mask, Ordering::AcqRel) & mask != 0 {
            return;
        }
        let index = self.len.fetch_add(1, Ordering::AcqRel) as usize;
        if let Some(slot) = self.pages.get(index) {
            slot.store(page, Ordering::Release);
        } else {
            // Full: forget the request so the page faults again next launch.
            self.requested[word].fetch_and(!mask, Ordering::AcqRel);
            self.overflowed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Callers guarantee no launch is writing to this buffer.
    fn drain(&self) -> FaultBatch {
        let len = (self.len.swap(0, Ordering::AcqRel) as usize).min(self.pages.len());
        let pages: Vec<u32> = self.pages[..len]
            .iter()
            .map(|p| p.load(Ordering::Acquire))
            .collect();
        for &page in &pages {
            let (word, mask) = bit(page);
            self.requested[word].fetch_and(!mask, Ordering::AcqRel);
        }
        FaultBatch {
            bytes_read_back: (len as u64 + 1) * 4,
            pages,
            overflowed: self.overflowed.swap(0, Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for word in self.requested.iter() {
            word.store(0, Ordering::Relaxed);
        }
        self.len.store(0, Ordering::Release);
        self.overflowed.store(0, Ordering::Relaxed);
    }

    fn bytes(&self) -> u64 {
        (self.requested.len() as u64 + self.pages.len() as u64 + 1) * 4
    }
}

/// Page table held in host memory with device-style atomics
#[derive(Debug)]
pub struct HostPageTable {
    num_pages: u32,
    num_backed: u32,
    resident: Box<[AtomicU32]>,
    entries: Box<[AtomicU64]>,
    fault_buffers: Box<[FaultBuffer]>,
}

impl HostPageTable {
    /// Table sized by `options`, one fault buffer per active stream
    #[must_use]
    pub fn new(options: &Options) -> Self {
        Self {
            num_pages: options.num_pages,
            num_backed: options.num_page_table_entries,
            resident: (0..num_words(options.num_pages))
                .map(|_| AtomicU32::new(0))
                .collect(),
            entries: (0..options.num_page_table_entries)
                .map(|_| AtomicU64::new(0))
                .collect(),
            fault_buffers: (0..options.max_active_streams)
                .map(|_| FaultBuffer::new(options.num_pages, options.max_requested_pages))
                .collect(),
        }
    }

    /// Whether the device view has `page` resident
    #[must_use]
    pub fn is_resident(&self, page: u32) -> bool {
        if page >= self.num_pages {
            return false;
        }
        let (word, mask) = bit(page);
        self.resident[word].load(Ordering::Acquire) & mask != 0
    }

    /// Entry word of `page` as kernels observe it (0 for unbacked pages)
    #[must_use]
    pub fn entry(&self, page: u32) -> u64 {
        self.entries
            .get(page as usize)
            .map_or(0, |e| e.load(Ordering::Acquire))
    }

    /// Residency bitset words, for mirroring into device buffers
    pub(crate) fn residency_word(&self, word: usize) -> u32 {
        self.resident[word].load(Ordering::Acquire)
    }

    /// Number of backed pages
    #[must_use]
    pub const fn num_backed(&self) -> u32 {
        self.num_backed
    }

    fn apply_local(&self, slot: usize, mappings: &[PageMapping], unmaps: &[u32]) -> u64 {
        let mut bytes = 0;
        for &page in unmaps.iter().filter(|&&p| p < self.num_pages) {
            let (word, mask) = bit(page);
            self.resident[word].fetch_and(!mask, Ordering::AcqRel);
            if let Some(entry) = self.entries.get(page as usize) {
                entry.store(0, Ordering::Release);
            }
            bytes += 4;
        }
        for mapping in mappings.iter().filter(|m| m.page < self.num_pages) {
            if let Some(entry) = self.entries.get(mapping.page as usize) {
                entry.store(mapping.entry, Ordering::Release);
                bytes += 8;
            }
            let (word, mask) = bit(mapping.page);
            self.resident[word].fetch_or(mask, Ordering::AcqRel);
            bytes += 4;
        }
        if let Some(buffer) = self.fault_buffers.get(slot) {
            buffer.reset();
        }
        bytes
    }
}

impl DevicePageTable for HostPageTable {
    fn apply(
        &self,
        slot: usize,
        mappings: &[PageMapping],
        unmaps: &[u32],
    ) -> Result<u64, PagingError> {
        Ok(self.apply_local(slot, mappings, unmaps))
    }

    fn take_requests(&self, slot: usize) -> Result<FaultBatch, PagingError> {
        self.fault_buffers
            .get(slot)
            .map(FaultBuffer::drain)
            .ok_or_else(|| PagingError::Device(format!("fault buffer slot {slot} out of range")))
    }

    fn map_or_request(&self, slot: usize, page: u32, request_if_resident: bool) -> Option<u64> {
        if page >= self.num_pages {
            return None;
        }
        let resident = self.is_resident(page);
        if !resident || request_if_resident {
            if let Some(buffer) = self.fault_buffers.get(slot) {
                buffer.record(page);
            }
        }
        resident.then(|| self.entry(page))
    }

    fn memory_bytes(&self) -> u64 {
        self.resident.len() as u64 * 4
            + self.entries.len() as u64 * 8
            + self.fault_buffers.iter().map(FaultBuffer::bytes).sum::<u64>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Free fault-buffer slots of one context
#[derive(Debug)]
pub(crate) struct SlotPool {
    free: Mutex<Vec<usize>>,
}

impl SlotPool {
    pub(crate) fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..slots).rev().collect()),
        })
    }

    pub(crate) fn acquire(self: &Arc<Self>) -> Option<SlotLease> {
        let slot = self.free.lock().pop()?;
        Some(SlotLease {
            slot,
            pool: Arc::clone(self),
        })
    }

    pub(crate) fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// A leased slot, returned to its pool on drop
#[derive(Debug)]
pub(crate) struct SlotLease {
    slot: usize,
    pool: Arc<SlotPool>,
}

impl SlotLease {
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.pool.free.lock().push(self.slot);
    }
}

/// Per-launch view of a context's page table handed to kernels
///
/// Returned by `push_mappings`; pass it to `pull_requests` after the launch.
/// Don't launch with a context after it has been pulled.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    stream: Stream,
    launch: u64,
    request_if_resident: bool,
    lease: Arc<SlotLease>,
    table: Arc<dyn DevicePageTable>,
}

impl DeviceContext {
    pub(crate) fn new(
        stream: Stream,
        launch: u64,
        request_if_resident: bool,
        lease: SlotLease,
        table: Arc<dyn DevicePageTable>,
    ) -> Self {
        Self {
            stream,
            launch,
            request_if_resident,
            lease: Arc::new(lease),
            table,
        }
    }

    /// Kernel-side page lookup (records a fault when absent)
    #[must_use]
    pub fn map_or_request(&self, page: u32) -> Option<u64> {
        self.table
            .map_or_request(self.lease.slot, page, self.request_if_resident)
    }

    /// Stream the context was pushed on
    #[must_use]
    pub const fn stream(&self) -> Stream {
        self.stream
    }

    /// Fault buffer slot leased for this launch
    #[must_use]
    pub fn slot(&self) -> usize {
        self.lease.slot
    }

    /// Launch number assigned by the push
    #[must_use]
    pub const fn launch(&self) -> u64 {
        self.launch
    }

    /// Whether kernels report resident pages too (eviction tracking)
    #[must_use]
    pub const fn request_if_resident(&self) -> bool {
        self.request_if_resident
    }

    /// The context's device page table
    #[must_use]
    pub fn page_table(&self) -> &Arc<dyn DevicePageTable> {
        &self.table
    }
}
