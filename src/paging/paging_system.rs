//! Paging system: host authority over page residency for one context
//!
//! Page lifecycle: `Absent → Staged → Resident → Absent`.
//!
//! - a successful fill stages a mapping (host-visible only)
//! - `push_mappings` uploads staged mappings together with eviction and
//!   invalidation unmaps, making them device-visible
//! - LRU eviction and invalidation remove resident pages; the unmap rides on
//!   the same push
//!
//! A push whose upload fails keeps its unmaps pending; they ride on the next
//! push, so a page released on the host is always unmapped on the device.
//!
//! Pushes are single-writer (`push_lock`). The state lock only guards
//! O(batch) bookkeeping and is never held across a device call. Pages staged
//! during a push cycle are not eviction candidates, so a new mapping always
//! becomes visible before it can be reclaimed.

use super::device::ContextId;
use super::device_table::{DevicePageTable, PageMapping};
use crate::error::PagingError;
use crate::options::Options;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Decides whether an invalidated page is discarded, given `(page, entry)`
pub type InvalidationPredicate = Arc<dyn Fn(u32, u64) -> bool + Send + Sync>;

/// A queued invalidation of `[start, end)`
#[derive(Clone)]
pub struct InvalidationRange {
    /// First page
    pub start: u32,

    /// One past the last page
    pub end: u32,

    /// Discard only pages matching the predicate (`None` = all)
    pub predicate: Option<InvalidationPredicate>,
}

impl fmt::Debug for InvalidationRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvalidationRange")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// A page removed by eviction or invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasedPage {
    /// Page index
    pub page: u32,

    /// Entry it was mapped with
    pub entry: u64,

    /// Whether the device view had it mapped
    pub device_resident: bool,
}

/// Result of a push
#[derive(Debug, Clone, Default)]
pub struct PushOutcome {
    /// Launch number assigned to this push
    pub launch: u64,

    /// Staged mappings made device-visible
    pub mapped: usize,

    /// Pages reclaimed by LRU eviction
    pub evicted: Vec<ReleasedPage>,

    /// Pages discarded by invalidation
    pub invalidated: Vec<ReleasedPage>,

    /// Bytes written to the device table
    pub bytes_uploaded: u64,
}

/// Result of a pull
#[derive(Debug, Clone, Default)]
pub struct PullOutcome {
    /// Absent pages that need a fill (deduplicated, ascending)
    pub fills: Vec<u32>,

    /// Resident pages whose LRU stamp was refreshed
    pub refreshed: usize,

    /// Faults lost to fault buffer overflow
    pub overflowed: u32,

    /// Bytes read back from the device
    pub bytes_read_back: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Staged,
    Resident,
}

#[derive(Debug, Clone, Copy)]
struct HostPage {
    entry: u64,
    evictable: bool,
    residency: Residency,
    device_resident: bool,
    queued: bool,
    last_used: u64,
}

impl HostPage {
    fn released(self, page: u32) -> ReleasedPage {
        ReleasedPage {
            page,
            entry: self.entry,
            device_resident: self.device_resident,
        }
    }
}

#[derive(Debug, Default)]
struct PagingState {
    pages: BTreeMap<u32, HostPage>,
    staged: VecDeque<u32>,
    launch: u64,
    // Released by a push whose upload failed; unmapped by the next push.
    pending_invalidated: Vec<ReleasedPage>,
    pending_evicted: Vec<ReleasedPage>,
}

impl PagingState {
    fn invalidate(&mut self, ranges: &[InvalidationRange]) -> Vec<ReleasedPage> {
        let mut released = Vec::new();
        for range in ranges.iter().filter(|r| r.start < r.end) {
            let doomed: Vec<u32> = self
                .pages
                .range(range.start..range.end)
                .filter(|&(&page, host)| {
                    range
                        .predicate
                        .as_ref()
                        .map_or(true, |discard| discard(page, host.entry))
                })
                .map(|(&page, _)| page)
                .collect();
            for page in doomed {
                if let Some(host) = self.pages.remove(&page) {
                    released.push(host.released(page));
                }
            }
        }
        released
    }

    fn evict(&mut self, budget: Option<usize>, max_per_push: usize) -> Vec<ReleasedPage> {
        let Some(budget) = budget else {
            return Vec::new();
        };
        let evictable = self.pages.values().filter(|p| p.evictable).count();
        let excess = evictable.saturating_sub(budget).min(max_per_push);
        if excess == 0 {
            return Vec::new();
        }

        // Staged pages are never candidates.
        let mut candidates: Vec<(u64, u32)> = self
            .pages
            .iter()
            .filter(|(_, p)| p.evictable && p.residency == Residency::Resident)
            .map(|(&page, p)| (p.last_used, page))
            .collect();
        candidates.sort_unstable();

        candidates
            .into_iter()
            .take(excess)
            .filter_map(|(_, page)| self.pages.remove(&page).map(|p| p.released(page)))
            .collect()
    }

    fn take_staged(&mut self, max: usize) -> Vec<PageMapping> {
        let mut mappings = Vec::new();
        while mappings.len() < max {
            let Some(page) = self.staged.pop_front() else {
                break;
            };
            // Skip ids whose page was invalidated after staging.
            if let Some(host) = self.pages.get_mut(&page).filter(|p| p.queued) {
                host.queued = false;
                mappings.push(PageMapping {
                    page,
                    entry: host.entry,
                });
            }
        }
        mappings
    }

    fn commit(&mut self, mappings: &[PageMapping], launch: u64) {
        for mapping in mappings {
            if let Some(host) = self.pages.get_mut(&mapping.page) {
                host.device_resident = true;
                if !host.queued && host.entry == mapping.entry {
                    host.residency = Residency::Resident;
                    host.last_used = launch;
                }
            }
        }
    }

    fn requeue(&mut self, mappings: &[PageMapping]) {
        for mapping in mappings.iter().rev() {
            if let Some(host) = self.pages.get_mut(&mapping.page) {
                if !host.queued {
                    host.queued = true;
                    self.staged.push_front(mapping.page);
                }
            }
        }
    }
}

/// Residency authority for one accelerator context
#[derive(Debug)]
pub struct PagingSystem {
    context: ContextId,
    table: Arc<dyn DevicePageTable>,
    max_filled_pages: usize,
    max_resident_pages: Option<usize>,
    max_evicted_per_push: usize,
    state: Mutex<PagingState>,
    push_lock: Mutex<()>,
}

impl PagingSystem {
    /// Paging system for `context` over its device `table`
    #[must_use]
    pub fn new(context: ContextId, table: Arc<dyn DevicePageTable>, options: &Options) -> Self {
        Self {
            context,
            table,
            max_filled_pages: options.max_filled_pages as usize,
            max_resident_pages: options.max_resident_pages.map(|n| n as usize),
            max_evicted_per_push: options.max_evicted_per_push as usize,
            state: Mutex::new(PagingState::default()),
            push_lock: Mutex::new(()),
        }
    }

    /// Context this paging system belongs to
    #[must_use]
    pub const fn context(&self) -> ContextId {
        self.context
    }

    /// Device page table of the context
    #[must_use]
    pub fn table(&self) -> &Arc<dyn DevicePageTable> {
        &self.table
    }

    /// Host view: staged or device-resident
    #[must_use]
    pub fn is_resident(&self, page: u32) -> bool {
        self.state.lock().pages.contains_key(&page)
    }

    /// Whether a push has made `page` visible to kernels
    #[must_use]
    pub fn is_device_resident(&self, page: u32) -> bool {
        self.state
            .lock()
            .pages
            .get(&page)
            .is_some_and(|p| p.device_resident)
    }

    /// Entry of a staged or resident page
    #[must_use]
    pub fn entry(&self, page: u32) -> Option<u64> {
        self.state.lock().pages.get(&page).map(|p| p.entry)
    }

    /// Stage a mapping for the next push
    ///
    /// Re-staging a page replaces its entry.
    pub fn add_mapping(&self, page: u32, evictable: bool, entry: u64) {
        let mut state = self.state.lock();
        let host = state.pages.entry(page).or_insert(HostPage {
            entry,
            evictable,
            residency: Residency::Staged,
            device_resident: false,
            queued: false,
            last_used: 0,
        });
        host.entry = entry;
        host.evictable = evictable;
        host.residency = Residency::Staged;
        if !host.queued {
            host.queued = true;
            state.staged.push_back(page);
        }
    }

    /// Upload staged mappings plus invalidation and eviction unmaps
    ///
    /// Invalidations run first, then eviction (when `evict` is set and a
    /// budget is configured), then up to `max_filled_pages` staged mappings
    /// are applied to the device table together with the unmaps. Mappings
    /// left over stay staged for the next push.
    ///
    /// # Errors
    ///
    /// Returns the device error if the upload fails. The staged mappings are
    /// re-queued and the released pages are carried to the next push, which
    /// unmaps them and reports them in its outcome.
    pub fn push_mappings(
        &self,
        slot: usize,
        invalidations: &[InvalidationRange],
        evict: bool,
    ) -> Result<PushOutcome, PagingError> {
        let _push = self.push_lock.lock();

        let (launch, invalidated, evicted, mappings) = {
            let mut state = self.state.lock();
            state.launch += 1;
            let mut invalidated = std::mem::take(&mut state.pending_invalidated);
            invalidated.extend(state.invalidate(invalidations));
            let mut evicted = std::mem::take(&mut state.pending_evicted);
            if evict {
                let reclaimed = state.evict(self.max_resident_pages, self.max_evicted_per_push);
                evicted.extend(reclaimed);
            }
            let mappings = state.take_staged(self.max_filled_pages);
            (state.launch, invalidated, evicted, mappings)
        };

        let unmaps: Vec<u32> = invalidated
            .iter()
            .chain(&evicted)
            .filter(|p| p.device_resident)
            .map(|p| p.page)
            .collect();

        let bytes_uploaded = match self.table.apply(slot, &mappings, &unmaps) {
            Ok(bytes) => bytes,
            Err(e) => {
                let mut state = self.state.lock();
                state.requeue(&mappings);
                state.pending_invalidated = invalidated;
                state.pending_evicted = evicted;
                return Err(e);
            }
        };
        self.state.lock().commit(&mappings, launch);

        debug!(
            context = self.context.0,
            launch,
            mapped = mappings.len(),
            evicted = evicted.len(),
            invalidated = invalidated.len(),
            "pushed mappings"
        );

        Ok(PushOutcome {
            launch,
            mapped: mappings.len(),
            evicted,
            invalidated,
            bytes_uploaded,
        })
    }

    /// Read back the fault buffer of `slot` and select pages needing a fill
    ///
    /// Resident pages in the buffer (reported for eviction tracking) get
    /// their LRU stamp set to `launch`; staged pages are skipped.
    ///
    /// # Errors
    ///
    /// Returns the device error if readback fails
    pub fn pull_requests(&self, slot: usize, launch: u64) -> Result<PullOutcome, PagingError> {
        let batch = self.table.take_requests(slot)?;
        let mut pages = batch.pages;
        pages.sort_unstable();
        pages.dedup();

        let mut fills = Vec::new();
        let mut refreshed = 0;
        {
            let mut state = self.state.lock();
            for page in pages {
                match state.pages.get_mut(&page) {
                    Some(host) if host.residency == Residency::Resident => {
                        host.last_used = host.last_used.max(launch);
                        refreshed += 1;
                    }
                    Some(_) => {}
                    None => fills.push(page),
                }
            }
        }

        debug!(
            context = self.context.0,
            launch,
            fills = fills.len(),
            refreshed,
            overflowed = batch.overflowed,
            "pulled requests"
        );

        Ok(PullOutcome {
            fills,
            refreshed,
            overflowed: batch.overflowed,
            bytes_read_back: batch.bytes_read_back,
        })
    }

    /// Pages currently staged or resident
    #[must_use]
    pub fn num_resident_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Pages waiting for a push
    #[must_use]
    pub fn num_staged_pages(&self) -> usize {
        self.state
            .lock()
            .pages
            .values()
            .filter(|p| p.queued)
            .count()
    }

    /// Number of pushes so far
    #[must_use]
    pub fn launch(&self) -> u64 {
        self.state.lock().launch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::device_table::FaultBatch;
    use crate::paging::HostPageTable;
    use std::any::Any;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Host table whose next `failures` uploads fail
    #[derive(Debug)]
    struct FlakyTable {
        inner: HostPageTable,
        failures: AtomicU32,
    }

    impl FlakyTable {
        fn fail_next(&self, count: u32) {
            self.failures.store(count, Ordering::SeqCst);
        }
    }

    impl DevicePageTable for FlakyTable {
        fn apply(
            &self,
            slot: usize,
            mappings: &[PageMapping],
            unmaps: &[u32],
        ) -> Result<u64, PagingError> {
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(PagingError::Device("upload lost".into()));
            }
            self.inner.apply(slot, mappings, unmaps)
        }

        fn take_requests(&self, slot: usize) -> Result<FaultBatch, PagingError> {
            self.inner.take_requests(slot)
        }

        fn map_or_request(&self, slot: usize, page: u32, request_if_resident: bool) -> Option<u64> {
            self.inner.map_or_request(slot, page, request_if_resident)
        }

        fn memory_bytes(&self) -> u64 {
            self.inner.memory_bytes()
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn flaky_paging(options: &Options) -> (PagingSystem, Arc<FlakyTable>) {
        let table = Arc::new(FlakyTable {
            inner: HostPageTable::new(options),
            failures: AtomicU32::new(0),
        });
        (
            PagingSystem::new(ContextId(0), table.clone(), options),
            table,
        )
    }

    fn everything() -> InvalidationRange {
        InvalidationRange {
            start: 0,
            end: 1000,
            predicate: None,
        }
    }

    fn options() -> Options {
        Options {
            num_pages: 1025,
            num_page_table_entries: 128,
            max_requested_pages: 63,
            max_filled_pages: 65,
            max_active_streams: 4,
            ..Options::default()
        }
    }

    fn paging_with(options: &Options) -> (PagingSystem, Arc<HostPageTable>) {
        let table = Arc::new(HostPageTable::new(options));
        (
            PagingSystem::new(ContextId(0), table.clone(), options),
            table,
        )
    }

    #[test]
    fn test_push_makes_mapping_visible() {
        let (paging, table) = paging_with(&options());
        paging.add_mapping(0, false, 42);
        assert!(paging.is_resident(0));
        assert_eq!(table.map_or_request(0, 0, false), None);

        let outcome = paging.push_mappings(0, &[], true).unwrap();
        assert_eq!(outcome.mapped, 1);
        assert_eq!(outcome.launch, 1);
        assert_eq!(table.map_or_request(0, 0, false), Some(42));
        assert!(paging.is_device_resident(0));

        // Nothing left to push
        assert_eq!(paging.push_mappings(0, &[], true).unwrap().mapped, 0);
    }

    #[test]
    fn test_non_resident_page_maps_to_nothing() {
        let (paging, table) = paging_with(&options());
        paging.push_mappings(0, &[], true).unwrap();
        assert_eq!(table.map_or_request(0, 5, false), None);

        let pulled = paging.pull_requests(0, 1).unwrap();
        assert_eq!(pulled.fills, vec![5]);
    }

    #[test]
    fn test_push_is_bounded_by_max_filled_pages() {
        let options = Options {
            max_filled_pages: 2,
            max_requested_pages: 2,
            ..options()
        };
        let (paging, _table) = paging_with(&options);
        for page in 0..5 {
            paging.add_mapping(page, true, u64::from(page));
        }
        assert_eq!(paging.push_mappings(0, &[], false).unwrap().mapped, 2);
        assert_eq!(paging.num_staged_pages(), 3);
        assert_eq!(paging.push_mappings(0, &[], false).unwrap().mapped, 2);
        assert_eq!(paging.push_mappings(0, &[], false).unwrap().mapped, 1);
        assert_eq!(paging.num_staged_pages(), 0);
    }

    #[test]
    fn test_pull_dedups_and_skips_staged() {
        let (paging, table) = paging_with(&options());
        table.map_or_request(1, 7, false);
        table.map_or_request(1, 3, false);
        table.map_or_request(1, 7, false);
        paging.add_mapping(3, true, 1);

        let pulled = paging.pull_requests(1, 0).unwrap();
        assert_eq!(pulled.fills, vec![7]);
        assert_eq!(pulled.refreshed, 0);
    }

    #[test]
    fn test_lru_eviction_respects_budget_and_staged_pages() {
        let options = Options {
            max_resident_pages: Some(2),
            ..options()
        };
        let (paging, table) = paging_with(&options);

        for page in 200..203 {
            paging.add_mapping(page, true, 0);
        }
        // Over budget, but every page is staged: nothing evicted this push
        let outcome = paging.push_mappings(0, &[], true).unwrap();
        assert!(outcome.evicted.is_empty());
        assert_eq!(outcome.mapped, 3);

        // Touch 200 and 202 in launch 2 so 201 is least recently used
        let outcome = paging.push_mappings(0, &[], false).unwrap();
        table.map_or_request(0, 200, true);
        table.map_or_request(0, 202, true);
        let pulled = paging.pull_requests(0, outcome.launch).unwrap();
        assert_eq!(pulled.refreshed, 2);

        let outcome = paging.push_mappings(0, &[], true).unwrap();
        let evicted: Vec<u32> = outcome.evicted.iter().map(|p| p.page).collect();
        assert_eq!(evicted, vec![201]);
        assert!(!paging.is_resident(201));
        assert!(!table.is_resident(201));
        assert!(table.is_resident(200));
    }

    #[test]
    fn test_non_evictable_pages_are_kept() {
        let options = Options {
            max_resident_pages: Some(0),
            ..options()
        };
        let (paging, _table) = paging_with(&options);
        paging.add_mapping(1, false, 9);
        paging.push_mappings(0, &[], true).unwrap();
        let outcome = paging.push_mappings(0, &[], true).unwrap();
        assert!(outcome.evicted.is_empty());
        assert!(paging.is_device_resident(1));
    }

    #[test]
    fn test_invalidation_with_predicate() {
        let (paging, table) = paging_with(&options());
        for page in 10..14 {
            paging.add_mapping(page, true, u64::from(page % 2));
        }
        paging.push_mappings(0, &[], true).unwrap();

        let odd_entries: InvalidationPredicate = Arc::new(|_page, entry| entry == 1);
        let outcome = paging
            .push_mappings(
                0,
                &[InvalidationRange {
                    start: 10,
                    end: 13,
                    predicate: Some(odd_entries),
                }],
                true,
            )
            .unwrap();

        let invalidated: Vec<u32> = outcome.invalidated.iter().map(|p| p.page).collect();
        assert_eq!(invalidated, vec![11]);
        assert!(!table.is_resident(11));
        assert!(table.is_resident(13));
        assert!(paging.is_resident(10));
    }

    #[test]
    fn test_invalidating_staged_page_drops_it() {
        let (paging, table) = paging_with(&options());
        paging.add_mapping(20, true, 5);
        let outcome = paging
            .push_mappings(
                0,
                &[InvalidationRange {
                    start: 0,
                    end: 100,
                    predicate: None,
                }],
                true,
            )
            .unwrap();
        assert_eq!(outcome.mapped, 0);
        assert_eq!(outcome.invalidated.len(), 1);
        assert!(!outcome.invalidated[0].device_resident);
        assert!(!table.is_resident(20));
        assert!(!paging.is_resident(20));
    }

    #[test]
    fn test_restaging_replaces_entry() {
        let (paging, table) = paging_with(&options());
        paging.add_mapping(4, true, 1);
        paging.push_mappings(0, &[], false).unwrap();
        paging.add_mapping(4, true, 2);
        assert_eq!(paging.entry(4), Some(2));
        paging.push_mappings(0, &[], false).unwrap();
        assert_eq!(table.entry(4), 2);
        assert_eq!(paging.num_resident_pages(), 1);
    }

    #[test]
    fn test_failed_upload_requeues_staged_mappings() {
        let (paging, table) = flaky_paging(&options());
        paging.add_mapping(3, true, 7);
        table.fail_next(1);

        let err = paging.push_mappings(0, &[], false).unwrap_err();
        assert!(matches!(err, PagingError::Device(_)));
        assert_eq!(paging.num_staged_pages(), 1);
        assert!(!paging.is_device_resident(3));

        let outcome = paging.push_mappings(0, &[], false).unwrap();
        assert_eq!(outcome.mapped, 1);
        assert_eq!(table.inner.entry(3), 7);
        assert!(paging.is_device_resident(3));
    }

    #[test]
    fn test_failed_upload_keeps_invalidation_unmaps() {
        let (paging, table) = flaky_paging(&options());
        paging.add_mapping(5, true, 42);
        paging.push_mappings(0, &[], false).unwrap();
        assert!(table.inner.is_resident(5));

        table.fail_next(1);
        assert!(paging.push_mappings(0, &[everything()], false).is_err());
        assert!(!paging.is_resident(5));

        // The retry carries the unmap even though no range is queued any more
        let outcome = paging.push_mappings(0, &[], false).unwrap();
        let invalidated: Vec<u32> = outcome.invalidated.iter().map(|p| p.page).collect();
        assert_eq!(invalidated, vec![5]);
        assert_eq!(outcome.invalidated[0].entry, 42);
        assert!(!table.inner.is_resident(5));
        assert_eq!(table.inner.entry(5), 0);

        // Reported once
        assert!(paging.push_mappings(0, &[], false).unwrap().invalidated.is_empty());
    }

    #[test]
    fn test_failed_upload_keeps_eviction_unmaps() {
        let options = Options {
            max_resident_pages: Some(1),
            ..options()
        };
        let (paging, table) = flaky_paging(&options);
        paging.add_mapping(1, true, 10);
        paging.add_mapping(2, true, 20);
        paging.push_mappings(0, &[], false).unwrap();

        table.fail_next(2);
        assert!(paging.push_mappings(0, &[], true).is_err());
        assert_eq!(paging.num_resident_pages(), 1);
        // Still failing: nothing is evicted twice or lost
        assert!(paging.push_mappings(0, &[], true).is_err());

        let outcome = paging.push_mappings(0, &[], true).unwrap();
        assert_eq!(outcome.evicted.len(), 1);
        let evicted = outcome.evicted[0].page;
        assert!(!table.inner.is_resident(evicted));
        assert_eq!(paging.num_resident_pages(), 1);
        for page in [1, 2] {
            assert_eq!(paging.is_resident(page), table.inner.is_resident(page));
        }
    }

    #[test]
    fn test_restaged_page_survives_pending_unmap() {
        let (paging, table) = flaky_paging(&options());
        paging.add_mapping(8, true, 1);
        paging.push_mappings(0, &[], false).unwrap();

        table.fail_next(1);
        assert!(paging.push_mappings(0, &[everything()], false).is_err());
        paging.add_mapping(8, true, 2);

        let outcome = paging.push_mappings(0, &[], false).unwrap();
        assert_eq!(outcome.invalidated.len(), 1);
        assert_eq!(outcome.invalidated[0].entry, 1);
        assert_eq!(outcome.mapped, 1);
        assert!(table.inner.is_resident(8));
        assert_eq!(table.inner.entry(8), 2);
        assert!(paging.is_device_resident(8));
    }
}
