//! Demand page loader: the host-facing orchestration facade
//!
//! Per launch, the host loop is:
//!
//! 1. `push_mappings(stream)` uploads staged mappings and unmaps and returns
//!    a `DeviceContext` for the kernels
//! 2. kernels call `map_or_request` and fault on absent pages
//! 3. `pull_requests(stream, &context, batch_id)` hands the faults to the
//!    worker pool and returns a `Ticket` right away
//! 4. fills stage mappings that the next push makes visible
//!
//! Paging state lives per accelerator context and is created on first use.

use super::memory_manager::DeviceMemoryManager;
use super::statistics::Statistics;
use crate::error::{PageKind, PagingError};
use crate::options::Options;
use crate::paging::request_processor::RequestProcessor;
use crate::paging::{
    Accelerator, DeviceContext, DeviceInfo, InvalidationPredicate, InvalidationRange,
    PageTableManager, PagingSystem, PerContextData, ReleaseCallback, RequestHandler,
    ResourceCallback, ResourceRequestHandler, Stream, Ticket,
};
#[cfg(feature = "storage")]
use crate::storage::RequestTrace;
use crate::textures::TextureRegistry;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Description of an application resource paged in by a callback
pub struct ResourceDesc {
    num_pages: u32,
    evictable: bool,
    callback: ResourceCallback,
    release: Option<ReleaseCallback>,
}

impl fmt::Debug for ResourceDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceDesc")
            .field("num_pages", &self.num_pages)
            .field("evictable", &self.evictable)
            .field("has_release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

impl ResourceDesc {
    /// Resource of `num_pages` backed pages filled by `callback`
    ///
    /// The callback returns `Ok(Some(entry))` when the page is ready,
    /// `Ok(None)` to defer and `Err` on failure. Pages are evictable unless
    /// `evictable(false)` is set.
    pub fn new<F>(num_pages: u32, callback: F) -> Self
    where
        F: Fn(&Stream, u32) -> anyhow::Result<Option<u64>> + Send + Sync + 'static,
    {
        Self {
            num_pages,
            evictable: true,
            callback: Arc::new(callback),
            release: None,
        }
    }

    /// Whether pages may be reclaimed by eviction
    #[must_use]
    pub const fn evictable(mut self, evictable: bool) -> Self {
        self.evictable = evictable;
        self
    }

    /// Called with `(page, entry)` after a page is evicted or invalidated
    #[must_use]
    pub fn on_release<F>(mut self, release: F) -> Self
    where
        F: Fn(u32, u64) + Send + Sync + 'static,
    {
        self.release = Some(Arc::new(release));
        self
    }
}

/// Paging state of one accelerator context
#[derive(Debug)]
struct ContextState {
    paging: Arc<PagingSystem>,
    memory: DeviceMemoryManager,
    invalidations: Mutex<Vec<InvalidationRange>>,
}

#[derive(Debug, Default)]
pub(crate) struct LoaderCounters {
    pub(crate) num_resources: AtomicU32,
    pub(crate) num_textures: AtomicU32,
    pushes: AtomicU64,
    pulls: AtomicU64,
    evicted: AtomicU64,
    invalidated: AtomicU64,
}

/// Demand-paged virtual memory for accelerator resources
#[derive(Debug)]
pub struct DemandPageLoader {
    options: Options,
    devices: BTreeMap<u32, Arc<dyn Accelerator>>,
    pub(crate) page_table: Arc<PageTableManager>,
    contexts: PerContextData<ContextState>,
    eviction_active: AtomicBool,
    pub(crate) counters: LoaderCounters,
    pub(crate) textures: TextureRegistry,
    processor: RequestProcessor,
}

impl DemandPageLoader {
    /// Loader over `accelerators`, keeping only devices that support paging
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InvalidOptions` if `options` fail validation,
    /// `PagingError::NoCapableDevice` if no device supports demand paging, or
    /// `PagingError::Io` if the worker runtime cannot start
    pub fn new(
        accelerators: Vec<Arc<dyn Accelerator>>,
        options: Options,
    ) -> Result<Self, PagingError> {
        options.validate()?;

        let probed = accelerators.len();
        let mut devices = BTreeMap::new();
        for accelerator in accelerators {
            let info = accelerator.info();
            if info.supports_paging {
                devices.insert(info.index, accelerator);
            } else {
                warn!(
                    device = info.index,
                    name = %info.name,
                    "device lacks demand paging support; excluded"
                );
            }
        }
        if devices.is_empty() {
            return Err(PagingError::NoCapableDevice { probed });
        }

        let options = options.configure(devices.len());
        let page_table = Arc::new(PageTableManager::new(
            options.num_pages,
            options.num_page_table_entries,
        ));
        let processor = RequestProcessor::new(Arc::clone(&page_table), &options)?;

        info!(
            devices = ?devices.keys().collect::<Vec<_>>(),
            num_pages = options.num_pages,
            backed_pages = options.num_page_table_entries,
            workers = options.max_threads,
            "demand page loader ready"
        );

        Ok(Self {
            eviction_active: AtomicBool::new(options.eviction_active),
            options,
            devices,
            page_table,
            contexts: PerContextData::new(),
            counters: LoaderCounters::default(),
            textures: TextureRegistry::default(),
            processor,
        })
    }

    /// Loader over `count` host-simulated devices
    ///
    /// # Errors
    ///
    /// Same as [`DemandPageLoader::new`]
    pub fn with_host_devices(count: u32, options: Options) -> Result<Self, PagingError> {
        Self::new(crate::paging::HostAccelerator::devices(count), options)
    }

    /// Normalized options in effect
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    /// Active devices, ordered by index
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.values().map(|d| d.info()).collect()
    }

    /// Page range allocator and handler registry
    #[must_use]
    pub fn page_table_manager(&self) -> &PageTableManager {
        &self.page_table
    }

    fn context_state(&self, stream: Stream) -> Result<Arc<ContextState>, PagingError> {
        let accelerator = self
            .devices
            .get(&stream.device)
            .ok_or(PagingError::InactiveDevice(stream.device))?;

        let state = self.contexts.find_or_try_create(stream.context, || {
            let table = accelerator.create_page_table(stream.context, &self.options)?;
            let memory = DeviceMemoryManager::new(
                stream.device,
                self.options.max_active_streams as usize,
                table.memory_bytes(),
            );
            debug!(
                device = stream.device,
                context = stream.context.0,
                memory_bytes = memory.memory_used(),
                "created paging state"
            );
            Ok::<ContextState, PagingError>(ContextState {
                paging: Arc::new(PagingSystem::new(stream.context, table, &self.options)),
                memory,
                invalidations: Mutex::new(Vec::new()),
            })
        })?;
        if state.memory.device() != stream.device {
            return Err(PagingError::ForeignContext {
                context: stream.context,
                owner: state.memory.device(),
                device: stream.device,
            });
        }
        Ok(state)
    }

    fn find_context(&self, stream: Stream) -> Option<Arc<ContextState>> {
        self.contexts
            .find(stream.context)
            .filter(|state| state.memory.device() == stream.device)
    }

    /// Paging system of `stream`'s context, if it has been used
    #[must_use]
    pub fn paging_system(&self, stream: Stream) -> Option<Arc<PagingSystem>> {
        self.find_context(stream)
            .map(|state| Arc::clone(&state.paging))
    }

    /// Host view of residency (staged or mapped) in `stream`'s context
    #[must_use]
    pub fn is_resident(&self, stream: Stream, page: u32) -> bool {
        self.find_context(stream)
            .is_some_and(|state| state.paging.is_resident(page))
    }

    /// Reserve `num_pages` pages that the host maps itself
    ///
    /// Returns the first page of the range.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::OutOfPages` if that half of the space is exhausted
    pub fn allocate_pages(&self, num_pages: u32, backed: bool) -> Result<u32, PagingError> {
        let kind = if backed {
            PageKind::Backed
        } else {
            PageKind::Unbacked
        };
        self.page_table
            .reserve_pages(kind, num_pages)
            .map(|range| range.start)
    }

    /// Stage a host-provided mapping in `stream`'s context
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InactiveDevice` for an excluded device,
    /// `PagingError::ForeignContext` if the stream's context was created on
    /// another device, or the device error if the context's page table
    /// cannot be created
    pub fn set_page_table_entry(
        &self,
        stream: Stream,
        page: u32,
        evictable: bool,
        entry: u64,
    ) -> Result<(), PagingError> {
        self.context_state(stream)?
            .paging
            .add_mapping(page, evictable, entry);
        Ok(())
    }

    /// Allocate backed pages for a resource and register its fill callback
    ///
    /// Returns the first page of the resource.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::OutOfPages` if the backed pages are exhausted
    pub fn create_resource(&self, desc: ResourceDesc) -> Result<u32, PagingError> {
        let ResourceDesc {
            num_pages,
            evictable,
            callback,
            release,
        } = desc;
        let handler = self
            .page_table
            .reserve_pages_with(PageKind::Backed, num_pages, |range| {
                ResourceRequestHandler::new(range, evictable, callback, release)
            })?;
        self.counters.num_resources.fetch_add(1, Ordering::Relaxed);
        let range = handler.page_range();
        debug!(start = range.start, num_pages, evictable, "created resource");
        Ok(range.start)
    }

    /// Make staged mappings device-visible and lease a device context
    ///
    /// Queued invalidations and (when active) eviction are applied in the
    /// same upload. Released pages are handed to their handlers on the
    /// worker pool.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InactiveDevice` for an excluded device,
    /// `PagingError::ForeignContext` if the stream's context was created on
    /// another device, `PagingError::NoFreeDeviceContext` if every slot is
    /// leased, or the device error if the upload fails
    pub fn push_mappings(&self, stream: Stream) -> Result<DeviceContext, PagingError> {
        let state = self.context_state(stream)?;
        let lease = state
            .memory
            .allocate_device_context()
            .ok_or(PagingError::NoFreeDeviceContext(stream.context))?;

        let invalidations = std::mem::take(&mut *state.invalidations.lock());
        let evict = self.eviction_active.load(Ordering::Relaxed);
        // On failure the paging system keeps the released pages for the next push.
        let outcome = state
            .paging
            .push_mappings(lease.slot(), &invalidations, evict)?;

        state.memory.record_upload(outcome.bytes_uploaded);
        self.counters.pushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .evicted
            .fetch_add(outcome.evicted.len() as u64, Ordering::Relaxed);
        self.counters
            .invalidated
            .fetch_add(outcome.invalidated.len() as u64, Ordering::Relaxed);

        let mut released = outcome.evicted;
        released.extend(outcome.invalidated);
        self.processor
            .dispatcher()
            .release_pages(Arc::clone(&state.paging), stream, released);

        Ok(DeviceContext::new(
            stream,
            outcome.launch,
            evict,
            lease,
            Arc::clone(state.paging.table()),
        ))
    }

    /// Read back the faults of a launch and fill them in the background
    ///
    /// Returns immediately; the ticket is sized once readback finishes and
    /// resolves when every dispatched fill has completed.
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InactiveDevice` for an excluded device,
    /// `PagingError::ForeignContext` if the stream's context was created on
    /// another device, or `PagingError::ContextMismatch` if `context` was
    /// pushed on another accelerator context
    pub fn pull_requests(
        &self,
        stream: Stream,
        context: &DeviceContext,
        batch_id: u32,
    ) -> Result<Ticket, PagingError> {
        let state = self.context_state(stream)?;
        if context.stream().context != stream.context {
            return Err(PagingError::ContextMismatch {
                expected: stream.context,
                found: context.stream().context,
            });
        }
        self.counters.pulls.fetch_add(1, Ordering::Relaxed);

        let ticket = Ticket::new(batch_id, stream);
        let accounting = Arc::clone(&state);
        self.processor.dispatcher().pull_and_dispatch(
            Arc::clone(&state.paging),
            context.clone(),
            ticket.clone(),
            move |pulled| accounting.memory.record_read_back(pulled.bytes_read_back),
        );
        Ok(ticket)
    }

    /// Dispatch fills for `pages` directly, bypassing the fault buffer
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InactiveDevice` for an excluded device, or
    /// `PagingError::ForeignContext` if the stream's context was created on
    /// another device
    ///
    /// # Panics
    ///
    /// Panics if a page is not owned by any request handler
    pub fn replay_requests(
        &self,
        stream: Stream,
        batch_id: u32,
        pages: &[u32],
    ) -> Result<Ticket, PagingError> {
        for &page in pages {
            assert!(
                self.page_table.find_request_handler(page).is_some(),
                "replayed page {page} is not owned by any request handler"
            );
        }
        let state = self.context_state(stream)?;
        let ticket = Ticket::new(batch_id, stream);
        self.processor
            .dispatcher()
            .add_requests(&state.paging, stream, &ticket, pages);
        Ok(ticket)
    }

    /// Replay every batch of a recorded trace, in order
    ///
    /// # Errors
    ///
    /// Returns `PagingError::InactiveDevice` if a batch names an excluded device
    #[cfg(feature = "storage")]
    pub fn replay_trace(&self, trace: &RequestTrace) -> Result<Vec<Ticket>, PagingError> {
        trace
            .batches()
            .iter()
            .map(|batch| self.replay_requests(batch.stream, batch.batch_id, &batch.pages))
            .collect()
    }

    /// Discard pages in `[start, end)` at the next push of every context
    ///
    /// With a predicate, only pages for which it returns true given
    /// `(page, entry)` are discarded. Discarded pages re-fault on next access.
    pub fn invalidate_page_range(
        &self,
        start: u32,
        end: u32,
        predicate: Option<InvalidationPredicate>,
    ) {
        let range = InvalidationRange {
            start,
            end,
            predicate,
        };
        self.contexts.for_each(|_, state| {
            state.invalidations.lock().push(range.clone());
        });
        debug!(start, end, "queued page invalidation");
    }

    /// Turn LRU eviction (and resident-page reporting) on or off
    pub fn enable_eviction(&self, enabled: bool) {
        self.eviction_active.store(enabled, Ordering::Relaxed);
    }

    /// Whether LRU eviction is active
    #[must_use]
    pub fn eviction_active(&self) -> bool {
        self.eviction_active.load(Ordering::Relaxed)
    }

    /// Add this loader's totals to `stats`
    pub fn accumulate_statistics(&self, stats: &mut Statistics) {
        let fills = &self.processor.dispatcher().counters;
        stats.request_processing_time += fills.processing_time();
        stats.pages_filled += fills.filled.load(Ordering::Relaxed);
        stats.pages_already_resident += fills.already_resident.load(Ordering::Relaxed);
        stats.pages_deferred += fills.deferred.load(Ordering::Relaxed);
        stats.pages_failed += fills.failed.load(Ordering::Relaxed);
        stats.pages_rejected += fills.rejected.load(Ordering::Relaxed);
        stats.faults_overflowed += fills.overflowed.load(Ordering::Relaxed);

        stats.num_resources += self.counters.num_resources.load(Ordering::Relaxed);
        stats.num_textures += self.counters.num_textures.load(Ordering::Relaxed);
        stats.num_pushes += self.counters.pushes.load(Ordering::Relaxed);
        stats.num_pulls += self.counters.pulls.load(Ordering::Relaxed);
        stats.pages_evicted += self.counters.evicted.load(Ordering::Relaxed);
        stats.pages_invalidated += self.counters.invalidated.load(Ordering::Relaxed);

        self.contexts.for_each(|_, state| {
            let device = stats.device_mut(state.memory.device());
            state.memory.accumulate(device);
            device.resident_pages += state.paging.num_resident_pages() as u64;
        });
    }

    /// Fresh statistics for this loader alone
    #[must_use]
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        self.accumulate_statistics(&mut stats);
        stats
    }

    /// Append the fills dispatched since the last flush to the trace file
    ///
    /// The file is finalized (and readable) once the loader drops.
    ///
    /// # Errors
    ///
    /// Returns error if the trace file cannot be written
    pub fn flush_trace(&self) -> anyhow::Result<()> {
        self.processor.dispatcher().flush_trace()
    }
}
