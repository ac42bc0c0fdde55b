//! Request handlers: per-range fill logic
//!
//! Every handler fills pages the same way (`fill_page`): lock the page's
//! mutex, re-check residency, run the resource callback, stage the entry.
//! Variants differ only in where the entry comes from and whether the page
//! may be evicted.

use super::device::Stream;
use super::mutex_array::MutexArray;
use super::page_table_manager::PageRange;
use super::paging_system::PagingSystem;
use super::ticket::FillOutcome;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// What a fill task sees while running on a worker
#[derive(Debug, Clone, Copy)]
pub struct FillContext<'a> {
    /// Stream whose launch faulted the page
    pub stream: Stream,

    /// Paging system of the stream's context
    pub paging: &'a PagingSystem,
}

/// Fill logic for one allocated page range
pub trait RequestHandler: Send + Sync + fmt::Debug {
    /// Range of pages owned by this handler
    fn page_range(&self) -> PageRange;

    /// Fill `page`, staging a mapping on success
    ///
    /// `page` lies in `page_range()`. Must not block on device completion.
    fn fill_request(&self, ctx: &FillContext<'_>, page: u32) -> FillOutcome;

    /// Called after `page` was unmapped by eviction or invalidation
    fn release_page(&self, _ctx: &FillContext<'_>, _page: u32, _entry: u64) {}
}

/// Fill `page` of `range` under its per-page mutex
///
/// `load` runs only if the page is still absent once the lock is held.
/// `Ok(Some(entry))` stages the entry, `Ok(None)` defers and `Err` fails;
/// in both latter cases the page stays absent and re-faults later.
pub fn fill_page<F>(
    mutexes: &MutexArray,
    range: PageRange,
    ctx: &FillContext<'_>,
    page: u32,
    evictable: bool,
    load: F,
) -> FillOutcome
where
    F: FnOnce() -> anyhow::Result<Option<u64>>,
{
    let _guard = mutexes.lock(range.offset(page) as usize);

    // A racing stream may have filled it while we waited for the lock.
    if ctx.paging.is_resident(page) {
        return FillOutcome::AlreadyResident;
    }

    match load() {
        Ok(Some(entry)) => {
            ctx.paging.add_mapping(page, evictable, entry);
            FillOutcome::Filled
        }
        Ok(None) => FillOutcome::Deferred,
        Err(e) => {
            warn!(page, error = %e, "page fill failed");
            FillOutcome::Failed
        }
    }
}

/// Release `page` under its mutex unless it was re-filled meanwhile
pub fn release_page_if_absent<F>(
    mutexes: &MutexArray,
    range: PageRange,
    ctx: &FillContext<'_>,
    page: u32,
    release: F,
) where
    F: FnOnce(),
{
    let _guard = mutexes.lock(range.offset(page) as usize);
    if !ctx.paging.is_resident(page) {
        release();
    }
}

/// Resource callback: `Ok(Some(entry))` filled, `Ok(None)` deferred, `Err` failed
pub type ResourceCallback = Arc<dyn Fn(&Stream, u32) -> anyhow::Result<Option<u64>> + Send + Sync>;

/// Called with `(page, entry)` after a resource page is unmapped
pub type ReleaseCallback = Arc<dyn Fn(u32, u64) + Send + Sync>;

/// Generic opaque resource backed by an application callback
pub struct ResourceRequestHandler {
    range: PageRange,
    mutexes: MutexArray,
    evictable: bool,
    callback: ResourceCallback,
    release: Option<ReleaseCallback>,
}

impl fmt::Debug for ResourceRequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRequestHandler")
            .field("range", &self.range)
            .field("evictable", &self.evictable)
            .field("has_release", &self.release.is_some())
            .finish_non_exhaustive()
    }
}

impl ResourceRequestHandler {
    /// Handler for `range` calling `callback` per page
    #[must_use]
    pub fn new(
        range: PageRange,
        evictable: bool,
        callback: ResourceCallback,
        release: Option<ReleaseCallback>,
    ) -> Self {
        Self {
            range,
            mutexes: MutexArray::new(range.len() as usize),
            evictable,
            callback,
            release,
        }
    }
}

impl RequestHandler for ResourceRequestHandler {
    fn page_range(&self) -> PageRange {
        self.range
    }

    fn fill_request(&self, ctx: &FillContext<'_>, page: u32) -> FillOutcome {
        fill_page(&self.mutexes, self.range, ctx, page, self.evictable, || {
            (self.callback)(&ctx.stream, page)
        })
    }

    fn release_page(&self, ctx: &FillContext<'_>, page: u32, entry: u64) {
        if let Some(release) = &self.release {
            release_page_if_absent(&self.mutexes, self.range, ctx, page, || {
                release(page, entry);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::paging::HostPageTable;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn paging() -> PagingSystem {
        let options = Options {
            num_pages: 256,
            num_page_table_entries: 128,
            max_requested_pages: 16,
            max_active_streams: 1,
            ..Options::default()
        };
        PagingSystem::new(
            crate::paging::ContextId(0),
            Arc::new(HostPageTable::new(&options)),
            &options,
        )
    }

    fn counting_handler(
        range: PageRange,
        calls: Arc<AtomicUsize>,
        result: fn(u32) -> anyhow::Result<Option<u64>>,
    ) -> ResourceRequestHandler {
        ResourceRequestHandler::new(
            range,
            true,
            Arc::new(move |_stream: &Stream, page: u32| {
                calls.fetch_add(1, Ordering::SeqCst);
                result(page)
            }),
            None,
        )
    }

    #[test]
    fn test_fill_stages_then_short_circuits() {
        let paging = paging();
        let ctx = FillContext {
            stream: Stream::new(0, 0),
            paging: &paging,
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(PageRange::new(100, 2), Arc::clone(&calls), |page| {
            Ok(Some(u64::from(page) * 10))
        });

        assert_eq!(handler.fill_request(&ctx, 100), FillOutcome::Filled);
        assert!(paging.is_resident(100));
        assert!(!paging.is_device_resident(100));

        assert_eq!(handler.fill_request(&ctx, 100), FillOutcome::AlreadyResident);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_deferred_and_failed_leave_page_absent() {
        let paging = paging();
        let ctx = FillContext {
            stream: Stream::new(0, 0),
            paging: &paging,
        };
        let calls = Arc::new(AtomicUsize::new(0));

        let deferring = counting_handler(PageRange::new(0, 1), Arc::clone(&calls), |_| Ok(None));
        assert_eq!(deferring.fill_request(&ctx, 0), FillOutcome::Deferred);
        assert!(!paging.is_resident(0));

        let failing =
            counting_handler(PageRange::new(1, 1), Arc::clone(&calls), |_| Err(anyhow!("io")));
        assert_eq!(failing.fill_request(&ctx, 1), FillOutcome::Failed);
        assert!(!paging.is_resident(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_fills_call_back_once() {
        let paging = paging();
        let calls = Arc::new(AtomicUsize::new(0));
        let handler = counting_handler(PageRange::new(10, 4), Arc::clone(&calls), |page| {
            std::thread::sleep(std::time::Duration::from_millis(5));
            Ok(Some(u64::from(page)))
        });

        std::thread::scope(|scope| {
            for id in 0..8 {
                let handler = &handler;
                let paging = &paging;
                scope.spawn(move || {
                    let ctx = FillContext {
                        stream: Stream::new(0, id),
                        paging,
                    };
                    handler.fill_request(&ctx, 12)
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(paging.is_resident(12));
    }

    #[test]
    fn test_release_skipped_when_refilled() {
        let paging = paging();
        let ctx = FillContext {
            stream: Stream::new(0, 0),
            paging: &paging,
        };
        let released = Arc::new(AtomicUsize::new(0));
        let handler = ResourceRequestHandler::new(
            PageRange::new(0, 2),
            true,
            Arc::new(|_: &Stream, page: u32| Ok::<_, anyhow::Error>(Some(u64::from(page) + 1))),
            Some({
                let released = Arc::clone(&released);
                Arc::new(move |_page: u32, _entry: u64| {
                    released.fetch_add(1, Ordering::SeqCst);
                })
            }),
        );

        // Absent page: release runs
        handler.release_page(&ctx, 0, 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        // Re-filled before the release task ran: skipped
        handler.fill_request(&ctx, 1);
        handler.release_page(&ctx, 1, 2);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
