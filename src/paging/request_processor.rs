//! Background fill dispatch
//!
//! Fills run on a dedicated tokio runtime: each page becomes a task that
//! (optionally) takes a permit from its handler's semaphore and then runs the
//! handler on the blocking pool, whose size is `max_threads`. The caller of
//! `pull_requests` only enqueues work; readback and dispatch both happen on
//! the runtime.

use super::device::Stream;
use super::device_table::DeviceContext;
use super::page_table_manager::PageTableManager;
use super::paging_system::{PagingSystem, PullOutcome, ReleasedPage};
use super::request_handler::{FillContext, RequestHandler};
use super::ticket::{FillOutcome, TaskGuard, Ticket};
use crate::error::PagingError;
use crate::options::Options;
#[cfg(feature = "storage")]
use crate::storage::TraceRecorder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{error, warn};

/// Running totals of fill outcomes
#[derive(Debug, Default)]
pub(crate) struct FillCounters {
    pub(crate) filled: AtomicU64,
    pub(crate) already_resident: AtomicU64,
    pub(crate) deferred: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) overflowed: AtomicU64,
    pub(crate) processing_nanos: AtomicU64,
}

impl FillCounters {
    fn record(&self, outcome: FillOutcome) {
        let counter = match outcome {
            FillOutcome::Filled => &self.filled,
            FillOutcome::AlreadyResident => &self.already_resident,
            FillOutcome::Deferred => &self.deferred,
            FillOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn processing_time(&self) -> Duration {
        Duration::from_nanos(self.processing_nanos.load(Ordering::Relaxed))
    }

    fn add_processing_time(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.processing_nanos.fetch_add(nanos, Ordering::Relaxed);
    }
}

/// Resolves a ticket as empty if its batch was never sized
struct SizeOnDrop(Ticket);

impl Drop for SizeOnDrop {
    fn drop(&mut self) {
        self.0.abandon_if_unsized();
    }
}

/// Shared dispatch state, cloned into every task
#[derive(Debug)]
pub(crate) struct Dispatcher {
    handle: Handle,
    page_table: Arc<PageTableManager>,
    fill_limit: Option<usize>,
    limits: Mutex<HashMap<u32, Arc<Semaphore>>>,
    pub(crate) counters: FillCounters,
    #[cfg(feature = "storage")]
    trace: Option<TraceRecorder>,
}

impl Dispatcher {
    fn limit_for(&self, handler: &Arc<dyn RequestHandler>) -> Option<Arc<Semaphore>> {
        let permits = self.fill_limit?;
        let key = handler.page_range().start;
        Some(Arc::clone(
            self.limits
                .lock()
                .entry(key)
                .or_insert_with(|| Arc::new(Semaphore::new(permits))),
        ))
    }

    /// Dispatch one fill task per page and size `ticket` accordingly
    ///
    /// Pages without a request handler are logged and dropped; they are not
    /// part of the ticket.
    pub(crate) fn add_requests(
        self: &Arc<Self>,
        paging: &Arc<PagingSystem>,
        stream: Stream,
        ticket: &Ticket,
        pages: &[u32],
    ) {
        let mut tasks = Vec::with_capacity(pages.len());
        for &page in pages {
            match self.page_table.find_request_handler(page) {
                Some(handler) => tasks.push((page, handler)),
                None => {
                    error!(
                        page,
                        context = stream.context.0,
                        "requested page has no request handler"
                    );
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        #[cfg(feature = "storage")]
        if let Some(trace) = &self.trace {
            let dispatched: Vec<u32> = tasks.iter().map(|(page, _)| *page).collect();
            trace.record(stream, ticket.batch_id(), &dispatched);
        }

        ticket.update(tasks.len());
        for (page, handler) in tasks {
            let guard = TaskGuard::new(ticket.clone());
            let permits = self.limit_for(&handler);
            let paging = Arc::clone(paging);
            let dispatcher = Arc::clone(self);
            self.handle.spawn(async move {
                let _permit = match permits {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                let outcome = tokio::task::spawn_blocking(move || {
                    let ctx = FillContext {
                        stream,
                        paging: &paging,
                    };
                    handler.fill_request(&ctx, page)
                })
                .await
                .unwrap_or_else(|e| {
                    error!(page, error = %e, "fill task panicked");
                    FillOutcome::Failed
                });
                dispatcher.counters.record(outcome);
                guard.finish(outcome);
            });
        }
    }

    /// Read back `context`'s faults on the runtime, then dispatch fills
    ///
    /// `on_pulled` sees the pull outcome before dispatch (for transfer
    /// statistics). The context's slot is released once readback is done.
    pub(crate) fn pull_and_dispatch<F>(
        self: &Arc<Self>,
        paging: Arc<PagingSystem>,
        context: DeviceContext,
        ticket: Ticket,
        on_pulled: F,
    ) where
        F: FnOnce(&PullOutcome) + Send + 'static,
    {
        let dispatcher = Arc::clone(self);
        self.handle.spawn(async move {
            let _sized = SizeOnDrop(ticket.clone());
            let started = Instant::now();
            let stream = ticket.stream();
            let pull = {
                let paging = Arc::clone(&paging);
                tokio::task::spawn_blocking(move || {
                    let pulled = paging.pull_requests(context.slot(), context.launch());
                    drop(context);
                    pulled
                })
                .await
            };

            match pull {
                Ok(Ok(pulled)) => {
                    if pulled.overflowed > 0 {
                        warn!(
                            context = stream.context.0,
                            overflowed = pulled.overflowed,
                            "fault buffer overflowed; dropped pages will fault again"
                        );
                        dispatcher
                            .counters
                            .overflowed
                            .fetch_add(u64::from(pulled.overflowed), Ordering::Relaxed);
                    }
                    on_pulled(&pulled);
                    dispatcher.add_requests(&paging, stream, &ticket, &pulled.fills);
                }
                Ok(Err(e)) => {
                    error!(context = stream.context.0, error = %e, "pulling requests failed");
                }
                Err(e) => {
                    error!(context = stream.context.0, error = %e, "pull task panicked");
                }
            }
            dispatcher.counters.add_processing_time(started.elapsed());
        });
    }

    /// Tell owning handlers about unmapped pages (off the caller's thread)
    pub(crate) fn release_pages(
        self: &Arc<Self>,
        paging: Arc<PagingSystem>,
        stream: Stream,
        released: Vec<ReleasedPage>,
    ) {
        if released.is_empty() {
            return;
        }
        let page_table = Arc::clone(&self.page_table);
        self.handle.spawn_blocking(move || {
            let ctx = FillContext {
                stream,
                paging: &paging,
            };
            for page in released {
                if let Some(handler) = page_table.find_request_handler(page.page) {
                    handler.release_page(&ctx, page.page, page.entry);
                }
            }
        });
    }

    /// Append batches recorded since the last flush, if recording
    ///
    /// # Errors
    ///
    /// Returns error if the trace file cannot be written
    pub(crate) fn flush_trace(&self) -> anyhow::Result<()> {
        #[cfg(feature = "storage")]
        if let Some(trace) = &self.trace {
            trace.flush()?;
        }
        Ok(())
    }

    fn close_trace(&self) -> anyhow::Result<()> {
        #[cfg(feature = "storage")]
        if let Some(trace) = &self.trace {
            trace.close()?;
        }
        Ok(())
    }
}

/// Owner of the worker runtime
#[derive(Debug)]
pub(crate) struct RequestProcessor {
    runtime: Option<Runtime>,
    dispatcher: Arc<Dispatcher>,
}

impl RequestProcessor {
    /// Start workers for `options` (already configured)
    ///
    /// # Errors
    ///
    /// Returns `PagingError::Io` if the runtime cannot be built
    pub(crate) fn new(
        page_table: Arc<PageTableManager>,
        options: &Options,
    ) -> Result<Self, PagingError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(options.max_threads.max(1))
            .thread_name("trueno-pager-worker")
            .build()?;

        #[cfg(feature = "storage")]
        let trace = options
            .trace_file
            .as_ref()
            .map(|path| TraceRecorder::new(path.clone(), options));
        #[cfg(not(feature = "storage"))]
        if options.trace_file.is_some() {
            warn!("trace_file set but the `storage` feature is disabled; not recording");
        }

        let dispatcher = Arc::new(Dispatcher {
            handle: runtime.handle().clone(),
            page_table,
            fill_limit: options.max_concurrent_fills_per_handler,
            limits: Mutex::new(HashMap::new()),
            counters: FillCounters::default(),
            #[cfg(feature = "storage")]
            trace,
        });

        Ok(Self {
            runtime: Some(runtime),
            dispatcher,
        })
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }
}

impl Drop for RequestProcessor {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        if let Err(e) = self.dispatcher.close_trace() {
            error!(error = %e, "failed to write request trace");
        }
    }
}
