//! Completion tracking for batches of fill tasks
//!
//! A `Ticket` is shared between the caller of `pull_requests` (or
//! `replay_requests`) and the workers filling the requested pages. The task
//! count is unknown until the fault buffer has been read back on a worker,
//! so `num_tasks_total()` reports `None` until then.

use super::device::Stream;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Result of one fill task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FillOutcome {
    /// Callback produced an entry; the page is staged for the next push
    Filled,

    /// Page was already resident (or staged) when the task got the page lock
    AlreadyResident,

    /// Callback chose not to produce data yet; the page stays absent
    Deferred,

    /// Callback failed (or panicked); the page stays absent
    Failed,
}

/// Per-outcome task counts of a ticket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TicketSummary {
    /// Tasks issued (`None` while the batch is still being read back)
    pub total: Option<usize>,

    /// Tasks not yet finished
    pub remaining: Option<usize>,

    /// Tasks that staged a mapping
    pub filled: usize,

    /// Tasks that found the page resident
    pub already_resident: usize,

    /// Tasks whose callback deferred
    pub deferred: usize,

    /// Tasks whose callback failed
    pub failed: usize,
}

#[derive(Debug, Default)]
struct TicketState {
    total: Option<usize>,
    remaining: usize,
    filled: usize,
    already_resident: usize,
    deferred: usize,
    failed: usize,
}

impl TicketState {
    fn is_complete(&self) -> bool {
        self.total.is_some() && self.remaining == 0
    }
}

#[derive(Debug)]
struct TicketInner {
    batch_id: u32,
    stream: Stream,
    state: Mutex<TicketState>,
    done: Condvar,
    notify: Notify,
}

/// Handle tracking a batch of in-flight fill tasks
#[derive(Debug, Clone)]
pub struct Ticket {
    inner: Arc<TicketInner>,
}

impl Ticket {
    pub(crate) fn new(batch_id: u32, stream: Stream) -> Self {
        Self {
            inner: Arc::new(TicketInner {
                batch_id,
                stream,
                state: Mutex::new(TicketState::default()),
                done: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Set the number of tasks in the batch
    ///
    /// Called once, before any task of the batch is dispatched. A batch of
    /// zero tasks completes immediately.
    pub(crate) fn update(&self, num_tasks: usize) {
        let mut state = self.inner.state.lock();
        debug_assert!(state.total.is_none(), "ticket task count set twice");
        state.total = Some(num_tasks);
        state.remaining = num_tasks;
        if num_tasks == 0 {
            drop(state);
            self.wake();
        }
    }

    /// Resolve as an empty batch if the task count was never set
    pub(crate) fn abandon_if_unsized(&self) {
        let mut state = self.inner.state.lock();
        if state.total.is_none() {
            state.total = Some(0);
            state.remaining = 0;
            drop(state);
            self.wake();
        }
    }

    /// Record completion of one task
    pub(crate) fn notify(&self, outcome: FillOutcome) {
        let mut state = self.inner.state.lock();
        match outcome {
            FillOutcome::Filled => state.filled += 1,
            FillOutcome::AlreadyResident => state.already_resident += 1,
            FillOutcome::Deferred => state.deferred += 1,
            FillOutcome::Failed => state.failed += 1,
        }
        debug_assert!(state.remaining > 0, "more notifications than tasks");
        state.remaining = state.remaining.saturating_sub(1);
        let complete = state.is_complete();
        drop(state);
        if complete {
            self.wake();
        }
    }

    fn wake(&self) {
        self.inner.done.notify_all();
        self.inner.notify.notify_waiters();
    }

    /// Block the calling thread until every task has finished
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while !state.is_complete() {
            self.inner.done.wait(&mut state);
        }
    }

    /// Block up to `timeout`; returns true if the batch completed
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.is_complete() {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.is_complete();
            }
        }
        true
    }

    /// Wait asynchronously until every task has finished
    pub async fn completed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }

    /// True once the task count is known and every task has finished
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().is_complete()
    }

    /// Number of tasks issued, `None` until known
    #[must_use]
    pub fn num_tasks_total(&self) -> Option<usize> {
        self.inner.state.lock().total
    }

    /// Number of tasks still outstanding, `None` until known
    #[must_use]
    pub fn num_tasks_remaining(&self) -> Option<usize> {
        let state = self.inner.state.lock();
        state.total.map(|_| state.remaining)
    }

    /// Snapshot of per-outcome counts
    #[must_use]
    pub fn summary(&self) -> TicketSummary {
        let state = self.inner.state.lock();
        TicketSummary {
            total: state.total,
            remaining: state.total.map(|_| state.remaining),
            filled: state.filled,
            already_resident: state.already_resident,
            deferred: state.deferred,
            failed: state.failed,
        }
    }

    /// Caller-supplied batch id
    #[must_use]
    pub fn batch_id(&self) -> u32 {
        self.inner.batch_id
    }

    /// Stream the batch was issued on
    #[must_use]
    pub fn stream(&self) -> Stream {
        self.inner.stream
    }
}

/// Notifies `Failed` if dropped before the task reported an outcome
///
/// Worker tasks hold one of these so a ticket resolves even when the task is
/// cancelled by runtime shutdown.
#[derive(Debug)]
pub(crate) struct TaskGuard {
    ticket: Option<Ticket>,
}

impl TaskGuard {
    pub(crate) fn new(ticket: Ticket) -> Self {
        Self {
            ticket: Some(ticket),
        }
    }

    pub(crate) fn finish(mut self, outcome: FillOutcome) {
        if let Some(ticket) = self.ticket.take() {
            ticket.notify(outcome);
        }
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            ticket.notify(FillOutcome::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ticket() -> Ticket {
        Ticket::new(7, Stream::new(0, 0))
    }

    #[test]
    fn test_unknown_until_update() {
        let ticket = ticket();
        assert_eq!(ticket.num_tasks_total(), None);
        assert_eq!(ticket.num_tasks_remaining(), None);
        assert!(!ticket.is_complete());
        assert!(!ticket.wait_timeout(Duration::from_millis(10)));

        ticket.update(2);
        assert_eq!(ticket.num_tasks_total(), Some(2));
        assert_eq!(ticket.num_tasks_remaining(), Some(2));
        assert_eq!(ticket.batch_id(), 7);
    }

    #[test]
    fn test_empty_batch_completes_immediately() {
        let ticket = ticket();
        ticket.update(0);
        assert!(ticket.is_complete());
        ticket.wait();
    }

    #[test]
    fn test_wait_blocks_until_all_notified() {
        let ticket = ticket();
        ticket.update(3);

        let worker = {
            let ticket = ticket.clone();
            thread::spawn(move || {
                ticket.notify(FillOutcome::Filled);
                ticket.notify(FillOutcome::Deferred);
                ticket.notify(FillOutcome::Failed);
            })
        };

        ticket.wait();
        worker.join().unwrap();

        let summary = ticket.summary();
        assert_eq!(summary.total, Some(3));
        assert_eq!(summary.remaining, Some(0));
        assert_eq!(
            (summary.filled, summary.deferred, summary.failed),
            (1, 1, 1)
        );
    }

    #[tokio::test]
    async fn test_completed_async() {
        let ticket = ticket();
        let waiter = {
            let ticket = ticket.clone();
            tokio::spawn(async move { ticket.completed().await })
        };

        ticket.update(1);
        ticket.notify(FillOutcome::AlreadyResident);
        waiter.await.unwrap();
        assert_eq!(ticket.summary().already_resident, 1);
    }

    #[test]
    fn test_abandon_only_affects_unsized_ticket() {
        let unsized_ticket = ticket();
        unsized_ticket.abandon_if_unsized();
        assert!(unsized_ticket.is_complete());
        assert_eq!(unsized_ticket.num_tasks_total(), Some(0));

        let sized = ticket();
        sized.update(1);
        sized.abandon_if_unsized();
        assert!(!sized.is_complete());
    }

    #[test]
    fn test_task_guard_notifies_failed_on_drop() {
        let ticket = ticket();
        ticket.update(2);
        TaskGuard::new(ticket.clone()).finish(FillOutcome::Filled);
        drop(TaskGuard::new(ticket.clone()));

        assert!(ticket.is_complete());
        let summary = ticket.summary();
        assert_eq!((summary.filled, summary.failed), (1, 1));
    }
}
