//! Ordered, bounded-concurrency dispatch
//!
//! A fixed pool of workers fetches work items in parallel while the consumer
//! receives outcomes strictly in ordinal order. Each item is tagged with its
//! ordinal when it is queued. A worker whose item is not yet due parks the
//! outcome in the shared backlog; the worker that delivers ordinal `n` then
//! drains any parked outcomes for `n + 1`, `n + 2`, ... in turn.
//!
//! `next_ordinal` and the backlog live under one mutex. The due check, the
//! increment and the send on a pre-reserved channel slot all happen while it
//! is held, so outcomes enter the output channel in ordinal order.
//!
//! Memory is bounded by a semaphore: every queued item holds a slot from the
//! moment it is handed to a worker until its outcome is delivered, so at most
//! `max_backlog` outcomes are in flight or parked at any time.

use feedsync_common::types::{FetchResult, Ordinal, WorkItem};
use futures::future::join_all;
use futures::Stream;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

use crate::config::PipelineConfig;
use crate::error::FetchError;
use crate::fetcher::ItemFetcher;

/// What the consumer receives for each work item
pub type Outcome = Result<FetchResult, FetchError>;

/// Resequencing state shared by all workers
#[derive(Debug)]
pub struct DispatchState<T> {
    next_ordinal: Ordinal,
    backlog: BTreeMap<Ordinal, T>,
    peak_backlog: usize,
}

impl<T> DispatchState<T> {
    pub fn new() -> Self {
        Self {
            next_ordinal: 0,
            backlog: BTreeMap::new(),
            peak_backlog: 0,
        }
    }

    /// Ordinal the consumer is waiting for
    pub fn next_ordinal(&self) -> Ordinal {
        self.next_ordinal
    }

    pub fn is_due(&self, ordinal: Ordinal) -> bool {
        ordinal == self.next_ordinal
    }

    /// Holds an outcome that finished ahead of its turn.
    pub fn park(&mut self, ordinal: Ordinal, value: T) {
        debug_assert!(ordinal > self.next_ordinal, "parked an ordinal that is due or delivered");
        self.backlog.insert(ordinal, value);
        self.peak_backlog = self.peak_backlog.max(self.backlog.len());
    }

    /// Marks the due ordinal as delivered.
    pub fn advance(&mut self) {
        self.next_ordinal += 1;
    }

    pub fn has_ready(&self) -> bool {
        self.backlog.contains_key(&self.next_ordinal)
    }

    /// Removes the parked outcome for the due ordinal and advances past it.
    pub fn take_ready(&mut self) -> Option<T> {
        let value = self.backlog.remove(&self.next_ordinal)?;
        self.advance();
        Some(value)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn peak_backlog(&self) -> usize {
        self.peak_backlog
    }
}

impl<T> Default for DispatchState<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A queued work item and the backlog slot it occupies
struct Job {
    ordinal: Ordinal,
    item: WorkItem,
    slot: OwnedSemaphorePermit,
}

/// A finished outcome still holding its backlog slot
struct Pending {
    outcome: Outcome,
    slot: OwnedSemaphorePermit,
}

type SharedState = Arc<Mutex<DispatchState<Pending>>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, DispatchState<Pending>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a worker needs. The output sender lives here only, so the
/// output channel closes once the last worker has exited.
struct Shared {
    state: SharedState,
    jobs: tokio::sync::Mutex<mpsc::Receiver<Job>>,
    output: mpsc::Sender<Outcome>,
    cancel: CancellationToken,
    fetcher: Arc<ItemFetcher>,
}

impl Shared {
    async fn next_job(&self) -> Option<Job> {
        let mut jobs = self.jobs.lock().await;
        jobs.recv().await
    }

    /// Waits for room in the output channel. `None` means stop.
    async fn reserve(&self) -> Option<mpsc::Permit<'_, Outcome>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.output.reserve() => permit.ok(),
        }
    }

    /// Delivers or parks a finished outcome. Returns false once the worker
    /// should stop.
    async fn place(&self, ordinal: Ordinal, pending: Pending) -> bool {
        let due = {
            let mut state = lock_state(&self.state);
            if state.is_due(ordinal) {
                Some(pending)
            } else {
                state.park(ordinal, pending);
                None
            }
        };
        let Some(Pending { outcome, slot }) = due else {
            return true;
        };

        // Only the holder of the due ordinal can advance past it, so it is
        // still due once the permit is in hand.
        let Some(permit) = self.reserve().await else {
            return false;
        };
        {
            let mut state = lock_state(&self.state);
            state.advance();
            permit.send(outcome);
        }
        drop(slot);

        self.drain_backlog().await
    }

    /// Delivers parked outcomes for as long as the due ordinal is parked.
    async fn drain_backlog(&self) -> bool {
        loop {
            let ready = lock_state(&self.state).has_ready();
            if !ready {
                return true;
            }

            let Some(permit) = self.reserve().await else {
                return false;
            };
            let released = {
                let mut state = lock_state(&self.state);
                match state.take_ready() {
                    Some(Pending { outcome, slot }) => {
                        permit.send(outcome);
                        Some(slot)
                    },
                    // Another worker delivered it first
                    None => None,
                }
            };
            drop(released);
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            job = shared.next_job() => job,
        };
        let Some(Job { ordinal, item, slot }) = job else {
            break;
        };

        let outcome = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            outcome = shared.fetcher.fetch(&item) => outcome,
        };

        if !shared.place(ordinal, Pending { outcome, slot }).await {
            break;
        }
    }
    debug!("Worker finished");
}

async fn feed(
    items: Vec<WorkItem>,
    jobs: mpsc::Sender<Job>,
    slots: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    for (ordinal, item) in items.into_iter().enumerate() {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            slot = Arc::clone(&slots).acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => break,
            },
        };

        let job = Job { ordinal, item, slot };
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = jobs.send(job) => sent,
        };
        if sent.is_err() {
            break;
        }
    }
}

/// Outcomes of one dispatch, in ascending ordinal order
///
/// Ends after the last outcome, or early if the dispatch was cancelled.
pub struct OrderedStream {
    rx: mpsc::Receiver<Outcome>,
    state: SharedState,
    expected: usize,
}

impl OrderedStream {
    pub async fn recv(&mut self) -> Option<Outcome> {
        self.rx.recv().await
    }

    /// Number of outcomes a complete dispatch delivers
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Largest number of outcomes that were parked at once
    pub fn peak_backlog(&self) -> usize {
        lock_state(&self.state).peak_backlog()
    }
}

impl Stream for OrderedStream {
    type Item = Outcome;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Outcome>> {
        self.rx.poll_recv(cx)
    }
}

/// Runs fetches on a worker pool and resequences their outcomes
#[derive(Clone)]
pub struct OrderedDispatcher {
    fetcher: Arc<ItemFetcher>,
    concurrency: usize,
    max_backlog: usize,
}

impl OrderedDispatcher {
    /// `concurrency` is raised to at least one and `max_backlog` to at least
    /// `concurrency`. Both are capped at [`Semaphore::MAX_PERMITS`].
    pub fn new(fetcher: Arc<ItemFetcher>, concurrency: usize, max_backlog: usize) -> Self {
        let concurrency = concurrency.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            fetcher,
            concurrency,
            max_backlog: max_backlog.max(concurrency).min(Semaphore::MAX_PERMITS),
        }
    }

    pub fn from_config(fetcher: Arc<ItemFetcher>, config: &PipelineConfig) -> Self {
        Self::new(fetcher, config.concurrency, config.backlog_limit())
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Starts fetching `items` and returns their outcomes in order.
    ///
    /// Must be called from within a Tokio runtime. Cancelling `cancel` stops
    /// the feeder and the workers; the stream then ends without delivering
    /// the remaining outcomes.
    pub fn dispatch(&self, items: Vec<WorkItem>, cancel: CancellationToken) -> OrderedStream {
        let expected = items.len();
        let workers = self.concurrency.min(expected);

        let state: SharedState = Arc::new(Mutex::new(DispatchState::new()));
        let (job_tx, job_rx) = mpsc::channel(self.concurrency);
        let (out_tx, out_rx) = mpsc::channel(1);

        tokio::spawn(
            feed(
                items,
                job_tx,
                Arc::new(Semaphore::new(self.max_backlog)),
                cancel.clone(),
            )
            .instrument(info_span!("feeder")),
        );

        let shared = Arc::new(Shared {
            state: Arc::clone(&state),
            jobs: tokio::sync::Mutex::new(job_rx),
            output: out_tx,
            cancel,
            fetcher: Arc::clone(&self.fetcher),
        });

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                tokio::spawn(run_worker(Arc::clone(&shared)).instrument(info_span!("worker", id)))
            })
            .collect();
        drop(shared);

        tokio::spawn(async move {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!("Dispatch worker failed: {}", e);
                }
            }
        });

        debug!(items = expected, workers, max_backlog = self.max_backlog, "Dispatch started");

        OrderedStream {
            rx: out_rx,
            state,
            expected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_due_ordinal_is_not_parked() {
        let state: DispatchState<&str> = DispatchState::new();
        assert!(state.is_due(0));
        assert!(!state.is_due(1));
        assert!(!state.has_ready());
    }

    #[test]
    fn test_take_ready_releases_in_order() {
        let mut state = DispatchState::new();
        state.park(2, "c");
        state.park(1, "b");
        assert_eq!(state.take_ready(), None);

        // ordinal 0 delivered directly
        state.advance();
        assert_eq!(state.take_ready(), Some("b"));
        assert_eq!(state.take_ready(), Some("c"));
        assert_eq!(state.take_ready(), None);
        assert_eq!(state.next_ordinal(), 3);
        assert_eq!(state.backlog_len(), 0);
    }

    #[test]
    fn test_gap_blocks_later_outcomes() {
        let mut state = DispatchState::new();
        state.advance();
        state.park(3, "d");
        assert!(!state.has_ready());
        assert_eq!(state.take_ready(), None);
        assert_eq!(state.next_ordinal(), 1);
    }

    #[test]
    fn test_peak_backlog_is_high_water_mark() {
        let mut state = DispatchState::new();
        state.park(1, ());
        state.park(2, ());
        state.park(3, ());
        state.advance();
        while state.take_ready().is_some() {}
        state.park(5, ());

        assert_eq!(state.peak_backlog(), 3);
        assert_eq!(state.backlog_len(), 1);
    }
}
