//! Pipeline driver
//!
//! One run: read the watermark, enumerate newer archives, fetch them on the
//! worker pool and commit them in key order. The whole run shares a single
//! cancellation token, derived from the caller's, which the deadline also
//! fires.

use feedsync_common::types::Watermark;
use reqwest::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::archive::ZipDecoder;
use crate::commit::{CommitStage, CommitSummary};
use crate::config::{ListingConfig, PipelineConfig};
use crate::dispatch::OrderedDispatcher;
use crate::error::{PipelineError, Result};
use crate::fetcher::{HttpArchiveFetcher, ItemFetcher};
use crate::listing::{ListingClient, WorkSource};
use crate::progress::{commit_progress, format_count};
use crate::store::ArchiveStore;

/// Totals for a run that committed everything it found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub committed: usize,
    pub records: usize,
    pub watermark: Watermark,
    /// Most outcomes parked at once while waiting for a slower predecessor
    pub peak_backlog: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The listing had nothing newer than the watermark
    NothingToDo { watermark: Watermark },
    Completed(RunReport),
}

pub struct Pipeline {
    source: Arc<dyn WorkSource>,
    dispatcher: OrderedDispatcher,
    store: Arc<dyn ArchiveStore>,
    config: PipelineConfig,
    progress: bool,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn WorkSource>,
        fetcher: Arc<ItemFetcher>,
        store: Arc<dyn ArchiveStore>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            dispatcher: OrderedDispatcher::from_config(fetcher, &config),
            store,
            config,
            progress: false,
        })
    }

    /// Pipeline reading the listing page over HTTP and fetching zip archives.
    pub fn http(
        listing: &ListingConfig,
        config: PipelineConfig,
        store: Arc<dyn ArchiveStore>,
    ) -> Result<Self> {
        listing.validate()?;
        let source = Arc::new(ListingClient::new(listing)?);

        let client = Client::builder()
            .user_agent(listing.user_agent.as_str())
            .build()?;
        let fetcher = Arc::new(ItemFetcher::new(
            Arc::new(HttpArchiveFetcher::new(client, Arc::new(ZipDecoder))),
            config.retry,
        ));

        Self::new(source, fetcher, store, config)
    }

    /// Show a progress bar while committing
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Executes one run.
    ///
    /// Archives committed before a failure, cancellation or the deadline stay
    /// committed; the error reports how many made it.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        let started = Instant::now();
        let timeout = self.config.run_timeout();
        let deadline = started + timeout;

        let run_cancel = cancel.child_token();
        let _stop_workers = run_cancel.clone().drop_guard();

        let watermark = bounded(&run_cancel, deadline, timeout, self.store.load_watermark())
            .await??;
        info!(watermark = %watermark, "Latest committed archive: {}", watermark.key.as_deref().unwrap_or("none"));

        let items = bounded(&run_cancel, deadline, timeout, self.source.enumerate(&watermark))
            .await??;
        if items.is_empty() {
            info!("No new archives found");
            return Ok(RunOutcome::NothingToDo { watermark });
        }

        let expected = items.len();
        info!(
            count = expected,
            workers = self.dispatcher.concurrency().min(expected),
            "Fetching {}",
            format_count(expected, "archive")
        );

        let mut stage = CommitStage::new(Arc::clone(&self.store));
        let progress = if self.progress {
            match commit_progress(expected as u64) {
                Ok(pb) => Some(pb),
                Err(e) => {
                    warn!("Progress bar disabled: {}", e);
                    None
                },
            }
        } else {
            None
        };
        if let Some(pb) = &progress {
            stage = stage.with_progress(pb.clone());
        }

        let mut stream = self.dispatcher.dispatch(items, run_cancel.clone());
        let mut summary = CommitSummary::starting_at(watermark);
        let mut timed_out = false;

        let result = {
            let commit = stage.run(&mut stream, &mut summary, &run_cancel);
            tokio::pin!(commit);
            tokio::select! {
                biased;
                result = &mut commit => result,
                _ = sleep_until(deadline) => {
                    warn!(timeout = ?timeout, "Run deadline reached, cancelling");
                    timed_out = true;
                    run_cancel.cancel();
                    // Let an in-flight commit finish so the summary is exact
                    commit.await
                }
            }
        };

        if let Some(pb) = &progress {
            pb.finish_and_clear();
        }
        result?;

        if summary.committed < expected {
            warn!(
                committed = summary.committed,
                expected,
                "Run stopped before all archives were committed"
            );
            return Err(if timed_out {
                PipelineError::DeadlineExceeded {
                    committed: summary.committed,
                    expected,
                    timeout,
                }
            } else {
                PipelineError::Cancelled {
                    committed: summary.committed,
                    expected,
                }
            });
        }

        let report = RunReport {
            committed: summary.committed,
            records: summary.records,
            watermark: summary.watermark,
            peak_backlog: stream.peak_backlog(),
            elapsed: started.elapsed(),
        };
        info!(
            committed = report.committed,
            documents = report.records,
            watermark = %report.watermark,
            "Finished in {:?}",
            report.elapsed
        );

        Ok(RunOutcome::Completed(report))
    }
}

/// Runs a setup step under the run's cancellation and deadline.
async fn bounded<F: Future>(
    cancel: &CancellationToken,
    deadline: Instant,
    timeout: Duration,
    step: F,
) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled { committed: 0, expected: 0 }),
        _ = sleep_until(deadline) => {
            cancel.cancel();
            Err(PipelineError::DeadlineExceeded { committed: 0, expected: 0, timeout })
        },
        output = step => Ok(output),
    }
}
