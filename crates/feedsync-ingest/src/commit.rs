//! Commit stage
//!
//! Consumes the ordered outcome stream and commits each archive on top of the
//! watermark left by the previous one. The first failed fetch or commit
//! cancels the run; everything before it stays committed.

use feedsync_common::types::{FetchResult, Watermark};
use indicatif::ProgressBar;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dispatch::OrderedStream;
use crate::error::{CommitError, PipelineError};
use crate::store::ArchiveStore;

/// Running totals for one commit pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Archives committed
    pub committed: usize,
    /// Documents appended across those archives
    pub records: usize,
    /// Watermark after the last successful commit
    pub watermark: Watermark,
}

impl CommitSummary {
    pub fn starting_at(watermark: Watermark) -> Self {
        Self {
            watermark,
            ..Default::default()
        }
    }
}

pub struct CommitStage {
    store: Arc<dyn ArchiveStore>,
    progress: Option<ProgressBar>,
}

impl CommitStage {
    pub fn new(store: Arc<dyn ArchiveStore>) -> Self {
        Self {
            store,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Commits one result on top of `watermark`.
    ///
    /// Results must arrive in ascending key order; a key that does not sort
    /// after the watermark is refused before the store is touched.
    pub async fn commit(
        &self,
        watermark: &Watermark,
        result: &FetchResult,
    ) -> Result<Watermark, CommitError> {
        if let Some(previous) = watermark.key.as_deref() {
            if !watermark.is_newer(&result.key) {
                return Err(CommitError::Regression {
                    previous: previous.to_string(),
                    next: result.key.clone(),
                });
            }
        }

        self.store.commit(watermark, result).await
    }

    /// Commits outcomes until the stream ends or `cancel` fires.
    ///
    /// `summary` is updated after every commit so it stays accurate when the
    /// caller stops waiting early.
    pub async fn run(
        &self,
        stream: &mut OrderedStream,
        summary: &mut CommitSummary,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        loop {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                outcome = stream.recv() => outcome,
            };
            let Some(outcome) = outcome else {
                return Ok(());
            };

            let result = match outcome {
                Ok(result) => result,
                Err(e) => {
                    error!(archive = %e.key, attempts = e.attempts, "Giving up on archive: {}", e.source);
                    cancel.cancel();
                    return Err(e.into());
                },
            };

            match self.commit(&summary.watermark, &result).await {
                Ok(next) => {
                    summary.committed += 1;
                    summary.records += result.record_count();
                    summary.watermark = next;
                    info!(
                        archive = %result.key,
                        documents = result.record_count(),
                        "Saved archive"
                    );
                    if let Some(pb) = &self.progress {
                        pb.inc(1);
                    }
                },
                Err(e) => {
                    error!(archive = %result.key, "Commit failed: {}", e);
                    cancel.cancel();
                    return Err(e.into());
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_commit_rejects_regression() {
        let store = Arc::new(MemoryStore::default());
        let stage = CommitStage::new(store.clone());

        let watermark = stage
            .commit(&Watermark::empty(), &FetchResult::new("b.zip", vec![]))
            .await
            .unwrap();
        let err = stage
            .commit(&watermark, &FetchResult::new("a.zip", vec![]))
            .await
            .unwrap_err();

        assert!(matches!(err, CommitError::Regression { .. }));
        assert_eq!(store.committed_keys(), vec!["b.zip"]);
    }

    #[tokio::test]
    async fn test_commit_chains_watermarks() {
        let store = Arc::new(MemoryStore::default());
        let stage = CommitStage::new(store.clone());

        let first = stage
            .commit(&Watermark::empty(), &FetchResult::new("a.zip", vec!["1".into()]))
            .await
            .unwrap();
        let second = stage
            .commit(&first, &FetchResult::new("b.zip", vec!["2".into()]))
            .await
            .unwrap();

        assert_eq!(second, Watermark::at("b.zip", 2));
        assert_eq!(store.documents(), vec!["1", "2"]);
    }
}
