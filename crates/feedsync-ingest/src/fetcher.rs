//! Archive fetching with bounded retry
//!
//! [`HttpArchiveFetcher`] performs a single download and decode. [`ItemFetcher`]
//! wraps any [`ArchiveFetcher`] with the retry policy and is what the dispatch
//! workers call.

use async_trait::async_trait;
use feedsync_common::types::{FetchResult, WorkItem};
use reqwest::Client;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::archive::ArchiveDecoder;
use crate::config::RetryPolicy;
use crate::error::{FetchError, FetchFailure};

/// One attempt at retrieving and decoding an archive
#[async_trait]
pub trait ArchiveFetcher: Send + Sync {
    async fn fetch_once(&self, item: &WorkItem) -> Result<FetchResult, FetchFailure>;
}

/// Downloads archives over HTTP and decodes them off the async runtime
pub struct HttpArchiveFetcher {
    client: Client,
    decoder: Arc<dyn ArchiveDecoder>,
}

impl HttpArchiveFetcher {
    pub fn new(client: Client, decoder: Arc<dyn ArchiveDecoder>) -> Self {
        Self { client, decoder }
    }
}

#[async_trait]
impl ArchiveFetcher for HttpArchiveFetcher {
    async fn fetch_once(&self, item: &WorkItem) -> Result<FetchResult, FetchFailure> {
        let response = self.client.get(&item.locator).send().await?;
        if !response.status().is_success() {
            return Err(FetchFailure::Status(response.status().as_u16()));
        }

        let body = response.bytes().await?;
        debug!(archive = %item.key, bytes = body.len(), "Downloaded archive");

        let decoder = Arc::clone(&self.decoder);
        let key = item.key.clone();
        let records = tokio::task::spawn_blocking(move || decoder.decode(&key, &body))
            .await
            .map_err(|e| FetchFailure::Task(e.to_string()))??;

        Ok(FetchResult::new(item.key.clone(), records))
    }
}

/// Fetches one work item, retrying failed attempts per [`RetryPolicy`]
pub struct ItemFetcher {
    inner: Arc<dyn ArchiveFetcher>,
    retry: RetryPolicy,
}

impl ItemFetcher {
    pub fn new(inner: Arc<dyn ArchiveFetcher>, retry: RetryPolicy) -> Self {
        Self { inner, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fetch `item`, making at most `max_attempts` attempts.
    ///
    /// The error carries the last attempt's failure.
    #[instrument(skip(self, item), fields(archive = %item.key))]
    pub async fn fetch(&self, item: &WorkItem) -> Result<FetchResult, FetchError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!(archive = %item.key, "Fetch attempt {}/{}", attempt, max_attempts);

            match self.inner.fetch_once(item).await {
                Ok(result) => {
                    info!(
                        archive = %item.key,
                        records = result.record_count(),
                        "Fetched archive"
                    );
                    return Ok(result);
                },
                Err(e) if attempt < max_attempts => {
                    let delay = self.retry.delay_before(attempt + 1);
                    warn!(
                        archive = %item.key,
                        "Fetch attempt {}/{} failed: {}. Retrying in {:?}...",
                        attempt, max_attempts, e, delay
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                },
                Err(source) => {
                    return Err(FetchError {
                        key: item.key.clone(),
                        attempts: attempt,
                        source,
                    });
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` attempts, then succeeds
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ArchiveFetcher for Flaky {
        async fn fetch_once(&self, item: &WorkItem) -> Result<FetchResult, FetchFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                Err(FetchFailure::Status(503))
            } else {
                Ok(FetchResult::new(item.key.clone(), vec!["<doc/>".to_string()]))
            }
        }
    }

    fn item() -> WorkItem {
        WorkItem::new("a.zip", "http://localhost/a.zip")
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let flaky = Flaky::new(2);
        let fetcher = ItemFetcher::new(flaky.clone(), RetryPolicy::default());

        let result = fetcher.fetch(&item()).await.unwrap();
        assert_eq!(result.key, "a.zip");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_three_attempts() {
        let flaky = Flaky::new(u32::MAX);
        let fetcher = ItemFetcher::new(flaky.clone(), RetryPolicy::default());

        let err = fetcher.fetch(&item()).await.unwrap_err();
        assert_eq!(err.key, "a.zip");
        assert_eq!(err.attempts, 3);
        assert!(matches!(err.source, FetchFailure::Status(503)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_is_linear() {
        let flaky = Flaky::new(2);
        let policy = RetryPolicy::immediate(3).with_delay(Duration::from_millis(100));
        let fetcher = ItemFetcher::new(flaky, policy);

        let started = tokio::time::Instant::now();
        fetcher.fetch(&item()).await.unwrap();
        // 100ms before the second attempt, 200ms before the third
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }
}
