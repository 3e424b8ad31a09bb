//! Ingestion configuration
//!
//! Built by the CLI from flags and environment variables and handed to each
//! component at construction time.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{PipelineError, Result};

/// Listing page queried when no URL is configured
pub const DEFAULT_LISTING_URL: &str = "http://bitly.com/nuvi-plz";

/// Parallel downloads per run
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Results allowed in flight or parked per worker when no backlog limit is set
pub const BACKLOG_PER_WORKER: usize = 4;

pub const DEFAULT_LISTING_TIMEOUT_SECS: u64 = 5;

pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 120;

/// Attempts per archive, including the first
pub const MAX_ATTEMPTS: u32 = 3;

pub const DEFAULT_LIST_KEY: &str = "NEWS_XML";

pub const DEFAULT_WATERMARK_KEY: &str = "NEWS_XML_LATEST";

/// Listing page location and transport settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListingConfig {
    pub url: String,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl ListingConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(invalid("listing URL cannot be empty"));
        }
        if self.timeout_secs == 0 {
            return Err(invalid("listing timeout must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_LISTING_URL.to_string(),
            timeout_secs: DEFAULT_LISTING_TIMEOUT_SECS,
            user_agent: format!("feedsync-ingest/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Bounded retry for a single archive fetch
///
/// The delay grows linearly with the attempt number; a zero delay retries
/// immediately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay_ms: 0,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = delay.as_millis() as u64;
        self
    }

    /// Pause before `attempt` (1-based). The first attempt never waits.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms * u64::from(attempt.saturating_sub(1)))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::immediate(MAX_ATTEMPTS)
    }
}

/// Dispatch and run-scope settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of fetch workers
    pub concurrency: usize,
    /// Cap on results fetched ahead of the next one due for commit.
    /// Defaults to `concurrency * BACKLOG_PER_WORKER`.
    pub max_backlog: Option<usize>,
    pub run_timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn backlog_limit(&self) -> usize {
        self.max_backlog
            .unwrap_or(self.concurrency.saturating_mul(BACKLOG_PER_WORKER))
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(invalid("must specify at least one download"));
        }
        if self.backlog_limit() > Semaphore::MAX_PERMITS {
            return Err(invalid(format!(
                "max backlog ({}) cannot exceed {}",
                self.backlog_limit(),
                Semaphore::MAX_PERMITS
            )));
        }
        if self.backlog_limit() < self.concurrency {
            return Err(invalid(format!(
                "max backlog ({}) must be at least the number of downloads ({})",
                self.backlog_limit(),
                self.concurrency
            )));
        }
        if self.run_timeout_secs == 0 {
            return Err(invalid("run timeout must be greater than 0"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry attempts must be greater than 0"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_backlog: None,
            run_timeout_secs: DEFAULT_RUN_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Names of the document list and watermark in the durable store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    pub list_key: String,
    pub watermark_key: String,
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.list_key.is_empty() || self.watermark_key.is_empty() {
            return Err(invalid("store keys cannot be empty"));
        }
        if self.list_key == self.watermark_key {
            return Err(invalid("list key and watermark key must differ"));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            list_key: DEFAULT_LIST_KEY.to_string(),
            watermark_key: DEFAULT_WATERMARK_KEY.to_string(),
        }
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::InvalidConfig(message.into())
}
