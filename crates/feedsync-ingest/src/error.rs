//! Error types for feed ingestion
//!
//! Per-entry decode problems are absorbed where they happen; everything else
//! in this module ends the run.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Why a single fetch attempt failed
#[derive(Error, Debug)]
pub enum FetchFailure {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error("decode task failed: {0}")]
    Task(String),
}

/// An archive could not be fetched and decoded within its retry budget.
#[derive(Error, Debug)]
#[error("failed to fetch {key} after {attempts} attempt(s): {source}")]
pub struct FetchError {
    pub key: String,
    pub attempts: u32,
    #[source]
    pub source: FetchFailure,
}

/// The payload is not a readable archive at all.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("invalid archive: {0}")]
    Invalid(#[from] zip::result::ZipError),
}

/// One entry inside an otherwise valid archive could not be read.
///
/// Never escalated: the entry is skipped and the rest of the archive is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unreadable entry '{entry}': {reason}")]
pub struct RecordDecodeError {
    pub entry: String,
    pub reason: String,
}

/// The listing page could not be fetched or understood.
#[derive(Error, Debug)]
pub enum EnumerationError {
    #[error("invalid listing URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to fetch listing: {0}")]
    Http(#[from] reqwest::Error),

    #[error("listing returned HTTP {0}")]
    Status(u16),

    #[error("invalid link pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// The durable store failed independently of any conflict.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// The watermark moved between the read that guarded a commit and the commit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "watermark '{watermark_key}' changed concurrently (expected revision {expected_revision}, found {found_revision:?})"
)]
pub struct ConflictError {
    pub watermark_key: String,
    pub expected_revision: i64,
    pub found_revision: Option<i64>,
}

/// A conditional commit was not applied.
#[derive(Error, Debug)]
pub enum CommitError {
    #[error(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("commit order regressed: '{next}' does not sort after '{previous}'")]
    Regression { previous: String, next: String },
}

/// Terminal failure of one pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error(transparent)]
    Enumeration(#[from] EnumerationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("run cancelled after committing {committed} of {expected} archive(s)")]
    Cancelled { committed: usize, expected: usize },

    #[error("run exceeded its {timeout:?} deadline after committing {committed} of {expected} archive(s)")]
    DeadlineExceeded {
        committed: usize,
        expected: usize,
        timeout: Duration,
    },
}

impl PipelineError {
    /// Returns true if the run ended because of a commit conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Commit(CommitError::Conflict(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_names_the_archive() {
        let err = FetchError {
            key: "b.zip".to_string(),
            attempts: 3,
            source: FetchFailure::Status(503),
        };
        assert_eq!(
            err.to_string(),
            "failed to fetch b.zip after 3 attempt(s): unexpected HTTP status 503"
        );
    }

    #[test]
    fn test_conflict_is_detected_through_pipeline_error() {
        let conflict = ConflictError {
            watermark_key: "NEWS_XML_LATEST".to_string(),
            expected_revision: 2,
            found_revision: Some(3),
        };
        let err = PipelineError::from(CommitError::from(conflict));
        assert!(err.is_conflict());
        assert!(!PipelineError::Cancelled {
            committed: 0,
            expected: 1
        }
        .is_conflict());
    }
}
