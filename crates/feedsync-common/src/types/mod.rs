//! Common types used across feedsync

use serde::{Deserialize, Serialize};

/// Position of a work item within the ascending-key sequence of one run.
///
/// Ordinals are the unit of resequencing: results are delivered downstream
/// in strictly ascending ordinal order.
pub type Ordinal = usize;

/// One discoverable archive to be fetched and committed.
///
/// Produced by the listing enumerator in ascending `key` order and never
/// mutated afterwards.
///
/// # Examples
///
/// ```
/// use feedsync_common::types::WorkItem;
///
/// let item = WorkItem::new("1491828942693.zip", "https://example.com/feed/1491828942693.zip");
/// assert_eq!(item.key, "1491828942693.zip");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique, sortable archive name (e.g., "1491828942693.zip")
    pub key: String,

    /// Absolute address the archive is fetched from
    pub locator: String,
}

impl WorkItem {
    pub fn new(key: impl Into<String>, locator: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            locator: locator.into(),
        }
    }
}

/// Documents extracted from one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResult {
    /// Key of the work item this result was produced from
    pub key: String,

    /// One entry per non-directory archive member, in archive order
    pub records: Vec<String>,
}

impl FetchResult {
    pub fn new(key: impl Into<String>, records: Vec<String>) -> Self {
        Self {
            key: key.into(),
            records,
        }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

/// Durable marker of the last fully committed archive.
///
/// `revision` is bumped by the store on every successful commit and is the
/// guard for the next conditional commit: a commit only applies if the
/// stored revision still matches the one it was read at.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// Key of the last committed archive; `None` means "from the beginning"
    pub key: Option<String>,

    /// Store revision the watermark was read at
    pub revision: i64,
}

impl Watermark {
    /// Watermark of a store that has never committed anything.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn at(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: Some(key.into()),
            revision,
        }
    }

    /// Returns true if `key` sorts strictly after the watermark.
    ///
    /// An empty watermark admits every key.
    pub fn is_newer(&self, key: &str) -> bool {
        match self.key.as_deref() {
            None | Some("") => true,
            Some(latest) => key > latest,
        }
    }

    /// The watermark after `key` has been committed on top of this one.
    pub fn advance(&self, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            revision: self.revision + 1,
        }
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}@{}", key, self.revision),
            None => write!(f, "<empty>@{}", self.revision),
        }
    }
}
