//! Durable storage for committed archives
//!
//! A store holds two things under the configured keys: the list of committed
//! documents and the watermark naming the last committed archive. Commits are
//! conditional on the watermark revision read beforehand, so a concurrent
//! writer makes the commit fail instead of being silently overwritten.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use feedsync_common::types::{FetchResult, Watermark};

use crate::error::{CommitError, StoreError};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Current watermark, or [`Watermark::empty`] if nothing was committed yet
    async fn load_watermark(&self) -> Result<Watermark, StoreError>;

    /// Appends the records of `result` and moves the watermark to its key.
    ///
    /// Both changes apply together, and only if the stored revision still
    /// equals `expected.revision`. Returns the new watermark.
    async fn commit(&self, expected: &Watermark, result: &FetchResult)
        -> Result<Watermark, CommitError>;

    /// Number of documents in the list
    async fn document_count(&self) -> Result<u64, StoreError>;
}
