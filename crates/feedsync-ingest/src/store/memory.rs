//! In-process store
//!
//! Used for dry runs from the CLI and as the store in tests. State lives for
//! the lifetime of the value only.

use async_trait::async_trait;
use feedsync_common::types::{FetchResult, Watermark};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::ArchiveStore;
use crate::config::StoreConfig;
use crate::error::{CommitError, ConflictError, StoreError};

#[derive(Debug, Default)]
struct Inner {
    watermark: Watermark,
    /// Archive keys in commit order
    commits: Vec<String>,
    documents: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    config: StoreConfig,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::default(),
        }
    }

    /// A store that already committed up to `key`
    pub fn with_watermark(config: StoreConfig, key: impl Into<String>) -> Self {
        let store = Self::new(config);
        store.lock().watermark = Watermark::empty().advance(key);
        store
    }

    /// Moves the watermark the way another writer would, bumping its revision.
    pub fn overwrite_watermark(&self, key: impl Into<String>) {
        let mut inner = self.lock();
        inner.watermark = inner.watermark.advance(key);
    }

    pub fn watermark(&self) -> Watermark {
        self.lock().watermark.clone()
    }

    /// Document bodies in commit order
    pub fn documents(&self) -> Vec<String> {
        self.lock().documents.clone()
    }

    /// Archive keys committed through this store, oldest first
    pub fn committed_keys(&self) -> Vec<String> {
        self.lock().commits.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn load_watermark(&self) -> Result<Watermark, StoreError> {
        Ok(self.watermark())
    }

    async fn commit(
        &self,
        expected: &Watermark,
        result: &FetchResult,
    ) -> Result<Watermark, CommitError> {
        let mut inner = self.lock();
        if inner.watermark.revision != expected.revision {
            return Err(ConflictError {
                watermark_key: self.config.watermark_key.clone(),
                expected_revision: expected.revision,
                found_revision: Some(inner.watermark.revision).filter(|r| *r > 0),
            }
            .into());
        }

        inner.documents.extend(result.records.iter().cloned());
        inner.commits.push(result.key.clone());
        inner.watermark = inner.watermark.advance(result.key.clone());
        Ok(inner.watermark.clone())
    }

    async fn document_count(&self) -> Result<u64, StoreError> {
        Ok(self.lock().documents.len() as u64)
    }
}
