//! Shared helpers for feedsync-ingest integration tests
//!
//! - `ScriptedFetcher`: an in-process fetcher with per-key delays and failures
//! - `zip_archive`: builds archive payloads for mocked HTTP responses
//! - `init_test_tracing`: test-writer subscriber, honours `RUST_LOG`

#![allow(dead_code)]

use async_trait::async_trait;
use feedsync_common::types::{FetchResult, WorkItem};
use feedsync_ingest::config::RetryPolicy;
use feedsync_ingest::error::FetchFailure;
use feedsync_ingest::fetcher::{ArchiveFetcher, ItemFetcher};
use std::collections::{HashMap, HashSet};
use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use zip::write::SimpleFileOptions;

pub fn init_test_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,feedsync_ingest=debug,sqlx=warn,testcontainers=info")
        }))
        .with_test_writer()
        .try_init();
}

/// Zip payload with one entry per `(name, body)` pair
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();
    for (name, body) in entries {
        writer.start_file(*name, options).expect("start zip entry");
        writer.write_all(body.as_bytes()).expect("write zip entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

/// The document `ScriptedFetcher` and `zip_for` produce for `key`
pub fn doc_for(key: &str) -> String {
    format!("<doc>{}</doc>", key)
}

/// Single-document archive for `key`
pub fn zip_for(key: &str) -> Vec<u8> {
    let doc = doc_for(key);
    zip_archive(&[("doc.xml", doc.as_str())])
}

pub fn work_items(keys: &[&str]) -> Vec<WorkItem> {
    keys.iter()
        .map(|key| WorkItem::new(*key, format!("memory://{}", key)))
        .collect()
}

/// Fetcher driven by a script instead of the network
#[derive(Default)]
pub struct ScriptedFetcher {
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    started: AtomicUsize,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every attempt at `key` takes `delay`
    pub fn delay(mut self, key: &str, delay: Duration) -> Self {
        self.delays.insert(key.to_string(), delay);
        self
    }

    /// Every attempt at `key` fails
    pub fn failing(mut self, key: &str) -> Self {
        self.failing.insert(key.to_string());
        self
    }

    /// Number of distinct items a fetch was started for
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts
            .lock()
            .expect("attempts lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn into_item_fetcher(self: Arc<Self>) -> Arc<ItemFetcher> {
        Arc::new(ItemFetcher::new(self, RetryPolicy::default()))
    }
}

#[async_trait]
impl ArchiveFetcher for ScriptedFetcher {
    async fn fetch_once(&self, item: &WorkItem) -> Result<FetchResult, FetchFailure> {
        let first_attempt = {
            let mut attempts = self.attempts.lock().expect("attempts lock");
            let count = attempts.entry(item.key.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first_attempt {
            self.started.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(delay) = self.delays.get(&item.key) {
            tokio::time::sleep(*delay).await;
        }

        if self.failing.contains(&item.key) {
            return Err(FetchFailure::Status(500));
        }

        Ok(FetchResult::new(item.key.clone(), vec![doc_for(&item.key)]))
    }
}
