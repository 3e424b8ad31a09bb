//! feedsync ingest library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Fetches new archives from a listing page and commits their documents to a
//! durable store in ascending key order, at most once each.
//!
//! # Pipeline
//!
//! - **Listing**: discover archives newer than the stored watermark
//! - **Fetch**: download and decode archives on a bounded worker pool, with retry
//! - **Dispatch**: resequence fetch outcomes so they arrive in key order
//! - **Commit**: append documents and advance the watermark, guarded against
//!   concurrent writers
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use feedsync_ingest::config::{ListingConfig, PipelineConfig, StoreConfig};
//! use feedsync_ingest::store::MemoryStore;
//! use feedsync_ingest::{Pipeline, RunOutcome};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(MemoryStore::new(StoreConfig::default()));
//!     let pipeline = Pipeline::http(
//!         &ListingConfig::new("http://localhost:8080/feed"),
//!         PipelineConfig::with_concurrency(4),
//!         store,
//!     )?;
//!
//!     if let RunOutcome::Completed(report) = pipeline.run(&CancellationToken::new()).await? {
//!         println!("committed {} archives", report.committed);
//!     }
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod commit;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fetcher;
pub mod listing;
pub mod pipeline;
pub mod progress;
pub mod store;

pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, RunOutcome, RunReport};
