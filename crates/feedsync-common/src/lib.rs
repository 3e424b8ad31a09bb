//! feedsync common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and logging setup for the feedsync workspace members.
//!
//! - **Types**: work items, fetch results and the commit watermark
//! - **Logging**: `tracing` subscriber configuration
//!
//! # Example
//!
//! ```no_run
//! use feedsync_common::logging::{init_logging, LogConfig};
//! use feedsync_common::types::{Watermark, WorkItem};
//!
//! fn main() -> anyhow::Result<()> {
//!     let _guard = init_logging(&LogConfig::from_env()?)?;
//!
//!     let watermark = Watermark::at("1491828942693.zip", 1);
//!     let item = WorkItem::new("1491828942694.zip", "https://example.com/1491828942694.zip");
//!     assert!(watermark.is_newer(&item.key));
//!     Ok(())
//! }
//! ```

pub mod logging;
pub mod types;

// Re-export commonly used types
pub use types::{FetchResult, Ordinal, Watermark, WorkItem};
