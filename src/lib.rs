//! Download orchestration and matching pipeline for a media library.
//!
//! The crate accepts download requests for external source ids, runs them
//! through a bounded worker pool with retries and throttled progress
//! persistence, matches the results against the catalog, and organizes the
//! fetched files into a naming-pattern-driven library tree. The actual
//! network transfer is delegated to an embedder-provided
//! [`FetchDelegate`]; persistence goes through the store traits in [`db`].
//!
//! Typical wiring:
//!
//! ```no_run
//! use std::sync::Arc;
//! # use vidarium::fetch::FetchDelegate;
//! use vidarium::{Database, DownloadService, Settings};
//!
//! # async fn wire(delegate: Arc<dyn FetchDelegate>) -> anyhow::Result<()> {
//! let db = Database::in_memory();
//! let service = Arc::new(DownloadService::new(db, delegate, Settings::default()));
//! service.start().await?;
//! let item = service.enqueue("dQw4w9WgXcQ").await?;
//! # let _ = item;
//! service.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod services;

pub use config::Settings;
pub use db::{Database, MemoryStore, QueueStatus};
pub use error::DownloadError;
pub use fetch::{FetchDelegate, FetchOutcome, ProgressUpdate, SourceMetadata};
pub use services::{DownloadEvent, DownloadService, VerificationService};
