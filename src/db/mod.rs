//! Records and persistence seams for the download pipeline
//!
//! Storage mechanics are out of scope for this crate: the pipeline consumes
//! persistence through the [`QueueItemStore`], [`CatalogStore`], and
//! [`VerificationStore`] traits, aggregated behind a cloneable [`Database`]
//! handle with per-store accessors. [`MemoryStore`] ships as an in-process
//! implementation for tests and embedders.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryStore;

use crate::fetch::SourceMetadata;

/// Lifecycle status of a queue item.
///
/// Legal transitions: Queued → Downloading → {Completed, Failed};
/// Failed → Queued only while the retry budget lasts. Everything else is
/// terminal for the attempt cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Queued,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the item can still make progress in this attempt cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download request in the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItemRecord {
    pub id: Uuid,
    /// External source locator handed to the fetch delegate.
    pub source_id: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    /// Clamped to [0, 100], non-decreasing within one attempt.
    pub progress_percent: f64,
    pub speed_bytes_sec: Option<i64>,
    pub eta_seconds: Option<i64>,
    pub error_message: Option<String>,
    /// Catalog entry the download resolved to, once matched.
    pub catalog_entry_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Technical attributes of a media file, both as stored in the catalog and
/// as reported by the fetch delegate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TechnicalAttributes {
    pub duration_secs: Option<f64>,
    pub resolution: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub bitrate: Option<i64>,
    pub frame_rate: Option<f64>,
}

/// Persisted record for one managed media asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntryRecord {
    pub id: Uuid,
    pub title: String,
    pub artist: String,
    pub year: Option<i32>,
    /// External-source id; unique across the catalog (dedupe key).
    pub source_id: String,
    pub file_path: Option<String>,
    pub attributes: TechnicalAttributes,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields for creating a new catalog entry.
#[derive(Debug, Clone)]
pub struct CreateCatalogEntry {
    pub title: String,
    pub artist: String,
    pub year: Option<i32>,
    pub source_id: String,
    pub file_path: Option<String>,
    pub attributes: TechnicalAttributes,
}

/// Outcome of comparing a catalog entry against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Confidence met the configured threshold.
    Verified,
    /// Compared fine but confidence fell below the threshold.
    Mismatch,
    /// The source locator no longer resolves.
    SourceMissing,
    /// The fetch/compare step itself failed.
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Mismatch => "mismatch",
            Self::SourceMissing => "source_missing",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entry snapshot of the latest source verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub catalog_entry_id: Uuid,
    pub status: VerificationStatus,
    /// Agreement between local and fetched attributes, in [0, 1].
    pub confidence: f64,
    pub duration_delta_secs: Option<f64>,
    pub resolution_match: Option<bool>,
    pub frame_rate_delta: Option<f64>,
    /// Set by a manual override; automated re-verification will not
    /// overwrite a record carrying this flag.
    pub manual_override: bool,
    pub notes: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Queue item persistence consumed by the orchestrator.
///
/// Implementations must support listing by status: `Queued` items are
/// re-enqueued at startup for crash recovery.
#[async_trait]
pub trait QueueItemStore: Send + Sync {
    async fn create(&self, source_id: &str) -> Result<QueueItemRecord>;
    async fn get(&self, id: Uuid) -> Result<Option<QueueItemRecord>>;
    async fn list(&self) -> Result<Vec<QueueItemRecord>>;
    async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItemRecord>>;

    /// Atomically claim the item for an attempt: transition Queued →
    /// Downloading, setting `started_at` and resetting progress and the
    /// error message. Returns `false` without changes when the item is
    /// not Queued (already claimed by another worker, cancelled, or
    /// terminal), so duplicate queue deliveries dispatch at most once.
    async fn mark_started(&self, id: Uuid) -> Result<bool>;

    /// Transition to Completed; sets `completed_at` and the resolved entry.
    async fn mark_completed(&self, id: Uuid, catalog_entry_id: Uuid) -> Result<()>;

    /// Transition to Failed, retaining the error message.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Transition to Cancelled (user cancel of a not-yet-started item).
    async fn mark_cancelled(&self, id: Uuid) -> Result<()>;

    /// Transition back to Queued for another attempt with the given retry
    /// count.
    async fn requeue(&self, id: Uuid, retry_count: u32) -> Result<()>;

    async fn update_progress(
        &self,
        id: Uuid,
        percent: f64,
        speed_bytes_sec: Option<i64>,
        eta_seconds: Option<i64>,
    ) -> Result<()>;
}

/// Catalog persistence consumed by the match/persist step.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<CatalogEntryRecord>>;

    /// Dedupe lookup by external-source id.
    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<CatalogEntryRecord>>;

    async fn create(&self, entry: CreateCatalogEntry) -> Result<CatalogEntryRecord>;

    /// Refresh title/artist/year/attributes from freshly fetched metadata.
    async fn update_from_source(&self, id: Uuid, metadata: &SourceMetadata) -> Result<()>;

    async fn set_file_path(&self, id: Uuid, path: &str) -> Result<()>;
}

/// Verification record persistence.
#[async_trait]
pub trait VerificationStore: Send + Sync {
    async fn get_for_entry(&self, catalog_entry_id: Uuid) -> Result<Option<VerificationRecord>>;

    /// Insert or replace the record for the entry the record points at.
    async fn upsert(&self, record: VerificationRecord) -> Result<()>;
}

/// Aggregated persistence handle passed to the pipeline services.
#[derive(Clone)]
pub struct Database {
    queue_items: Arc<dyn QueueItemStore>,
    catalog: Arc<dyn CatalogStore>,
    verifications: Arc<dyn VerificationStore>,
}

impl Database {
    pub fn new(
        queue_items: Arc<dyn QueueItemStore>,
        catalog: Arc<dyn CatalogStore>,
        verifications: Arc<dyn VerificationStore>,
    ) -> Self {
        Self {
            queue_items,
            catalog,
            verifications,
        }
    }

    /// All three stores backed by one in-memory [`MemoryStore`].
    pub fn in_memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::new(store.clone(), store.clone(), store)
    }

    /// Get the queue item store.
    pub fn queue_items(&self) -> &dyn QueueItemStore {
        self.queue_items.as_ref()
    }

    /// Get the catalog store.
    pub fn catalog(&self) -> &dyn CatalogStore {
        self.catalog.as_ref()
    }

    /// Get the verification store.
    pub fn verifications(&self) -> &dyn VerificationStore {
        self.verifications.as_ref()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
