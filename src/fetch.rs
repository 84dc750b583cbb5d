//! Fetch delegate seam
//!
//! The actual network download is an external collaborator. The pipeline
//! hands it a source locator, a destination directory, a progress sink, and
//! a cancellation token, and gets back a [`FetchOutcome`]. Expected
//! failures (unreachable source, unavailable media) come back as
//! `success = false`; an `Err` from the delegate is treated the same as a
//! failed outcome at the item boundary.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::db::TechnicalAttributes;

/// One flat progress value. Percent is clamped by the reporter; speed and
/// eta are passed through for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: f64,
    pub speed_bytes_sec: Option<i64>,
    pub eta_seconds: Option<i64>,
}

/// Metadata reported by the source for a fetched or probed item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// External-source id; the catalog dedupe key.
    pub source_id: String,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub year: Option<i32>,
    pub attributes: TechnicalAttributes,
}

/// Result of one fetch attempt.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub success: bool,
    /// Where the delegate wrote the file, on success.
    pub file_path: Option<PathBuf>,
    pub metadata: Option<SourceMetadata>,
    pub error: Option<String>,
    /// Whether a failure might succeed on a later attempt. Permanent
    /// failures consume the same retry budget; the flag only shapes the
    /// recorded error.
    pub transient: bool,
}

impl FetchOutcome {
    /// A failure that may resolve on retry (unreachable source, timeout).
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            transient: true,
            ..Default::default()
        }
    }

    /// A failure that will not resolve on its own (media unavailable).
    pub fn permanent_failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            transient: false,
            ..Default::default()
        }
    }
}

/// Sink invoked by the delegate as the transfer progresses. Must be cheap
/// and non-blocking; throttling happens on the pipeline side.
pub type ProgressSink = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// External collaborator performing the actual download.
#[async_trait]
pub trait FetchDelegate: Send + Sync + 'static {
    /// Download `source_id` into `destination_dir`, reporting progress via
    /// `on_progress`. Must stop promptly when `cancel` fires.
    async fn fetch(
        &self,
        source_id: &str,
        destination_dir: &Path,
        on_progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome>;

    /// Fetch current metadata only, for source verification. `Ok(None)`
    /// means the source locator no longer resolves.
    async fn probe(&self, source_id: &str) -> Result<Option<SourceMetadata>>;
}
