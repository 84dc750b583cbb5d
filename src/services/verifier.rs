//! Source verification and confidence scoring
//!
//! Compares a catalog entry's stored technical attributes against freshly
//! probed source metadata and records the agreement as a confidence score
//! in [0, 1]. The penalty weights are product-tuned constants; the
//! tolerance and acceptance threshold come from [`Settings`].

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{
    CatalogStore, Database, TechnicalAttributes, VerificationRecord, VerificationStatus,
    VerificationStore,
};
use crate::fetch::FetchDelegate;

/// Weight of the duration disagreement, scaled by the tolerance.
const DURATION_WEIGHT: f64 = 0.5;
/// Flat penalty when both sides report a resolution and they differ.
const RESOLUTION_PENALTY: f64 = 0.2;
/// Flat penalty when the frame rates differ by more than one fps.
const FRAME_RATE_PENALTY: f64 = 0.1;

/// Comparison deltas recorded alongside the confidence.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ComparisonDeltas {
    pub duration_delta_secs: Option<f64>,
    pub resolution_match: Option<bool>,
    pub frame_rate_delta: Option<f64>,
}

/// Score agreement between local and fetched attributes.
///
/// Starts at 1.0; subtracts a duration penalty proportional to the delta
/// relative to the tolerance (capped at the full weight), a flat penalty
/// for differing resolutions, and a flat penalty for a frame-rate delta
/// above 1 fps. The result is clamped to [0, 1]. Attributes missing on
/// either side contribute no penalty.
pub fn score_confidence(
    local: &TechnicalAttributes,
    fetched: &TechnicalAttributes,
    duration_tolerance_secs: f64,
) -> (f64, ComparisonDeltas) {
    let mut confidence = 1.0;
    let mut deltas = ComparisonDeltas::default();

    if let (Some(local_dur), Some(fetched_dur)) = (local.duration_secs, fetched.duration_secs) {
        let delta = (local_dur - fetched_dur).abs();
        deltas.duration_delta_secs = Some(delta);
        let tolerance = duration_tolerance_secs.max(1.0);
        confidence -= (delta / tolerance).min(1.0) * DURATION_WEIGHT;
    }

    if let (Some(local_res), Some(fetched_res)) = (&local.resolution, &fetched.resolution) {
        let matches = local_res.eq_ignore_ascii_case(fetched_res);
        deltas.resolution_match = Some(matches);
        if !matches {
            confidence -= RESOLUTION_PENALTY;
        }
    }

    if let (Some(local_fps), Some(fetched_fps)) = (local.frame_rate, fetched.frame_rate) {
        let delta = (local_fps - fetched_fps).abs();
        deltas.frame_rate_delta = Some(delta);
        if delta > 1.0 {
            confidence -= FRAME_RATE_PENALTY;
        }
    }

    (confidence.clamp(0.0, 1.0), deltas)
}

/// Drives (re-)verification of catalog entries against their source.
pub struct VerificationService {
    db: Database,
    fetch: Arc<dyn FetchDelegate>,
}

impl VerificationService {
    pub fn new(db: Database, fetch: Arc<dyn FetchDelegate>) -> Self {
        Self { db, fetch }
    }

    /// Verify one catalog entry. A record flagged `manual_override` is
    /// returned untouched; automated verification never overwrites it.
    pub async fn verify_entry(
        &self,
        catalog_entry_id: Uuid,
        settings: &Settings,
    ) -> Result<VerificationRecord> {
        let entry = self
            .db
            .catalog()
            .get(catalog_entry_id)
            .await?
            .context("catalog entry not found")?;

        if let Some(existing) = self.db.verifications().get_for_entry(entry.id).await? {
            if existing.manual_override {
                info!(
                    entry_id = %entry.id,
                    status = %existing.status,
                    "verification is manually overridden, skipping"
                );
                return Ok(existing);
            }
        }

        let record = if entry.source_id.trim().is_empty() {
            self.outcome(entry.id, VerificationStatus::SourceMissing, 0.0, ComparisonDeltas::default(), None)
        } else {
            match self.fetch.probe(&entry.source_id).await {
                Ok(Some(metadata)) => {
                    let (confidence, deltas) = score_confidence(
                        &entry.attributes,
                        &metadata.attributes,
                        settings.duration_tolerance_secs,
                    );
                    let status = if confidence >= settings.confidence_threshold {
                        VerificationStatus::Verified
                    } else {
                        VerificationStatus::Mismatch
                    };
                    self.outcome(entry.id, status, confidence, deltas, None)
                }
                Ok(None) => {
                    self.outcome(entry.id, VerificationStatus::SourceMissing, 0.0, ComparisonDeltas::default(), None)
                }
                Err(e) => {
                    warn!(entry_id = %entry.id, error = %e, "source probe failed");
                    self.outcome(
                        entry.id,
                        VerificationStatus::Failed,
                        0.0,
                        ComparisonDeltas::default(),
                        Some(e.to_string()),
                    )
                }
            }
        };

        self.db.verifications().upsert(record.clone()).await?;

        info!(
            entry_id = %entry.id,
            status = %record.status,
            confidence = record.confidence,
            "verification recorded"
        );

        Ok(record)
    }

    /// Manually set status/confidence/notes for an entry. The record is
    /// flagged so automated re-verification will not silently overwrite it.
    pub async fn override_verification(
        &self,
        catalog_entry_id: Uuid,
        status: VerificationStatus,
        confidence: f64,
        notes: Option<String>,
    ) -> Result<VerificationRecord> {
        let existing = self.db.verifications().get_for_entry(catalog_entry_id).await?;

        let record = VerificationRecord {
            id: existing.as_ref().map(|r| r.id).unwrap_or_else(Uuid::new_v4),
            catalog_entry_id,
            status,
            confidence: confidence.clamp(0.0, 1.0),
            duration_delta_secs: existing.as_ref().and_then(|r| r.duration_delta_secs),
            resolution_match: existing.as_ref().and_then(|r| r.resolution_match),
            frame_rate_delta: existing.as_ref().and_then(|r| r.frame_rate_delta),
            manual_override: true,
            notes,
            checked_at: Utc::now(),
        };

        self.db.verifications().upsert(record.clone()).await?;

        info!(
            entry_id = %catalog_entry_id,
            status = %record.status,
            "manual verification override recorded"
        );

        Ok(record)
    }

    fn outcome(
        &self,
        catalog_entry_id: Uuid,
        status: VerificationStatus,
        confidence: f64,
        deltas: ComparisonDeltas,
        notes: Option<String>,
    ) -> VerificationRecord {
        VerificationRecord {
            id: Uuid::new_v4(),
            catalog_entry_id,
            status,
            confidence,
            duration_delta_secs: deltas.duration_delta_secs,
            resolution_match: deltas.resolution_match,
            frame_rate_delta: deltas.frame_rate_delta,
            manual_override: false,
            notes,
            checked_at: Utc::now(),
        }
    }
}
