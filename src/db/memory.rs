//! In-memory store implementation
//!
//! Backs all three persistence seams with `HashMap`s behind `parking_lot`
//! locks. Used by the test suites and by embedders that have not wired a
//! real storage engine yet.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    CatalogEntryRecord, CatalogStore, CreateCatalogEntry, QueueItemRecord, QueueItemStore,
    QueueStatus, VerificationRecord, VerificationStore,
};
use crate::fetch::SourceMetadata;

#[derive(Default)]
pub struct MemoryStore {
    queue_items: RwLock<HashMap<Uuid, QueueItemRecord>>,
    // Insertion order, so list results are stable for callers and tests.
    queue_order: RwLock<Vec<Uuid>>,
    catalog: RwLock<HashMap<Uuid, CatalogEntryRecord>>,
    verifications: RwLock<HashMap<Uuid, VerificationRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_item<F>(&self, id: Uuid, f: F) -> Result<()>
    where
        F: FnOnce(&mut QueueItemRecord),
    {
        let mut items = self.queue_items.write();
        match items.get_mut(&id) {
            Some(item) => {
                f(item);
                Ok(())
            }
            None => bail!("queue item {} not found", id),
        }
    }
}

#[async_trait]
impl QueueItemStore for MemoryStore {
    async fn create(&self, source_id: &str) -> Result<QueueItemRecord> {
        let record = QueueItemRecord {
            id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            status: QueueStatus::Queued,
            retry_count: 0,
            progress_percent: 0.0,
            speed_bytes_sec: None,
            eta_seconds: None,
            error_message: None,
            catalog_entry_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        self.queue_items.write().insert(record.id, record.clone());
        self.queue_order.write().push(record.id);
        Ok(record)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItemRecord>> {
        Ok(self.queue_items.read().get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<QueueItemRecord>> {
        let items = self.queue_items.read();
        Ok(self
            .queue_order
            .read()
            .iter()
            .filter_map(|id| items.get(id).cloned())
            .collect())
    }

    async fn list_by_status(&self, status: QueueStatus) -> Result<Vec<QueueItemRecord>> {
        let items = self.queue_items.read();
        Ok(self
            .queue_order
            .read()
            .iter()
            .filter_map(|id| items.get(id))
            .filter(|item| item.status == status)
            .cloned()
            .collect())
    }

    async fn mark_started(&self, id: Uuid) -> Result<bool> {
        let mut items = self.queue_items.write();
        match items.get_mut(&id) {
            Some(item) if item.status == QueueStatus::Queued => {
                item.status = QueueStatus::Downloading;
                item.started_at = Some(Utc::now());
                item.progress_percent = 0.0;
                item.speed_bytes_sec = None;
                item.eta_seconds = None;
                item.error_message = None;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => bail!("queue item {} not found", id),
        }
    }

    async fn mark_completed(&self, id: Uuid, catalog_entry_id: Uuid) -> Result<()> {
        self.with_item(id, |item| {
            item.status = QueueStatus::Completed;
            item.completed_at = Some(Utc::now());
            item.catalog_entry_id = Some(catalog_entry_id);
            item.progress_percent = 100.0;
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        self.with_item(id, |item| {
            item.status = QueueStatus::Failed;
            item.completed_at = Some(Utc::now());
            item.error_message = Some(error.to_string());
        })
    }

    async fn mark_cancelled(&self, id: Uuid) -> Result<()> {
        self.with_item(id, |item| {
            item.status = QueueStatus::Cancelled;
            item.completed_at = Some(Utc::now());
        })
    }

    async fn requeue(&self, id: Uuid, retry_count: u32) -> Result<()> {
        self.with_item(id, |item| {
            item.status = QueueStatus::Queued;
            item.retry_count = retry_count;
            item.completed_at = None;
        })
    }

    async fn update_progress(
        &self,
        id: Uuid,
        percent: f64,
        speed_bytes_sec: Option<i64>,
        eta_seconds: Option<i64>,
    ) -> Result<()> {
        self.with_item(id, |item| {
            item.progress_percent = percent;
            item.speed_bytes_sec = speed_bytes_sec;
            item.eta_seconds = eta_seconds;
        })
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<CatalogEntryRecord>> {
        Ok(self.catalog.read().get(&id).cloned())
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<CatalogEntryRecord>> {
        Ok(self
            .catalog
            .read()
            .values()
            .find(|entry| entry.source_id == source_id)
            .cloned())
    }

    async fn create(&self, entry: CreateCatalogEntry) -> Result<CatalogEntryRecord> {
        let mut catalog = self.catalog.write();
        // Dedupe key: at most one entry per external-source id.
        if catalog.values().any(|e| e.source_id == entry.source_id) {
            bail!("catalog entry with source id {} already exists", entry.source_id);
        }
        let now = Utc::now();
        let record = CatalogEntryRecord {
            id: Uuid::new_v4(),
            title: entry.title,
            artist: entry.artist,
            year: entry.year,
            source_id: entry.source_id,
            file_path: entry.file_path,
            attributes: entry.attributes,
            created_at: now,
            updated_at: now,
        };
        catalog.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_from_source(&self, id: Uuid, metadata: &SourceMetadata) -> Result<()> {
        let mut catalog = self.catalog.write();
        match catalog.get_mut(&id) {
            Some(entry) => {
                if let Some(title) = &metadata.title {
                    entry.title = title.clone();
                }
                if let Some(artist) = &metadata.artist {
                    entry.artist = artist.clone();
                }
                if metadata.year.is_some() {
                    entry.year = metadata.year;
                }
                entry.attributes = metadata.attributes.clone();
                entry.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("catalog entry {} not found", id),
        }
    }

    async fn set_file_path(&self, id: Uuid, path: &str) -> Result<()> {
        let mut catalog = self.catalog.write();
        match catalog.get_mut(&id) {
            Some(entry) => {
                entry.file_path = Some(path.to_string());
                entry.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("catalog entry {} not found", id),
        }
    }
}

#[async_trait]
impl VerificationStore for MemoryStore {
    async fn get_for_entry(&self, catalog_entry_id: Uuid) -> Result<Option<VerificationRecord>> {
        Ok(self.verifications.read().get(&catalog_entry_id).cloned())
    }

    async fn upsert(&self, record: VerificationRecord) -> Result<()> {
        self.verifications
            .write()
            .insert(record.catalog_entry_id, record);
        Ok(())
    }
}
