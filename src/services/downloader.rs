//! Download orchestrator
//!
//! Owns the pipeline end to end: a single consumer loop drains the task
//! queue, a semaphore bounds how many items are in flight, and each item
//! runs fetch → match/persist → organize in its own task. Failures are
//! caught at the item boundary so one bad download never takes the loop
//! down.
//!
//! Lifecycle is explicit: [`DownloadService::start`] seeds crash recovery
//! and spawns the loop, [`DownloadService::stop`] closes the queue, waits
//! a grace period for in-flight items, then force-cancels stragglers.
//! Items that never started stay Queued and are re-enqueued on the next
//! start.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{
    CatalogEntryRecord, CatalogStore, CreateCatalogEntry, Database, QueueItemRecord,
    QueueItemStore, QueueStatus,
};
use crate::error::DownloadError;
use crate::fetch::{FetchDelegate, SourceMetadata};
use crate::services::organizer::OrganizerService;
use crate::services::progress::{run_progress_writer, ProgressReporter, WRITE_QUEUE_CAPACITY};
use crate::services::queue::{task_queue, TaskQueue, TaskReceiver};
use crate::services::retry::{RetryDecision, RetryPolicy};

/// How long [`DownloadService::stop`] waits for in-flight items before
/// force-cancelling them.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Broadcast notifications for queue item lifecycle transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DownloadEvent {
    Queued {
        id: Uuid,
    },
    Started {
        id: Uuid,
    },
    Progress {
        id: Uuid,
        update: crate::fetch::ProgressUpdate,
    },
    Completed {
        id: Uuid,
        catalog_entry_id: Uuid,
    },
    Failed {
        id: Uuid,
        error: String,
        will_retry: bool,
    },
    Cancelled {
        id: Uuid,
    },
}

/// The download pipeline. Construct once, wrap in an [`Arc`], `start` it.
pub struct DownloadService {
    db: Database,
    fetch: Arc<dyn FetchDelegate>,
    organizer: OrganizerService,
    settings: RwLock<Settings>,
    queue: TaskQueue,
    // Taken by the consumer loop on start.
    receiver: Mutex<Option<TaskReceiver>>,
    shutdown: CancellationToken,
    events: broadcast::Sender<DownloadEvent>,
    // Per-item cancellation for downloads currently in flight.
    active: Mutex<HashMap<Uuid, CancellationToken>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl DownloadService {
    pub fn new(db: Database, fetch: Arc<dyn FetchDelegate>, settings: Settings) -> Self {
        let (queue, receiver) = task_queue();
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            fetch,
            organizer: OrganizerService::new(),
            settings: RwLock::new(settings),
            queue,
            receiver: Mutex::new(Some(receiver)),
            shutdown: CancellationToken::new(),
            events,
            active: Mutex::new(HashMap::new()),
            loop_handle: Mutex::new(None),
        }
    }

    /// Subscribe to lifecycle events. Slow subscribers lag, they do not
    /// block the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events.subscribe()
    }

    /// Replace the settings snapshot. Per-item parameters (retries,
    /// backoff, progress step, naming pattern, paths) apply from the next
    /// item onward; the concurrency bound applies on the next start.
    pub fn reload_settings(&self, settings: Settings) {
        info!(
            max_concurrency = settings.max_concurrency,
            max_retries = settings.max_retries,
            "settings reloaded"
        );
        *self.settings.write() = settings;
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// Create a queue item for `source_id` and hand it to the consumer
    /// loop. Works before `start`; the loop picks the item up once it
    /// runs.
    pub async fn enqueue(&self, source_id: &str) -> Result<QueueItemRecord> {
        if self.queue.is_closed() {
            bail!("download pipeline is stopped");
        }
        let item = self
            .db
            .queue_items()
            .create(source_id)
            .await
            .context("creating queue item")?;
        self.queue
            .enqueue(item.id)
            .context("handing item to the consumer loop")?;
        info!(item_id = %item.id, source_id = %source_id, "download queued");
        let _ = self.events.send(DownloadEvent::Queued { id: item.id });
        Ok(item)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueItemRecord>> {
        self.db.queue_items().get(id).await
    }

    pub async fn list(&self) -> Result<Vec<QueueItemRecord>> {
        self.db.queue_items().list().await
    }

    /// Cancel an item. A Queued item becomes Cancelled immediately; a
    /// Downloading item has its token fired and ends Failed once the
    /// delegate stops. Terminal items cannot be cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<()> {
        let item = self
            .db
            .queue_items()
            .get(id)
            .await?
            .with_context(|| format!("queue item {} not found", id))?;

        match item.status {
            QueueStatus::Queued => {
                self.db.queue_items().mark_cancelled(id).await?;
                info!(item_id = %id, "queued download cancelled");
                let _ = self.events.send(DownloadEvent::Cancelled { id });
                Ok(())
            }
            QueueStatus::Downloading => {
                match self.active.lock().get(&id) {
                    Some(token) => {
                        token.cancel();
                        info!(item_id = %id, "cancellation requested for in-flight download");
                        Ok(())
                    }
                    // Status said Downloading but the worker already
                    // finished; nothing left to cancel.
                    None => Ok(()),
                }
            }
            status => bail!("queue item {} is already {}", id, status),
        }
    }

    /// Put a permanently Failed or Cancelled item back in the queue with a
    /// fresh retry budget.
    pub async fn retry(&self, id: Uuid) -> Result<QueueItemRecord> {
        let item = self
            .db
            .queue_items()
            .get(id)
            .await?
            .with_context(|| format!("queue item {} not found", id))?;
        if !matches!(item.status, QueueStatus::Failed | QueueStatus::Cancelled) {
            bail!("queue item {} is {}, not retryable", id, item.status);
        }

        self.db.queue_items().requeue(id, 0).await?;
        self.queue
            .enqueue(id)
            .context("handing item to the consumer loop")?;
        info!(item_id = %id, "download manually requeued");
        let _ = self.events.send(DownloadEvent::Queued { id });
        self.db
            .queue_items()
            .get(id)
            .await?
            .with_context(|| format!("queue item {} disappeared after requeue", id))
    }

    /// Seed crash recovery and spawn the consumer loop. One start per
    /// service instance.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .context("download pipeline already started")?;

        // Items left Queued by a previous run go back into the queue in
        // creation order.
        let pending = self
            .db
            .queue_items()
            .list_by_status(QueueStatus::Queued)
            .await
            .context("listing pending queue items")?;
        for item in &pending {
            self.queue
                .enqueue(item.id)
                .context("re-enqueueing pending item")?;
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "recovered pending downloads");
        }

        let max_concurrency = self.settings.read().max_concurrency.max(1);
        let svc = Arc::clone(self);
        let handle = tokio::spawn(svc.run_consumer_loop(receiver, max_concurrency));
        *self.loop_handle.lock() = Some(handle);

        info!(max_concurrency = max_concurrency, "download pipeline started");
        Ok(())
    }

    /// Stop accepting work and wind the loop down. In-flight items get
    /// [`STOP_GRACE`] to finish before their tokens are fired; items still
    /// Queued are left untouched for the next start.
    pub async fn stop(&self) {
        self.queue.close();
        self.shutdown.cancel();

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "consumer loop panicked");
            }
        }
        info!("download pipeline stopped");
    }

    async fn run_consumer_loop(
        self: Arc<Self>,
        mut receiver: TaskReceiver,
        max_concurrency: usize,
    ) {
        let semaphore = Arc::new(Semaphore::new(max_concurrency));
        let mut workers = JoinSet::new();

        loop {
            // Reap finished workers opportunistically so the set does not
            // accumulate results.
            while workers.try_join_next().is_some() {}

            let id = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let svc = Arc::clone(&self);
            workers.spawn(async move {
                let _permit = permit;
                svc.process_item(id).await;
            });
        }

        // Grace period for in-flight items, then force-cancel.
        let drain = async {
            while workers.join_next().await.is_some() {}
        };
        if tokio::time::timeout(STOP_GRACE, drain).await.is_err() {
            warn!(
                grace_secs = STOP_GRACE.as_secs(),
                "in-flight downloads exceeded the stop grace period, force-cancelling"
            );
            for (id, token) in self.active.lock().drain() {
                debug!(item_id = %id, "force-cancelling download");
                token.cancel();
            }
            workers.shutdown().await;
        }
        debug!("consumer loop exited");
    }

    /// Run one item through the pipeline. Every failure is caught here;
    /// nothing propagates to the consumer loop.
    async fn process_item(self: &Arc<Self>, id: Uuid) {
        let settings = self.settings.read().clone();

        // Atomic claim. Duplicate deliveries of the same id (recovery
        // seeding plus a direct enqueue, cancelled-while-queued items)
        // lose the Queued → Downloading transition and are dropped here.
        match self.db.queue_items().mark_started(id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(item_id = %id, "item is no longer queued, skipping dispatch");
                return;
            }
            Err(e) => {
                error!(item_id = %id, error = %e, "failed to claim dequeued item");
                return;
            }
        }

        let item = match self.db.queue_items().get(id).await {
            Ok(Some(item)) => item,
            Ok(None) => {
                warn!(item_id = %id, "claimed item no longer exists");
                return;
            }
            Err(e) => {
                error!(item_id = %id, error = %e, "failed to load claimed item");
                return;
            }
        };

        let cancel = self.shutdown.child_token();
        self.active.lock().insert(id, cancel.clone());
        let outcome = self.run_attempt(&item, &settings, &cancel).await;
        self.active.lock().remove(&id);

        match outcome {
            Ok(catalog_entry_id) => {
                if let Err(e) = self.db.queue_items().mark_completed(id, catalog_entry_id).await {
                    error!(item_id = %id, error = %e, "failed to mark download completed");
                    return;
                }
                info!(item_id = %id, catalog_entry_id = %catalog_entry_id, "download completed");
                let _ = self.events.send(DownloadEvent::Completed {
                    id,
                    catalog_entry_id,
                });
                self.cleanup_staging(&settings, id).await;
            }
            Err(err) => {
                self.handle_failure(&item, err, &settings, &cancel).await;
                // A retry keeps the staging directory for the next
                // attempt; anything terminal releases it.
                if let Ok(Some(after)) = self.db.queue_items().get(id).await {
                    if after.status.is_terminal() {
                        self.cleanup_staging(&settings, id).await;
                    }
                }
            }
        }
    }

    /// Remove the item's staging directory. Best effort; an already
    /// missing directory is fine.
    async fn cleanup_staging(&self, settings: &Settings, id: Uuid) {
        let dir = settings.staging_path.join(id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(item_id = %id, error = %e, "failed to remove staging directory");
            }
        }
    }

    /// One fetch → match/persist → organize attempt.
    async fn run_attempt(
        &self,
        item: &QueueItemRecord,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> Result<Uuid, DownloadError> {
        info!(
            item_id = %item.id,
            source_id = %item.source_id,
            attempt = item.retry_count + 1,
            "download started"
        );
        let _ = self.events.send(DownloadEvent::Started { id: item.id });

        let staging_dir = settings.staging_path.join(item.id.to_string());
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .with_context(|| format!("creating staging directory {}", staging_dir.display()))
            .map_err(DownloadError::Organization)?;

        // Progress flows delegate → throttle → bounded queue → writer.
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let reporter = Arc::new(ProgressReporter::new(settings.progress_step_percent, tx));
        let writer = tokio::spawn(run_progress_writer(
            self.db.clone(),
            item.id,
            rx,
            self.events.clone(),
        ));

        let fetched = self
            .fetch
            .fetch(
                &item.source_id,
                &staging_dir,
                reporter.into_sink(),
                cancel.clone(),
            )
            .await;

        // The sink (and with it the queue sender) is dropped once the
        // delegate returns; wait for the writer to flush what it accepted.
        let _ = writer.await;

        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let outcome = match fetched {
            Ok(outcome) => outcome,
            // An Err from the delegate is unexpected but treated like a
            // failed outcome at this boundary.
            Err(e) => return Err(DownloadError::TransientFetch(e.to_string())),
        };
        if !outcome.success {
            let message = outcome
                .error
                .unwrap_or_else(|| "fetch delegate reported failure".to_string());
            return Err(if outcome.transient {
                DownloadError::TransientFetch(message)
            } else {
                DownloadError::PermanentFetch(message)
            });
        }
        let file_path = outcome.file_path.ok_or_else(|| {
            DownloadError::PermanentFetch("fetch delegate returned no file path".to_string())
        })?;
        let metadata = outcome.metadata.ok_or_else(|| {
            DownloadError::PermanentFetch("fetch delegate returned no metadata".to_string())
        })?;

        let entry = self
            .reconcile_catalog(item, &metadata)
            .await
            .map_err(DownloadError::Persistence)?;

        let destination = self
            .organizer
            .organize(&file_path, &settings.library_path, &settings.naming_pattern, &entry)
            .await
            .map_err(DownloadError::Organization)?;
        self.db
            .catalog()
            .set_file_path(entry.id, &destination.to_string_lossy())
            .await
            .map_err(DownloadError::Persistence)?;

        Ok(entry.id)
    }

    /// Find or create the catalog entry for fetched metadata. The
    /// external-source id is the dedupe key: a second download of the same
    /// source refreshes the existing entry instead of duplicating it.
    async fn reconcile_catalog(
        &self,
        item: &QueueItemRecord,
        metadata: &SourceMetadata,
    ) -> Result<CatalogEntryRecord> {
        let source_id = if metadata.source_id.is_empty() {
            item.source_id.clone()
        } else {
            metadata.source_id.clone()
        };

        if let Some(existing) = self.db.catalog().find_by_source_id(&source_id).await? {
            debug!(
                item_id = %item.id,
                catalog_entry_id = %existing.id,
                "matched existing catalog entry"
            );
            self.db
                .catalog()
                .update_from_source(existing.id, metadata)
                .await?;
            return self
                .db
                .catalog()
                .get(existing.id)
                .await?
                .with_context(|| format!("catalog entry {} disappeared", existing.id));
        }

        let entry = self
            .db
            .catalog()
            .create(CreateCatalogEntry {
                title: metadata
                    .title
                    .clone()
                    .unwrap_or_else(|| source_id.clone()),
                artist: metadata.artist.clone().unwrap_or_default(),
                year: metadata.year,
                source_id,
                file_path: None,
                attributes: metadata.attributes.clone(),
            })
            .await?;
        debug!(item_id = %item.id, catalog_entry_id = %entry.id, "created catalog entry");
        Ok(entry)
    }

    /// Record a failed attempt and decide whether it goes back in the
    /// queue.
    async fn handle_failure(
        &self,
        item: &QueueItemRecord,
        err: DownloadError,
        settings: &Settings,
        cancel: &CancellationToken,
    ) {
        let message = err.to_string();
        if let Err(e) = self.db.queue_items().mark_failed(item.id, &message).await {
            error!(item_id = %item.id, error = %e, "failed to record download failure");
            return;
        }

        if matches!(err, DownloadError::Cancelled) {
            info!(item_id = %item.id, "in-flight download cancelled");
            let _ = self.events.send(DownloadEvent::Cancelled { id: item.id });
            return;
        }

        if !err.is_retryable() {
            error!(item_id = %item.id, error = %message, "download failed terminally");
            let _ = self.events.send(DownloadEvent::Failed {
                id: item.id,
                error: message,
                will_retry: false,
            });
            return;
        }

        let policy = RetryPolicy::new(settings.max_retries, settings.retry_backoff());
        match policy.decide(item.retry_count) {
            RetryDecision::GiveUp => {
                error!(
                    item_id = %item.id,
                    retry_count = item.retry_count,
                    error = %message,
                    "retry budget exhausted, download failed permanently"
                );
                let _ = self.events.send(DownloadEvent::Failed {
                    id: item.id,
                    error: message,
                    will_retry: false,
                });
            }
            RetryDecision::Retry { next_retry_count } => {
                warn!(
                    item_id = %item.id,
                    attempt = next_retry_count,
                    max_retries = settings.max_retries,
                    error = %message,
                    "download failed, will retry"
                );
                let _ = self.events.send(DownloadEvent::Failed {
                    id: item.id,
                    error: message,
                    will_retry: true,
                });

                if !policy.wait(cancel).await {
                    debug!(item_id = %item.id, "cancelled during backoff, item stays failed");
                    return;
                }
                if let Err(e) = self.db.queue_items().requeue(item.id, next_retry_count).await {
                    error!(item_id = %item.id, error = %e, "failed to requeue for retry");
                    return;
                }
                if let Err(e) = self.queue.enqueue(item.id) {
                    // Queue closed while waiting out the backoff; the item
                    // is Queued and will be recovered on the next start.
                    debug!(item_id = %item.id, error = %e, "queue closed, retry deferred to next start");
                    return;
                }
                let _ = self.events.send(DownloadEvent::Queued { id: item.id });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{FetchOutcome, ProgressSink};
    use async_trait::async_trait;
    use std::path::Path;

    struct NeverFetch;

    #[async_trait]
    impl FetchDelegate for NeverFetch {
        async fn fetch(
            &self,
            _source_id: &str,
            _destination_dir: &Path,
            _on_progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<FetchOutcome> {
            unreachable!("not exercised in these tests")
        }

        async fn probe(&self, _source_id: &str) -> Result<Option<SourceMetadata>> {
            Ok(None)
        }
    }

    fn service() -> Arc<DownloadService> {
        Arc::new(DownloadService::new(
            Database::in_memory(),
            Arc::new(NeverFetch),
            Settings::default(),
        ))
    }

    #[tokio::test]
    async fn enqueue_creates_a_queued_record() {
        let svc = service();
        let item = svc.enqueue("abc123").await.unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
        assert_eq!(item.source_id, "abc123");

        let loaded = svc.get(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Queued);
    }

    #[tokio::test]
    async fn enqueue_emits_queued_event() {
        let svc = service();
        let mut events = svc.subscribe();
        let item = svc.enqueue("abc123").await.unwrap();
        match events.recv().await.unwrap() {
            DownloadEvent::Queued { id } => assert_eq!(id, item.id),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancel_of_queued_item_is_immediate() {
        let svc = service();
        let item = svc.enqueue("abc123").await.unwrap();
        svc.cancel(item.id).await.unwrap();

        let loaded = svc.get(item.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, QueueStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_of_terminal_item_is_rejected() {
        let svc = service();
        let item = svc.enqueue("abc123").await.unwrap();
        svc.cancel(item.id).await.unwrap();
        assert!(svc.cancel(item.id).await.is_err());
    }

    #[tokio::test]
    async fn retry_requires_a_terminal_failure() {
        let svc = service();
        let item = svc.enqueue("abc123").await.unwrap();
        assert!(svc.retry(item.id).await.is_err());

        svc.cancel(item.id).await.unwrap();
        let retried = svc.retry(item.id).await.unwrap();
        assert_eq!(retried.status, QueueStatus::Queued);
        assert_eq!(retried.retry_count, 0);
    }

    #[tokio::test]
    async fn enqueue_after_stop_fails() {
        let svc = service();
        svc.start().await.unwrap();
        svc.stop().await;
        assert!(svc.enqueue("abc123").await.is_err());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let svc = service();
        svc.start().await.unwrap();
        assert!(svc.start().await.is_err());
        svc.stop().await;
    }

    #[test]
    fn events_serialize_with_a_tag() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(DownloadEvent::Failed {
            id,
            error: "source unreachable".to_string(),
            will_retry: true,
        })
        .unwrap();
        assert_eq!(json["event"], "failed");
        assert_eq!(json["id"], id.to_string());
        assert_eq!(json["will_retry"], true);
    }

    #[tokio::test]
    async fn reload_swaps_the_snapshot() {
        let svc = service();
        let mut settings = Settings::default();
        settings.max_retries = 9;
        svc.reload_settings(settings);
        assert_eq!(svc.settings().max_retries, 9);
    }
}
