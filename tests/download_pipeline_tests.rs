//! Integration tests for the download pipeline
//!
//! These tests drive the full orchestrator against the in-memory store and
//! a scripted fetch delegate:
//! - concurrency bound and exactly-once dispatch
//! - retry cycle and permanent failure
//! - catalog dedupe and file organization
//! - cancellation and restart recovery

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use vidarium::db::{CatalogStore, QueueItemRecord, QueueItemStore};
use vidarium::fetch::ProgressSink;
use vidarium::{
    Database, DownloadService, FetchDelegate, FetchOutcome, ProgressUpdate, QueueStatus, Settings,
    SourceMetadata,
};

/// Scripted delegate: fails the first `fail_first` attempts per source id,
/// then writes a real file and reports metadata derived from the source id.
struct ScriptedFetch {
    fail_first: u32,
    /// Per-source attempt counts.
    calls: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    /// Artificial transfer time, to make overlap observable.
    transfer_time: Duration,
    /// (artist, title) reported per source id; unknown ids get defaults.
    titles: HashMap<String, (String, String)>,
}

impl ScriptedFetch {
    fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            calls: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            transfer_time: Duration::from_millis(20),
            titles: HashMap::new(),
        }
    }

    fn with_title(mut self, source_id: &str, artist: &str, title: &str) -> Self {
        self.titles
            .insert(source_id.to_string(), (artist.to_string(), title.to_string()));
        self
    }

    fn calls_for(&self, source_id: &str) -> u32 {
        self.calls.lock().get(source_id).copied().unwrap_or(0)
    }

    fn total_calls(&self) -> u32 {
        self.calls.lock().values().sum()
    }

    fn metadata_for(&self, source_id: &str) -> SourceMetadata {
        let (artist, title) = self
            .titles
            .get(source_id)
            .cloned()
            .unwrap_or_else(|| ("Test Artist".to_string(), format!("Track {}", source_id)));
        SourceMetadata {
            source_id: source_id.to_string(),
            title: Some(title),
            artist: Some(artist),
            year: Some(2021),
            attributes: Default::default(),
        }
    }
}

#[async_trait]
impl FetchDelegate for ScriptedFetch {
    async fn fetch(
        &self,
        source_id: &str,
        destination_dir: &Path,
        on_progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        let attempt = {
            let mut calls = self.calls.lock();
            let n = calls.entry(source_id.to_string()).or_insert(0);
            *n += 1;
            *n
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        on_progress(ProgressUpdate {
            percent: 0.0,
            speed_bytes_sec: Some(1_000_000),
            eta_seconds: Some(4),
        });
        tokio::select! {
            _ = cancel.cancelled() => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Ok(FetchOutcome::failure("cancelled mid-transfer"));
            }
            _ = tokio::time::sleep(self.transfer_time) => {}
        }
        on_progress(ProgressUpdate {
            percent: 100.0,
            speed_bytes_sec: Some(1_000_000),
            eta_seconds: Some(0),
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if attempt <= self.fail_first {
            return Ok(FetchOutcome::failure("source unreachable"));
        }

        let path = destination_dir.join("media.mp4");
        tokio::fs::write(&path, b"media bytes").await?;
        Ok(FetchOutcome {
            success: true,
            file_path: Some(path),
            metadata: Some(self.metadata_for(source_id)),
            error: None,
            transient: false,
        })
    }

    async fn probe(&self, source_id: &str) -> Result<Option<SourceMetadata>> {
        Ok(Some(self.metadata_for(source_id)))
    }
}

/// Delegate that holds the transfer open until cancelled.
struct HangingFetch;

#[async_trait]
impl FetchDelegate for HangingFetch {
    async fn fetch(
        &self,
        _source_id: &str,
        _destination_dir: &Path,
        _on_progress: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<FetchOutcome> {
        cancel.cancelled().await;
        Ok(FetchOutcome::failure("cancelled mid-transfer"))
    }

    async fn probe(&self, _source_id: &str) -> Result<Option<SourceMetadata>> {
        Ok(None)
    }
}

struct Harness {
    svc: Arc<DownloadService>,
    db: Database,
    _dirs: tempfile::TempDir,
    library: PathBuf,
    staging: PathBuf,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn harness(fetch: Arc<dyn FetchDelegate>, tune: impl FnOnce(&mut Settings)) -> Harness {
    init_tracing();
    let dirs = tempfile::tempdir().expect("tempdir");
    let mut settings = Settings {
        library_path: dirs.path().join("library"),
        staging_path: dirs.path().join("staging"),
        retry_backoff_secs: 0,
        ..Settings::default()
    };
    tune(&mut settings);
    let library = settings.library_path.clone();
    let staging = settings.staging_path.clone();
    let db = Database::in_memory();
    let svc = Arc::new(DownloadService::new(db.clone(), fetch, settings));
    Harness {
        svc,
        db,
        _dirs: dirs,
        library,
        staging,
    }
}

/// Poll until the item satisfies the predicate or five seconds pass.
async fn wait_for(
    svc: &DownloadService,
    id: uuid::Uuid,
    predicate: impl Fn(&QueueItemRecord) -> bool,
) -> QueueItemRecord {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let item = svc.get(id).await.unwrap().expect("item exists");
            if predicate(&item) {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached within timeout")
}

#[tokio::test]
async fn completes_a_download_end_to_end() {
    let fetch = Arc::new(ScriptedFetch::new(0).with_title("vid1", "Drake", "Hotline Bling"));
    let h = harness(fetch.clone(), |_| {});
    h.svc.start().await.unwrap();

    let item = h.svc.enqueue("vid1").await.unwrap();
    let done = wait_for(&h.svc, item.id, |i| i.status == QueueStatus::Completed).await;

    assert_eq!(fetch.calls_for("vid1"), 1);
    let entry_id = done.catalog_entry_id.expect("resolved catalog entry");
    let entry = h.db.catalog().get(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.artist, "Drake");
    assert_eq!(entry.title, "Hotline Bling");
    assert_eq!(entry.source_id, "vid1");

    // Default pattern: {artist}/{artist} - {title}, source extension kept.
    let expected = h.library.join("Drake").join("Drake - Hotline Bling.mp4");
    assert_eq!(entry.file_path.as_deref(), Some(&*expected.to_string_lossy()));
    assert!(expected.exists());

    h.svc.stop().await;

    // The per-item staging directory is released on completion; stop has
    // joined the worker, so the cleanup has run.
    assert!(!h.staging.join(item.id.to_string()).exists());
}

#[tokio::test]
async fn respects_the_concurrency_bound() {
    let fetch = Arc::new(ScriptedFetch::new(0));
    let h = harness(fetch.clone(), |s| s.max_concurrency = 2);
    h.svc.start().await.unwrap();

    let mut ids = Vec::new();
    for n in 0..6 {
        ids.push(h.svc.enqueue(&format!("vid{}", n)).await.unwrap().id);
    }
    for id in &ids {
        wait_for(&h.svc, *id, |i| i.status.is_terminal()).await;
    }

    assert!(
        fetch.max_in_flight.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent transfers",
        fetch.max_in_flight.load(Ordering::SeqCst)
    );
    // Every item dispatched exactly once.
    assert_eq!(fetch.total_calls(), 6);
    for n in 0..6 {
        assert_eq!(fetch.calls_for(&format!("vid{}", n)), 1);
    }

    h.svc.stop().await;
}

#[tokio::test]
async fn retries_transient_failures_until_success() {
    let fetch = Arc::new(ScriptedFetch::new(1));
    let h = harness(fetch.clone(), |_| {});
    h.svc.start().await.unwrap();

    let item = h.svc.enqueue("flaky").await.unwrap();
    let done = wait_for(&h.svc, item.id, |i| i.status == QueueStatus::Completed).await;

    assert_eq!(fetch.calls_for("flaky"), 2);
    assert_eq!(done.retry_count, 1);

    h.svc.stop().await;
}

#[tokio::test]
async fn exhausts_the_retry_budget_and_stays_failed() {
    // Fails more times than the budget allows.
    let fetch = Arc::new(ScriptedFetch::new(10));
    let h = harness(fetch.clone(), |s| s.max_retries = 3);
    h.svc.start().await.unwrap();

    let item = h.svc.enqueue("doomed").await.unwrap();
    let done = wait_for(&h.svc, item.id, |i| {
        i.status == QueueStatus::Failed && i.retry_count == 3
    })
    .await;

    // Initial attempt plus three retries.
    assert_eq!(fetch.calls_for("doomed"), 4);
    assert!(done
        .error_message
        .as_deref()
        .unwrap()
        .contains("source unreachable"));

    // The budget stays exhausted: no further attempts happen.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fetch.calls_for("doomed"), 4);

    h.svc.stop().await;

    // The staging directory went with the permanent failure.
    assert!(!h.staging.join(item.id.to_string()).exists());
}

#[tokio::test]
async fn deduplicates_on_source_id_and_suffixes_the_file() {
    let fetch = Arc::new(ScriptedFetch::new(0).with_title("dup", "Drake", "Hotline Bling"));
    let h = harness(fetch.clone(), |s| s.max_concurrency = 1);
    h.svc.start().await.unwrap();

    let first = h.svc.enqueue("dup").await.unwrap();
    let second = h.svc.enqueue("dup").await.unwrap();
    let first = wait_for(&h.svc, first.id, |i| i.status == QueueStatus::Completed).await;
    let second = wait_for(&h.svc, second.id, |i| i.status == QueueStatus::Completed).await;

    // Both downloads resolved to the same catalog entry.
    assert_eq!(first.catalog_entry_id, second.catalog_entry_id);
    let entry_id = first.catalog_entry_id.unwrap();
    let entry = h.db.catalog().get(entry_id).await.unwrap().unwrap();

    // The first file kept its slot; the second got a numeric suffix and is
    // what the entry now points at.
    let original = h.library.join("Drake").join("Drake - Hotline Bling.mp4");
    let suffixed = h.library.join("Drake").join("Drake - Hotline Bling_1.mp4");
    assert!(original.exists());
    assert!(suffixed.exists());
    assert_eq!(entry.file_path.as_deref(), Some(&*suffixed.to_string_lossy()));

    h.svc.stop().await;
}

#[tokio::test]
async fn cancelling_an_in_flight_download_fails_it() {
    let h = harness(Arc::new(HangingFetch), |_| {});
    h.svc.start().await.unwrap();

    let item = h.svc.enqueue("slow").await.unwrap();
    wait_for(&h.svc, item.id, |i| i.status == QueueStatus::Downloading).await;

    h.svc.cancel(item.id).await.unwrap();
    let done = wait_for(&h.svc, item.id, |i| i.status.is_terminal()).await;
    assert_eq!(done.status, QueueStatus::Failed);
    assert_eq!(done.error_message.as_deref(), Some("cancelled"));

    h.svc.stop().await;
}

#[tokio::test]
async fn stop_leaves_pending_items_queued_and_restart_recovers_them() {
    let dirs = tempfile::tempdir().unwrap();
    let settings = Settings {
        library_path: dirs.path().join("library"),
        staging_path: dirs.path().join("staging"),
        retry_backoff_secs: 0,
        max_concurrency: 1,
        ..Settings::default()
    };
    let db = Database::in_memory();

    // First run: one item hangs in flight, the rest never start.
    let svc = Arc::new(DownloadService::new(
        db.clone(),
        Arc::new(HangingFetch),
        settings.clone(),
    ));
    svc.start().await.unwrap();
    let blocked = svc.enqueue("a").await.unwrap();
    let pending1 = svc.enqueue("b").await.unwrap();
    let pending2 = svc.enqueue("c").await.unwrap();
    wait_for(&svc, blocked.id, |i| i.status == QueueStatus::Downloading).await;
    svc.stop().await;

    // The in-flight item failed on cancellation; the others stayed Queued.
    let blocked = db.queue_items().get(blocked.id).await.unwrap().unwrap();
    assert_eq!(blocked.status, QueueStatus::Failed);
    for id in [pending1.id, pending2.id] {
        let item = db.queue_items().get(id).await.unwrap().unwrap();
        assert_eq!(item.status, QueueStatus::Queued);
    }

    // Second run against the same store picks the pending items back up.
    let fetch = Arc::new(ScriptedFetch::new(0));
    let svc = Arc::new(DownloadService::new(db.clone(), fetch.clone(), settings));
    svc.start().await.unwrap();
    for id in [pending1.id, pending2.id] {
        let item = wait_for(&svc, id, |i| i.status.is_terminal()).await;
        assert_eq!(item.status, QueueStatus::Completed);
    }
    assert_eq!(fetch.calls_for("b"), 1);
    assert_eq!(fetch.calls_for("c"), 1);

    svc.stop().await;
}

#[tokio::test]
async fn pre_start_enqueues_are_fetched_once_despite_recovery_seeding() {
    let fetch = Arc::new(ScriptedFetch::new(0));
    let h = harness(fetch.clone(), |s| s.max_concurrency = 4);

    // Enqueued before start: the ids are already in the channel, and the
    // recovery scan at start seeds every still-Queued record a second
    // time. The Queued → Downloading claim must collapse the duplicates.
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(h.svc.enqueue(&format!("vid{}", n)).await.unwrap().id);
    }
    h.svc.start().await.unwrap();

    for id in &ids {
        let item = wait_for(&h.svc, *id, |i| i.status.is_terminal()).await;
        assert_eq!(item.status, QueueStatus::Completed);
    }
    for n in 0..5 {
        assert_eq!(fetch.calls_for(&format!("vid{}", n)), 1);
    }

    h.svc.stop().await;
}

#[tokio::test]
async fn cancelled_while_queued_is_never_dispatched() {
    let fetch = Arc::new(ScriptedFetch::new(0));
    let h = harness(fetch.clone(), |s| s.max_concurrency = 1);

    // Cancel before the loop is running so the dequeue sees a Cancelled
    // item.
    let item = h.svc.enqueue("skipme").await.unwrap();
    h.svc.cancel(item.id).await.unwrap();
    let other = h.svc.enqueue("runme").await.unwrap();

    h.svc.start().await.unwrap();
    wait_for(&h.svc, other.id, |i| i.status == QueueStatus::Completed).await;

    assert_eq!(fetch.calls_for("skipme"), 0);
    let item = h.svc.get(item.id).await.unwrap().unwrap();
    assert_eq!(item.status, QueueStatus::Cancelled);

    h.svc.stop().await;
}

#[tokio::test]
async fn manual_retry_resets_the_budget() {
    let fetch = Arc::new(ScriptedFetch::new(1));
    let h = harness(fetch.clone(), |s| s.max_retries = 0);
    h.svc.start().await.unwrap();

    // No automatic retries: the first transient failure is permanent.
    let item = h.svc.enqueue("flaky").await.unwrap();
    wait_for(&h.svc, item.id, |i| i.status == QueueStatus::Failed).await;
    assert_eq!(fetch.calls_for("flaky"), 1);

    // A manual retry runs a fresh attempt, which succeeds.
    h.svc.retry(item.id).await.unwrap();
    let done = wait_for(&h.svc, item.id, |i| i.status.is_terminal()).await;
    assert_eq!(done.status, QueueStatus::Completed);
    assert_eq!(fetch.calls_for("flaky"), 2);

    h.svc.stop().await;
}

#[tokio::test]
async fn progress_reaches_the_store() {
    let fetch = Arc::new(ScriptedFetch::new(0));
    let h = harness(fetch, |_| {});
    h.svc.start().await.unwrap();

    let item = h.svc.enqueue("vid1").await.unwrap();
    let done = wait_for(&h.svc, item.id, |i| i.status == QueueStatus::Completed).await;

    // The delegate's final 100% update was persisted before completion.
    assert_eq!(done.progress_percent, 100.0);
    assert_eq!(done.speed_bytes_sec, Some(1_000_000));
    assert_eq!(done.eta_seconds, Some(0));

    h.svc.stop().await;
}

#[tokio::test]
async fn missing_metadata_falls_back_to_organizer_defaults() {
    // A delegate reporting no artist or title at all.
    struct BareFetch;

    #[async_trait]
    impl FetchDelegate for BareFetch {
        async fn fetch(
            &self,
            source_id: &str,
            destination_dir: &Path,
            _on_progress: ProgressSink,
            _cancel: CancellationToken,
        ) -> Result<FetchOutcome> {
            let path = destination_dir.join("media.mkv");
            tokio::fs::write(&path, b"x").await?;
            Ok(FetchOutcome {
                success: true,
                file_path: Some(path),
                metadata: Some(SourceMetadata {
                    source_id: source_id.to_string(),
                    ..Default::default()
                }),
                error: None,
                transient: false,
            })
        }

        async fn probe(&self, _source_id: &str) -> Result<Option<SourceMetadata>> {
            Ok(None)
        }
    }

    let h = harness(Arc::new(BareFetch), |_| {});
    h.svc.start().await.unwrap();

    let item = h.svc.enqueue("bare1").await.unwrap();
    wait_for(&h.svc, item.id, |i| i.status == QueueStatus::Completed).await;

    // Title fell back to the source id at persist time; the missing artist
    // got the organizer's default. The source's extension is preserved.
    let expected = h
        .library
        .join("Unknown Artist")
        .join("Unknown Artist - bare1.mkv");
    assert!(expected.exists());

    h.svc.stop().await;
}
