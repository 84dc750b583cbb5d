//! Progress reporting throttle
//!
//! Fetch delegates can emit progress at arbitrary rates. The reporter sits
//! between the delegate's callback and persistence: an update is accepted
//! only when it moved at least the configured step since the last accepted
//! value, or at least one second has passed. Accepted updates go onto a
//! bounded write queue drained by [`run_progress_writer`]; a full queue
//! drops the update rather than slowing the download, and a failed persist
//! is logged and swallowed.
//!
//! Percent is clamped to [0, 100] and treated as non-decreasing within one
//! attempt; ordering is local to this reporter's own state.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::{Database, QueueItemStore};
use crate::fetch::{ProgressSink, ProgressUpdate};
use crate::services::downloader::DownloadEvent;

/// Minimum time between accepted updates when the step threshold is not
/// met.
const MIN_ACCEPT_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the per-item persistence write queue.
pub const WRITE_QUEUE_CAPACITY: usize = 64;

struct ThrottleState {
    last_percent: f64,
    last_accepted: Option<Instant>,
}

/// Rate-limits one item's progress stream.
pub struct ProgressReporter {
    step_percent: f64,
    state: Mutex<ThrottleState>,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(step_percent: f64, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        Self {
            step_percent,
            state: Mutex::new(ThrottleState {
                last_percent: 0.0,
                last_accepted: None,
            }),
            tx,
        }
    }

    /// Feed one raw update through the throttle. Returns whether it was
    /// accepted and forwarded for persistence.
    pub fn observe(&self, update: ProgressUpdate) -> bool {
        let percent = update.percent.clamp(0.0, 100.0);

        let accepted = {
            let mut state = self.state.lock();
            // Within one attempt progress never goes backwards.
            if state.last_accepted.is_some() && percent < state.last_percent {
                return false;
            }
            let due = match state.last_accepted {
                None => true,
                Some(at) => {
                    percent - state.last_percent >= self.step_percent
                        || at.elapsed() >= MIN_ACCEPT_INTERVAL
                }
            };
            if due {
                state.last_percent = percent;
                state.last_accepted = Some(Instant::now());
            }
            due
        };

        if accepted {
            let forwarded = ProgressUpdate { percent, ..update };
            if self.tx.try_send(forwarded).is_err() {
                // Writer is behind; dropping is preferable to stalling the
                // delegate's callback.
                debug!(percent = percent, "progress write queue full, dropping update");
            }
        }
        accepted
    }

    /// Wrap the reporter as the sink handed to the fetch delegate.
    pub fn into_sink(self: Arc<Self>) -> ProgressSink {
        Arc::new(move |update| {
            self.observe(update);
        })
    }
}

/// Drain the write queue for one item: persist each accepted update and
/// rebroadcast it as a [`DownloadEvent::Progress`]. Runs until the sender
/// side (the reporter) is dropped.
pub async fn run_progress_writer(
    db: Database,
    item_id: Uuid,
    mut rx: mpsc::Receiver<ProgressUpdate>,
    events: broadcast::Sender<DownloadEvent>,
) {
    while let Some(update) = rx.recv().await {
        if let Err(e) = db
            .queue_items()
            .update_progress(
                item_id,
                update.percent,
                update.speed_bytes_sec,
                update.eta_seconds,
            )
            .await
        {
            warn!(item_id = %item_id, error = %e, "failed to persist progress update");
        }
        let _ = events.send(DownloadEvent::Progress {
            id: item_id,
            update,
        });
    }
}
