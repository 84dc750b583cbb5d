//! Task queue for download requests
//!
//! A bounded hand-off between any number of producers (manual requests,
//! crash-recovery seeding) and the single consumer loop in the
//! orchestrator. FIFO, exactly-once: every enqueued id is delivered to the
//! consumer once, and `recv` completes only after the queue is closed and
//! drained.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::DownloadError;

/// Create a linked producer handle and consumer end.
pub fn task_queue() -> (TaskQueue, TaskReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        TaskQueue {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        TaskReceiver { rx },
    )
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct TaskQueue {
    // Taken on close so the receiver can drain and terminate.
    tx: Arc<Mutex<Option<mpsc::UnboundedSender<Uuid>>>>,
}

impl TaskQueue {
    /// Hand a queue item id to the consumer loop. Never blocks; fails only
    /// after [`close`](Self::close).
    pub fn enqueue(&self, id: Uuid) -> Result<(), DownloadError> {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(id).map_err(|_| DownloadError::QueueClosed),
            None => Err(DownloadError::QueueClosed),
        }
    }

    /// Close the queue. Later enqueues fail with
    /// [`DownloadError::QueueClosed`]; the consumer still receives
    /// everything enqueued before the close.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!("task queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

/// Consumer end held by the orchestrator loop.
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Uuid>,
}

impl TaskReceiver {
    /// Next id in FIFO order. Suspends while the queue is empty; returns
    /// `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Uuid> {
        self.rx.recv().await
    }
}
