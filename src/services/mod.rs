//! Pipeline services
//!
//! The orchestrator in [`downloader`] ties the rest together: the task
//! queue, the retry policy, the progress throttle, the matcher, the
//! verifier, and the organizer.

pub mod downloader;
pub mod matcher;
pub mod organizer;
pub mod progress;
pub mod queue;
pub mod retry;
pub mod verifier;

pub use downloader::{DownloadEvent, DownloadService};
pub use matcher::{find_best_match, MatchCandidate};
pub use organizer::{OrganizerService, TemplateContext};
pub use progress::ProgressReporter;
pub use queue::{task_queue, TaskQueue, TaskReceiver};
pub use retry::{RetryDecision, RetryPolicy};
pub use verifier::{score_confidence, VerificationService};
