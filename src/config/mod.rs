//! Pipeline configuration
//!
//! `Settings` is an explicit snapshot: the orchestrator captures one copy
//! when it starts and again at the start of each item's processing, and
//! only [`DownloadService::reload_settings`](crate::services::DownloadService::reload_settings)
//! replaces it. There is no ambient mutable settings state.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Settings consumed by the download pipeline, typically sourced from the
/// application's settings provider and refreshed via an explicit reload.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum number of items in Downloading state at once.
    pub max_concurrency: usize,

    /// Retry attempts after the initial one before an item is permanently
    /// failed.
    pub max_retries: u32,

    /// Fixed delay between attempts. Deliberately not exponential.
    pub retry_backoff_secs: u64,

    /// Minimum percent delta for a progress update to be accepted.
    pub progress_step_percent: f64,

    /// Naming pattern for organized files, e.g. `{artist}/{artist} - {title}`.
    pub naming_pattern: String,

    /// Confidence at or above which a verification is considered a match.
    pub confidence_threshold: f64,

    /// Allowed duration drift before the full duration penalty applies.
    pub duration_tolerance_secs: f64,

    /// Root of the organized library.
    pub library_path: PathBuf,

    /// Directory where in-flight downloads land before organization.
    pub staging_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            max_retries: 3,
            retry_backoff_secs: 30,
            progress_step_percent: 5.0,
            naming_pattern: "{artist}/{artist} - {title}".to_string(),
            confidence_threshold: 0.8,
            duration_tolerance_secs: 5.0,
            library_path: PathBuf::from("./data/library"),
            staging_path: PathBuf::from("./data/staging"),
        }
    }
}

impl Settings {
    /// Load settings from `VIDARIUM_*` environment variables, falling back
    /// to the documented defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            max_concurrency: parse_var("VIDARIUM_MAX_CONCURRENCY", defaults.max_concurrency)?,
            max_retries: parse_var("VIDARIUM_MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_secs: parse_var(
                "VIDARIUM_RETRY_BACKOFF_SECS",
                defaults.retry_backoff_secs,
            )?,
            progress_step_percent: parse_var(
                "VIDARIUM_PROGRESS_STEP_PERCENT",
                defaults.progress_step_percent,
            )?,
            naming_pattern: env::var("VIDARIUM_NAMING_PATTERN")
                .unwrap_or(defaults.naming_pattern),
            confidence_threshold: parse_var(
                "VIDARIUM_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            )?,
            duration_tolerance_secs: parse_var(
                "VIDARIUM_DURATION_TOLERANCE_SECS",
                defaults.duration_tolerance_secs,
            )?,
            library_path: env::var("VIDARIUM_LIBRARY_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.library_path),
            staging_path: env::var("VIDARIUM_STAGING_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.staging_path),
        })
    }

    /// Fixed retry backoff as a [`Duration`].
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid value for {}", name)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.max_concurrency, 3);
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.retry_backoff(), Duration::from_secs(30));
        assert!(s.naming_pattern.contains("{artist}"));
    }
}
