//! File organization service
//!
//! Resolves a naming-pattern template into a sanitized, collision-free
//! destination under the library root and moves the fetched file there:
//! - `{variable}` placeholders are substituted case-insensitively, with
//!   documented defaults for absent values; unknown placeholders are left
//!   literally in the output so misconfiguration is visible.
//! - Directory and file segments are sanitized with distinct rules.
//! - An existing destination is never overwritten; a numeric suffix is
//!   appended before the extension until a free path is found.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::db::CatalogEntryRecord;

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").expect("placeholder regex"));

/// Characters stripped from directory segments.
const DIR_INVALID: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\'];

/// Fallback used when sanitization empties a directory segment.
const EMPTY_DIR_FALLBACK: &str = "unknown";
/// Fallback used when sanitization empties the filename segment.
const EMPTY_FILE_FALLBACK: &str = "untitled";

/// Extension used when the fetched file has none.
const DEFAULT_EXTENSION: &str = "mp4";

/// Variable values available to a naming pattern. Lookup is
/// case-insensitive on the placeholder name.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: HashMap<String, String>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.values.insert(name.to_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Context for a catalog entry with the documented defaults: artist
    /// "Unknown Artist", title "Untitled", year "0000".
    pub fn from_entry(entry: &CatalogEntryRecord) -> Self {
        let mut ctx = Self::new();
        ctx.set(
            "artist",
            non_empty(&entry.artist).unwrap_or("Unknown Artist"),
        );
        ctx.set("title", non_empty(&entry.title).unwrap_or("Untitled"));
        ctx.set(
            "year",
            entry
                .year
                .map(|y| y.to_string())
                .unwrap_or_else(|| "0000".to_string()),
        );
        ctx.set("source_id", entry.source_id.clone());
        ctx.set(
            "resolution",
            entry
                .attributes
                .resolution
                .as_deref()
                .unwrap_or("Unknown"),
        );
        ctx
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Substitute `{variable}` placeholders from the context. Unknown
/// placeholder names stay literal.
pub fn render_pattern(pattern: &str, ctx: &TemplateContext) -> String {
    PLACEHOLDER_RE
        .replace_all(pattern, |caps: &regex::Captures<'_>| {
            match ctx.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Sanitize a directory-name segment.
pub fn sanitize_dir_segment(segment: &str) -> String {
    let cleaned: String = segment
        .chars()
        .filter(|c| !DIR_INVALID.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim().trim_end_matches(['.', ' ']).to_string();
    if cleaned.is_empty() {
        EMPTY_DIR_FALLBACK.to_string()
    } else {
        cleaned
    }
}

/// Sanitize a filename segment (extension excluded).
pub fn sanitize_file_segment(segment: &str) -> String {
    let cleaned = sanitize_filename::sanitize(segment.trim());
    if cleaned.is_empty() {
        EMPTY_FILE_FALLBACK.to_string()
    } else {
        cleaned
    }
}

/// Organizes fetched files into the library tree.
#[derive(Debug, Clone, Default)]
pub struct OrganizerService;

impl OrganizerService {
    pub fn new() -> Self {
        Self
    }

    /// Resolve the relative destination (under the library root) for an
    /// entry, before collision handling.
    pub fn resolve_relative(
        &self,
        pattern: &str,
        ctx: &TemplateContext,
        extension: &str,
    ) -> PathBuf {
        let rendered = render_pattern(pattern, ctx);

        let segments: Vec<&str> = rendered
            .split(['/', '\\'])
            .filter(|s| !s.trim().is_empty())
            .collect();

        let mut path = PathBuf::new();
        match segments.split_last() {
            Some((file, dirs)) => {
                for dir in dirs {
                    path.push(sanitize_dir_segment(dir));
                }
                path.push(format!("{}.{}", sanitize_file_segment(file), extension));
            }
            None => path.push(format!("{}.{}", EMPTY_FILE_FALLBACK, extension)),
        }
        path
    }

    /// Move `source` to its organized destination. The destination
    /// directory is created first; an occupied path gets a `_1`, `_2`, …
    /// suffix before the extension. On any failure the source file is left
    /// untouched and the error surfaced.
    pub async fn organize(
        &self,
        source: &Path,
        library_root: &Path,
        pattern: &str,
        entry: &CatalogEntryRecord,
    ) -> Result<PathBuf> {
        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(DEFAULT_EXTENSION)
            .to_string();

        let ctx = TemplateContext::from_entry(entry);
        let relative = self.resolve_relative(pattern, &ctx, &extension);
        let resolved = library_root.join(relative);

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating destination directory {}", parent.display()))?;
        }

        let destination = reserve_destination(&resolved).await?;
        if destination != resolved {
            debug!(
                resolved = %resolved.display(),
                destination = %destination.display(),
                "destination occupied, using suffixed path"
            );
        }

        if let Err(e) = move_file(source, &destination).await {
            // Release the reserved slot; the source stays where it was.
            let _ = tokio::fs::remove_file(&destination).await;
            return Err(e).with_context(|| {
                format!(
                    "moving {} to {}",
                    source.display(),
                    destination.display()
                )
            });
        }

        info!(
            entry_id = %entry.id,
            destination = %destination.display(),
            "organized file into library"
        );

        Ok(destination)
    }
}

/// Claim the first free path at or after `candidate`, appending `_1`,
/// `_2`, … before the extension. The claim is an atomic `create_new` of
/// an empty placeholder, so two concurrent callers resolving the same
/// name always end up on distinct paths; the placeholder is replaced by
/// the moved file.
async fn reserve_destination(candidate: &Path) -> Result<PathBuf> {
    let stem = candidate
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(EMPTY_FILE_FALLBACK);
    let extension = candidate.extension().and_then(|e| e.to_str());
    let parent = candidate.parent().unwrap_or_else(|| Path::new(""));

    let mut n = 0u32;
    loop {
        let path = if n == 0 {
            candidate.to_path_buf()
        } else {
            let name = match extension {
                Some(ext) => format!("{}_{}.{}", stem, n, ext),
                None => format!("{}_{}", stem, n),
            };
            parent.join(name)
        };
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("reserving destination {}", path.display()))
            }
        }
    }
}

/// Rename, falling back to copy+remove for cross-device moves. The source
/// is only removed after the copy succeeded.
async fn move_file(source: &Path, destination: &Path) -> Result<()> {
    match tokio::fs::rename(source, destination).await {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            tokio::fs::copy(source, destination)
                .await
                .with_context(|| format!("rename failed ({}), copy fallback", rename_err))?;
            tokio::fs::remove_file(source).await?;
            Ok(())
        }
    }
}
