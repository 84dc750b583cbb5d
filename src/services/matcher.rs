//! Artist/title matching against external search results
//!
//! Two normalization strategies are used side by side:
//! - a *tight key* (lowercase, all non-alphanumerics stripped) for exact
//!   identity comparisons and cache keys;
//! - a *loose key* (lowercase, trimmed) for substring containment, which
//!   tolerates suffix noise like "(Official Video)".
//!
//! [`find_best_match`] prefers an exact tight-key match anywhere in the
//! candidate list, then the first substring partial, then the caller's own
//! top-ranked candidate, rather than failing outright.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// External search result considered for a target (artist, title) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub source_id: String,
    pub title: String,
    /// Dedicated song-title field some sources provide; preferred over the
    /// generic title when present.
    pub song_title: Option<String>,
    pub artist: String,
}

impl MatchCandidate {
    /// The title field used for comparison.
    fn effective_title(&self) -> &str {
        match &self.song_title {
            Some(t) if !t.trim().is_empty() => t,
            _ => &self.title,
        }
    }
}

/// Lowercase with every non-alphanumeric character stripped.
pub fn tight_key(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Lowercase, trimmed only.
pub fn loose_key(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Select the best candidate for the target (artist, title).
///
/// Precedence: exact tight-key match (short-circuits the scan), else the
/// first partial match in list order, else the first candidate, else
/// `None`.
pub fn find_best_match<'a>(
    artist: &str,
    title: &str,
    candidates: &'a [MatchCandidate],
) -> Option<&'a MatchCandidate> {
    let target_artist_tight = tight_key(artist);
    let target_title_tight = tight_key(title);
    let target_artist_loose = loose_key(artist);
    let target_title_loose = loose_key(title);

    let mut partial: Option<&MatchCandidate> = None;

    for candidate in candidates {
        let cand_artist_tight = tight_key(&candidate.artist);
        let cand_title_tight = tight_key(candidate.effective_title());

        if cand_artist_tight == target_artist_tight && cand_title_tight == target_title_tight {
            debug!(
                source_id = %candidate.source_id,
                artist = %artist,
                title = %title,
                "exact match"
            );
            return Some(candidate);
        }

        if partial.is_none() {
            let cand_artist_loose = loose_key(&candidate.artist);
            let cand_title_loose = loose_key(candidate.effective_title());
            // Only the candidate's fields gate the partial check; an empty
            // target field is contained by anything and so matches any
            // non-blank candidate value.
            if !cand_artist_loose.is_empty()
                && !cand_title_loose.is_empty()
                && cand_artist_loose.contains(&target_artist_loose)
                && cand_title_loose.contains(&target_title_loose)
            {
                partial = Some(candidate);
            }
        }
    }

    if let Some(candidate) = partial {
        debug!(
            source_id = %candidate.source_id,
            artist = %artist,
            title = %title,
            "partial match"
        );
        return Some(candidate);
    }

    // No exact or partial hit: fall back to the caller's top-ranked result.
    candidates.first()
}
