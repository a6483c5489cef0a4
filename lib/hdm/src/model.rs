use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ValidationError;

/// A single track request, immutable once normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadItem {
    pub batch_id: String,
    pub item_id: String,
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub requested_by: String,
    pub priority: u32,
    pub dedupe_key: String,
    pub duration_seconds: Option<f64>,
    pub bitrate: Option<u32>,
    pub index: usize,
}

/// Raw fields for a single requested track, prior to normalization.
#[derive(Debug, Clone, Default)]
pub struct DownloadItemRequest {
    pub artist: String,
    pub title: String,
    pub album: Option<String>,
    pub isrc: Option<String>,
    pub dedupe_key: Option<String>,
    pub requested_by: Option<String>,
    pub priority: Option<u32>,
}

/// A batch submission: an ordered set of items sharing a requester and an optional
/// dedupe-key prefix.
#[derive(Debug, Clone, Default)]
pub struct DownloadBatchRequest {
    pub batch_id: Option<String>,
    pub requested_by: String,
    pub items: Vec<DownloadItemRequest>,
    pub dedupe_prefix: Option<String>,
    pub default_priority: u32,
}

impl DownloadBatchRequest {
    pub fn validate(&self, batch_max_items: usize) -> Result<(), ValidationError> {
        if self.items.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if self.items.len() > batch_max_items {
            return Err(ValidationError::TooManyItems {
                count: self.items.len(),
                max: batch_max_items,
            });
        }
        if self.requested_by.trim().is_empty() {
            return Err(ValidationError::BlankRequester);
        }
        for item in &self.items {
            if item.artist.trim().is_empty() {
                return Err(ValidationError::BlankArtist);
            }
            if item.title.trim().is_empty() {
                return Err(ValidationError::BlankTitle);
            }
        }
        Ok(())
    }

    /// Turn raw request items into immutable `DownloadItem`s under `batch_id`, assigning
    /// a fresh `item_id` and resolving each item's dedupe key. Callers must `validate`
    /// before normalizing.
    pub fn normalize(&self, batch_id: impl Into<String>) -> Vec<DownloadItem> {
        let batch_id = batch_id.into();
        self.items
            .iter()
            .enumerate()
            .map(|(index, req)| {
                let dedupe_key = resolve_dedupe_key(
                    req.dedupe_key.as_deref(),
                    req.isrc.as_deref(),
                    &req.artist,
                    &req.title,
                    req.album.as_deref(),
                    self.dedupe_prefix.as_deref(),
                );
                DownloadItem {
                    batch_id: batch_id.clone(),
                    item_id: uuid::Uuid::new_v4().to_string(),
                    artist: req.artist.trim().to_string(),
                    title: req.title.trim().to_string(),
                    album: req.album.clone(),
                    isrc: req.isrc.clone(),
                    requested_by: req
                        .requested_by
                        .clone()
                        .unwrap_or_else(|| self.requested_by.clone()),
                    priority: req.priority.unwrap_or(self.default_priority),
                    dedupe_key,
                    duration_seconds: None,
                    bitrate: None,
                    index,
                }
            })
            .collect()
    }
}

/// Compute the canonical dedupe key for a normalized item: explicit field, else ISRC
/// (uppercased), else lowercase `artist|title[|album]`, with an optional batch prefix.
pub fn resolve_dedupe_key(
    explicit: Option<&str>,
    isrc: Option<&str>,
    artist: &str,
    title: &str,
    album: Option<&str>,
    prefix: Option<&str>,
) -> String {
    let base = if let Some(k) = explicit.filter(|s| !s.trim().is_empty()) {
        k.trim().to_string()
    } else if let Some(isrc) = isrc.filter(|s| !s.trim().is_empty()) {
        isrc.trim().to_uppercase()
    } else {
        let mut parts = vec![artist.trim().to_lowercase(), title.trim().to_lowercase()];
        if let Some(album) = album.filter(|s| !s.trim().is_empty()) {
            parts.push(album.trim().to_lowercase());
        }
        let joined = parts.join("|");
        if joined.trim().is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            joined
        }
    };
    match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("{prefix}:{base}"),
        None => base,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Queued,
    Running,
    Done,
    Failed,
    Duplicate,
}

/// A single event recorded against an item while it moves through the pipeline.
/// `name` values feed phase-duration metrics: `download.accepted`, `download.in_progress`,
/// `download.completed`, `download.detected`, `tagging.completed`, `tagging.skipped`,
/// `file.moved`, `dedupe.skip`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl ItemEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }
}

/// The result of a completed pipeline stage chain for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub final_path: std::path::PathBuf,
    pub tags_written: bool,
    pub bytes_written: u64,
    pub track_duration_seconds: Option<f64>,
    pub quality: Option<String>,
    pub events: Vec<ItemEvent>,
}

/// Per-item bookkeeping held by the Aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    pub item_id: String,
    pub state: ItemState,
    pub attempts: u32,
    pub final_path: Option<std::path::PathBuf>,
    pub tags_written: bool,
    pub bytes_written: u64,
    pub duration_seconds: Option<f64>,
    pub quality: Option<String>,
    pub error: Option<String>,
    pub events: Vec<ItemEvent>,
}

impl ItemResult {
    pub fn queued(item_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            state: ItemState::Queued,
            attempts: 0,
            final_path: None,
            tags_written: false,
            bytes_written: 0,
            duration_seconds: None,
            quality: None,
            error: None,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Partial,
    Failure,
}

/// min/max/mean/p50/p95/p99 over processing-time samples, nearest-rank on a sorted
/// snapshot.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DurationStats {
    pub min_seconds: f64,
    pub max_seconds: f64,
    pub mean_seconds: f64,
    pub p50_seconds: f64,
    pub p95_seconds: f64,
    pub p99_seconds: f64,
}

impl DurationStats {
    pub fn compute(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let sum: f64 = sorted.iter().sum();
        Self {
            min_seconds: sorted[0],
            max_seconds: sorted[sorted.len() - 1],
            mean_seconds: sum / sorted.len() as f64,
            p50_seconds: nearest_rank(&sorted, 0.50),
            p95_seconds: nearest_rank(&sorted, 0.95),
            p99_seconds: nearest_rank(&sorted, 0.99),
        }
    }
}

/// Nearest-rank percentile: `ceil(p * n)`th smallest sample, 1-indexed, clamped to the
/// last element.
fn nearest_rank(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    let rank = ((p * n as f64).ceil() as usize).clamp(1, n);
    sorted[rank - 1]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchTotals {
    pub queued: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub retries: usize,
    pub duplicates: usize,
    pub dedupe_hits: usize,
}

/// The final, aggregated outcome of a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub status: BatchStatus,
    pub totals: BatchTotals,
    pub items: Vec<ItemResult>,
    pub durations: DurationStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_key_prefers_explicit_then_isrc_then_artist_title() {
        assert_eq!(
            resolve_dedupe_key(Some("explicit"), Some("isrc"), "a", "t", None, None),
            "explicit"
        );
        assert_eq!(
            resolve_dedupe_key(None, Some("us-abc-12-3456"), "a", "t", None, None),
            "US-ABC-12-3456"
        );
        assert_eq!(resolve_dedupe_key(None, None, "Artist", "Title", None, None), "artist|title");
        assert_eq!(
            resolve_dedupe_key(None, None, "Artist", "Title", Some("Album"), None),
            "artist|title|album"
        );
        assert_eq!(
            resolve_dedupe_key(None, None, "Artist", "Title", None, Some("batch1")),
            "batch1:artist|title"
        );
    }

    #[test]
    fn normalize_assigns_item_ids_and_dedupe_keys() {
        let request = DownloadBatchRequest {
            batch_id: None,
            requested_by: "tester".to_string(),
            items: vec![
                DownloadItemRequest {
                    artist: "Artist".into(),
                    title: "Title".into(),
                    ..Default::default()
                },
                DownloadItemRequest {
                    artist: "Other".into(),
                    title: "Track".into(),
                    dedupe_key: Some("explicit-key".into()),
                    ..Default::default()
                },
            ],
            dedupe_prefix: None,
            default_priority: 0,
        };
        let items = request.normalize("b1");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].batch_id, "b1");
        assert_eq!(items[0].dedupe_key, "artist|title");
        assert_eq!(items[1].dedupe_key, "explicit-key");
        assert_ne!(items[0].item_id, items[1].item_id);
        assert_eq!(items[0].index, 0);
        assert_eq!(items[1].index, 1);
    }

    #[test]
    fn validate_rejects_oversized_batch() {
        let request = DownloadBatchRequest {
            requested_by: "tester".into(),
            items: vec![DownloadItemRequest {
                artist: "a".into(),
                title: "t".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(request.validate(0).unwrap_err(), ValidationError::TooManyItems { count: 1, max: 0 });
    }
}
