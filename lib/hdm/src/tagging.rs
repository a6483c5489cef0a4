//! Audio tagger: writes artist/title/album metadata with `lofty`, reporting codec,
//! bitrate and duration. Grounded in `original_source/app/hdm/tagging.py`'s
//! apply-then-report contract; the `lofty` dependency itself is grounded in the
//! `musicdock-lrcget-cli` example repo.

use lofty::config::WriteOptions;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::probe::Probe;
use lofty::tag::{Accessor, ItemKey, Tag};
use std::path::Path;

use crate::model::DownloadItem;

#[derive(Debug, Clone, Default)]
pub struct TagReport {
    pub applied: bool,
    pub codec: Option<String>,
    pub bitrate_kbps: Option<u32>,
    pub duration_seconds: Option<f64>,
}

pub struct AudioTagger;

impl AudioTagger {
    pub fn new() -> Self {
        Self
    }

    /// Write artist/title/album tags into `path` and report what was read back from the
    /// container. Files `lofty` cannot parse are reported as `applied: false` rather
    /// than erroring — tagging failure never fails the download.
    pub fn apply_tags(&self, path: &Path, item: &DownloadItem) -> TagReport {
        let mut tagged_file = match Probe::open(path).and_then(|p| p.read()) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "file format not recognized by tagger");
                return TagReport::default();
            }
        };

        let properties = tagged_file.properties();
        let duration_seconds = Some(properties.duration().as_secs_f64());
        let bitrate_kbps = properties.audio_bitrate();
        let codec = Some(format!("{:?}", tagged_file.file_type()));

        let tag = match tagged_file.primary_tag_mut() {
            Some(tag) => tag,
            None => {
                let new_tag = Tag::new(tagged_file.primary_tag_type());
                tagged_file.insert_tag(new_tag);
                tagged_file
                    .primary_tag_mut()
                    .expect("tag was just inserted")
            }
        };
        tag.set_artist(item.artist.clone());
        tag.set_title(item.title.clone());
        if let Some(album) = &item.album {
            tag.set_album(album.clone());
        }
        if let Some(isrc) = &item.isrc {
            tag.insert_text(ItemKey::Isrc, isrc.clone());
        }
        if let Some(duration) = item.duration_seconds {
            tag.insert_text(ItemKey::Length, duration.to_string());
        }

        let applied = match tagged_file.save_to_path(path, WriteOptions::default()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "failed to write tags");
                false
            }
        };

        TagReport {
            applied,
            codec,
            bitrate_kbps,
            duration_seconds,
        }
    }
}

impl Default for AudioTagger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> DownloadItem {
        DownloadItem {
            batch_id: "b1".into(),
            item_id: "i1".into(),
            artist: "Artist".into(),
            title: "Title".into(),
            album: Some("Album".into()),
            isrc: None,
            requested_by: "tester".into(),
            priority: 0,
            dedupe_key: "k".into(),
            duration_seconds: None,
            bitrate: None,
            index: 0,
        }
    }

    #[test]
    fn unrecognized_file_reports_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-audio.txt");
        std::fs::write(&path, b"not an audio file").unwrap();
        let report = AudioTagger::new().apply_tags(&path, &item());
        assert!(!report.applied);
        assert!(report.codec.is_none());
    }
}
