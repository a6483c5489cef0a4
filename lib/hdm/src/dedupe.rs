//! Dedupe Manager: per-dedupe-key exclusive lock, a persistent dedupe index, and the
//! destination-path template engine. Grounded in `original_source/app/hdm/dedup.py`.

use fs2::FileExt;
use regex::Regex;
use serde_json::Map;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::ConfigError;
use crate::model::DownloadItem;
use crate::sidecar::sync_dir_best_effort;

const KNOWN_PLACEHOLDERS: &[&str] = &[
    "artist",
    "album",
    "title",
    "dedupe_key",
    "batch_id",
    "item_id",
    "extension",
];

/// A compiled destination-path template. Compiling validates every `{placeholder}`
/// against the known set, so an unknown placeholder fails fast at construction rather
/// than at first render.
#[derive(Debug, Clone)]
pub struct MoveTemplate {
    raw: String,
}

impl MoveTemplate {
    pub fn compile(raw: impl Into<String>) -> Result<Self, ConfigError> {
        let raw = raw.into();
        for placeholder in extract_placeholders(&raw) {
            if !KNOWN_PLACEHOLDERS.contains(&placeholder.as_str()) {
                return Err(ConfigError::UnknownPlaceholder(placeholder));
            }
        }
        Ok(Self { raw })
    }

    pub fn render(&self, fields: &HashMap<&str, String>) -> String {
        let mut rendered = self.raw.clone();
        for (key, value) in fields {
            rendered = rendered.replace(&format!("{{{key}}}"), value);
        }
        rendered
    }
}

fn extract_placeholders(template: &str) -> Vec<String> {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("valid regex"));
    re.captures_iter(template)
        .map(|c| c[1].to_string())
        .collect()
}

/// Filesystem-safe lock filename for a dedupe key: dedupe keys are derived from
/// user-supplied artist/title text and may contain path separators, so the raw key
/// cannot be used as a path component directly.
fn lock_file_name(dedupe_key: &str) -> String {
    let digest = Sha256::digest(dedupe_key.as_bytes());
    format!("{digest:x}.lock")
}

/// Strip path separators and control characters, collapse whitespace runs, trim.
pub fn sanitize_name(input: &str) -> String {
    let stripped: String = input
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect();
    let collapsed = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.trim().to_string()
}

/// A scoped lock held for the duration of pipeline processing of one dedupe key.
/// Combines a process-local mutex (intra-process fairness) with an OS advisory file
/// lock (cross-process safety), acquired in that order and released in reverse.
pub struct DedupeLockGuard {
    _process_guard: tokio::sync::OwnedMutexGuard<()>,
    file: Option<std::fs::File>,
}

impl Drop for DedupeLockGuard {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
    }
}

pub struct DedupeManager {
    music_dir: PathBuf,
    state_dir: PathBuf,
    template: MoveTemplate,
    process_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    index: Mutex<Option<HashMap<String, String>>>,
}

impl DedupeManager {
    pub fn new(music_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>, template: MoveTemplate) -> Self {
        Self {
            music_dir: music_dir.into(),
            state_dir: state_dir.into(),
            template,
            process_locks: Mutex::new(HashMap::new()),
            index: Mutex::new(None),
        }
    }

    fn index_path(&self) -> PathBuf {
        self.state_dir.join("dedupe_index.json")
    }

    fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    /// Acquire the per-dedupe-key lock, blocking until free. Released on drop.
    pub async fn acquire_lock(&self, dedupe_key: &str) -> io::Result<DedupeLockGuard> {
        let process_mutex = {
            let mut locks = self.process_locks.lock().await;
            locks
                .entry(dedupe_key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let process_guard = process_mutex.lock_owned().await;

        let locks_dir = self.locks_dir();
        fs::create_dir_all(&locks_dir).await?;
        let lock_path = locks_dir.join(lock_file_name(dedupe_key));
        let file = tokio::task::spawn_blocking(move || -> io::Result<std::fs::File> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok(file)
        })
        .await
        .expect("lock acquisition task panicked")?;

        Ok(DedupeLockGuard {
            _process_guard: process_guard,
            file: Some(file),
        })
    }

    async fn load_index(&self) -> HashMap<String, String> {
        let path = self.index_path();
        match fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<Map<String, serde_json::Value>>(&contents) {
                Ok(map) => map
                    .into_iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                    .collect(),
                Err(_) => HashMap::new(),
            },
            Err(_) => HashMap::new(),
        }
    }

    /// Look up an existing final path for a dedupe key.
    pub async fn lookup_existing(&self, dedupe_key: &str) -> Option<PathBuf> {
        let mut guard = self.index.lock().await;
        if guard.is_none() {
            *guard = Some(self.load_index().await);
        }
        guard
            .as_ref()
            .and_then(|index| index.get(dedupe_key))
            .map(PathBuf::from)
    }

    /// Register a completed dedupe-key -> final-path mapping, persisted atomically.
    pub async fn register_completion(&self, dedupe_key: &str, final_path: &Path) -> io::Result<()> {
        let mut guard = self.index.lock().await;
        let index = match guard.as_mut() {
            Some(index) => index,
            None => {
                *guard = Some(self.load_index().await);
                guard.as_mut().unwrap()
            }
        };
        index.insert(dedupe_key.to_string(), final_path.to_string_lossy().to_string());

        fs::create_dir_all(&self.state_dir).await?;
        let payload = serde_json::to_vec_pretty(&index)?;
        let tmp_path = self.index_path().with_extension("json.tmp");
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&payload).await?;
        if let Err(e) = file.sync_all().await {
            tracing::warn!(error = %e, "fsync of dedupe index temp file failed");
        }
        drop(file);
        fs::rename(&tmp_path, self.index_path()).await?;
        sync_dir_best_effort(&self.state_dir).await;
        Ok(())
    }

    /// Render the destination path for an item given the source file's extension.
    pub fn plan_destination(&self, item: &DownloadItem, source_extension: Option<&str>) -> PathBuf {
        let extension = source_extension
            .map(|e| e.to_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "bin".to_string());

        let mut fields: HashMap<&str, String> = HashMap::new();
        fields.insert(
            "artist",
            sanitize_or_default(&item.artist, "Unknown Artist"),
        );
        fields.insert(
            "album",
            sanitize_or_default(item.album.as_deref().unwrap_or(""), "Unknown Album"),
        );
        fields.insert("title", sanitize_or_default(&item.title, "Track"));
        fields.insert("dedupe_key", sanitize_name(&item.dedupe_key));
        fields.insert("batch_id", sanitize_name(&item.batch_id));
        fields.insert("item_id", sanitize_name(&item.item_id));
        fields.insert("extension", extension);

        let rendered = self.template.render(&fields);
        self.music_dir.join(rendered)
    }
}

fn sanitize_or_default(input: &str, default: &str) -> String {
    let sanitized = sanitize_name(input);
    if sanitized.is_empty() {
        default.to_string()
    } else {
        sanitized
    }
}

/// placeholders accepted by `MoveTemplate`, exposed for config validation diagnostics
pub fn known_placeholders() -> &'static [&'static str] {
    KNOWN_PLACEHOLDERS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> DownloadItem {
        DownloadItem {
            batch_id: "b1".into(),
            item_id: "i1".into(),
            artist: "Artist/Name".into(),
            title: "Track: Title".into(),
            album: Some("Album".into()),
            isrc: None,
            requested_by: "tester".into(),
            priority: 0,
            dedupe_key: "artist|track".into(),
            duration_seconds: None,
            bitrate: None,
            index: 0,
        }
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = MoveTemplate::compile("{artist}/{bogus}.{extension}").unwrap_err();
        assert_eq!(err, ConfigError::UnknownPlaceholder("bogus".to_string()));
    }

    #[test]
    fn sanitizes_unsafe_characters() {
        assert_eq!(sanitize_name("Artist/Name: Weird?"), "ArtistName Weird");
    }

    #[tokio::test]
    async fn plan_destination_renders_template() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DedupeManager::new(
            dir.path().join("music"),
            dir.path().join("state"),
            MoveTemplate::compile("{artist}/{album}/{title}.{extension}").unwrap(),
        );
        let dest = manager.plan_destination(&item(), Some("FLAC"));
        assert_eq!(
            dest,
            dir.path().join("music/ArtistName/Album/Track Title.flac")
        );
    }

    #[tokio::test]
    async fn register_and_lookup_completion_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DedupeManager::new(
            dir.path().join("music"),
            dir.path().join("state"),
            MoveTemplate::compile("{title}.{extension}").unwrap(),
        );
        let final_path = dir.path().join("music/Track.flac");
        manager.register_completion("k1", &final_path).await.unwrap();
        let found = manager.lookup_existing("k1").await.unwrap();
        assert_eq!(found, final_path);
    }

    #[tokio::test]
    async fn acquire_lock_tolerates_path_separators_in_dedupe_key() {
        let dir = tempfile::tempdir().unwrap();
        let manager = DedupeManager::new(
            dir.path().join("music"),
            dir.path().join("state"),
            MoveTemplate::compile("{title}.{extension}").unwrap(),
        );
        // Dedupe keys derived from raw artist/title text (e.g. "AC/DC|Thunderstruck")
        // can contain path separators; the lock file name must not echo them verbatim.
        let guard = manager.acquire_lock("AC/DC|Thunderstruck").await.unwrap();
        drop(guard);
    }

    #[tokio::test]
    async fn acquire_lock_serializes_concurrent_access() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(DedupeManager::new(
            dir.path().join("music"),
            dir.path().join("state"),
            MoveTemplate::compile("{title}.{extension}").unwrap(),
        ));
        let order = Arc::new(tokio::sync::Mutex::new(Vec::new()));

        let m1 = manager.clone();
        let o1 = order.clone();
        let t1 = tokio::spawn(async move {
            let _guard = m1.acquire_lock("k").await.unwrap();
            o1.lock().await.push("t1-start");
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            o1.lock().await.push("t1-end");
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let m2 = manager.clone();
        let o2 = order.clone();
        let t2 = tokio::spawn(async move {
            let _guard = m2.acquire_lock("k").await.unwrap();
            o2.lock().await.push("t2-start");
        });

        t1.await.unwrap();
        t2.await.unwrap();
        let order = order.lock().await;
        // t2 must not start until t1 has ended.
        let t2_pos = order.iter().position(|e| *e == "t2-start").unwrap();
        let t1_end_pos = order.iter().position(|e| *e == "t1-end").unwrap();
        assert!(t2_pos > t1_end_pos);
    }
}
