//! Per-item recovery records persisted under `<state_dir>/sidecars/<item_id>.json`.
//! Grounded in `original_source/tests/orchestrator/test_flow_recovery.py`'s
//! `SidecarStore.load`/`save` usage and `app.hdm.recovery`'s inferred sidecar shape.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SidecarStatus {
    Reserved,
    Downloading,
    Downloaded,
    Moved,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadSidecar {
    pub batch_id: String,
    pub item_id: String,
    pub dedupe_key: String,
    pub attempt: u32,
    pub status: SidecarStatus,
    pub source_path: Option<PathBuf>,
    pub download_id: Option<String>,
    pub bytes_written: Option<u64>,
    pub final_path: Option<PathBuf>,
}

impl DownloadSidecar {
    pub fn new(batch_id: impl Into<String>, item_id: impl Into<String>, dedupe_key: impl Into<String>, attempt: u32) -> Self {
        Self {
            batch_id: batch_id.into(),
            item_id: item_id.into(),
            dedupe_key: dedupe_key.into(),
            attempt,
            status: SidecarStatus::Reserved,
            source_path: None,
            download_id: None,
            bytes_written: None,
            final_path: None,
        }
    }

    pub fn mark(&mut self, status: SidecarStatus) -> &mut Self {
        self.status = status;
        self
    }

    pub fn with_source_path(&mut self, path: PathBuf) -> &mut Self {
        self.source_path = Some(path);
        self
    }

    pub fn with_download_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.download_id = Some(id.into());
        self
    }

    pub fn set_final(&mut self, path: PathBuf, bytes_written: u64) -> &mut Self {
        self.final_path = Some(path);
        self.bytes_written = Some(bytes_written);
        self.status = SidecarStatus::Moved;
        self
    }
}

/// Atomic JSON sidecar persistence (temp file + fsync + rename).
pub struct SidecarStore {
    dir: PathBuf,
}

impl SidecarStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn ensure_dir(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    fn path_for(&self, item_id: &str) -> PathBuf {
        self.dir.join(format!("{item_id}.json"))
    }

    pub async fn load(&self, item_id: &str) -> io::Result<Option<DownloadSidecar>> {
        let path = self.path_for(item_id);
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents).ok()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, sidecar: &DownloadSidecar) -> io::Result<()> {
        self.ensure_dir().await?;
        let final_path = self.path_for(&sidecar.item_id);
        let tmp_path = final_path.with_extension("json.tmp");
        let payload = serde_json::to_vec_pretty(sidecar)?;

        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&payload).await?;
        if let Err(e) = file.sync_all().await {
            tracing::warn!(error = %e, path = %tmp_path.display(), "fsync of sidecar temp file failed");
        }
        drop(file);

        fs::rename(&tmp_path, &final_path).await?;
        sync_dir_best_effort(&self.dir).await;
        Ok(())
    }

    pub async fn delete(&self, item_id: &str) -> io::Result<()> {
        match fs::remove_file(self.path_for(item_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// List all currently persisted sidecars, used by Recovery at startup.
    pub async fn list(&self) -> io::Result<Vec<DownloadSidecar>> {
        self.ensure_dir().await?;
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut sidecars = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(contents) = fs::read_to_string(&path).await {
                if let Ok(sidecar) = serde_json::from_str(&contents) {
                    sidecars.push(sidecar);
                }
            }
        }
        Ok(sidecars)
    }
}

pub(crate) async fn sync_dir_best_effort(dir: &Path) {
    match fs::File::open(dir).await {
        Ok(f) => {
            if let Err(e) = f.sync_all().await {
                tracing::warn!(error = %e, dir = %dir.display(), "fsync of directory failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, dir = %dir.display(), "could not open directory for fsync"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_through_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(dir.path());
        let mut sidecar = DownloadSidecar::new("b1", "i1", "k1", 1);
        sidecar.mark(SidecarStatus::Downloading);
        store.save(&sidecar).await.unwrap();

        let loaded = store.load("i1").await.unwrap().unwrap();
        assert_eq!(loaded.status, SidecarStatus::Downloading);
        assert_eq!(loaded.dedupe_key, "k1");
    }

    #[tokio::test]
    async fn missing_sidecar_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SidecarStore::new(dir.path());
        assert!(store.load("missing").await.unwrap().is_none());
    }
}
