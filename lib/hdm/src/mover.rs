//! Atomic file mover: rename-first with an EXDEV (cross-device) fallback of
//! copy+fsync+rename+unlink. Grounded in `original_source/app/hdm/mover.py`.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::sidecar::sync_dir_best_effort;

pub struct AtomicFileMover;

impl AtomicFileMover {
    pub fn new() -> Self {
        Self
    }

    /// Move `source` to `destination`, creating parent directories as needed. Tries
    /// `rename` first; on `EXDEV` (crossing filesystems), falls back to a copy, fsync of
    /// the copy and its parent directory, rename into place, then unlink the source.
    /// fsync failures are logged and otherwise ignored — the rename is what matters for
    /// atomicity, fsync is best-effort durability.
    pub async fn move_into_place(&self, source: &Path, destination: &Path) -> io::Result<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        match fs::rename(source, destination).await {
            Ok(()) => {
                if let Some(parent) = destination.parent() {
                    sync_dir_best_effort(parent).await;
                }
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc_exdev()) => {
                self.copy_then_replace(source, destination).await
            }
            Err(e) => Err(e),
        }
    }

    async fn copy_then_replace(&self, source: &Path, destination: &Path) -> io::Result<()> {
        let tmp_destination = tmp_sibling(destination);

        fs::copy(source, &tmp_destination).await?;

        let file = fs::File::open(&tmp_destination).await?;
        if let Err(e) = file.sync_all().await {
            tracing::warn!(error = %e, path = %tmp_destination.display(), "fsync of moved file copy failed");
        }
        drop(file);

        fs::rename(&tmp_destination, destination).await?;
        if let Some(parent) = destination.parent() {
            sync_dir_best_effort(parent).await;
        }

        if let Err(e) = fs::remove_file(source).await {
            tracing::warn!(error = %e, path = %source.display(), "failed to unlink source after cross-device move");
        }
        Ok(())
    }
}

impl Default for AtomicFileMover {
    fn default() -> Self {
        Self::new()
    }
}

fn tmp_sibling(destination: &Path) -> PathBuf {
    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    destination.with_file_name(format!(".{file_name}.part"))
}

#[cfg(unix)]
fn libc_exdev() -> i32 {
    18
}

#[cfg(not(unix))]
fn libc_exdev() -> i32 {
    17
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_filesystem_move_renames() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.flac");
        let destination = dir.path().join("nested/dest.flac");
        fs::write(&source, b"data").await.unwrap();

        AtomicFileMover::new().move_into_place(&source, &destination).await.unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read(&destination).await.unwrap(), b"data");
    }

    #[tokio::test]
    async fn copy_then_replace_removes_source_and_writes_destination() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src.flac");
        let destination = dir.path().join("nested/dest.flac");
        fs::write(&source, b"cross-device-data").await.unwrap();

        AtomicFileMover::new().copy_then_replace(&source, &destination).await.unwrap();

        assert!(!source.exists());
        assert_eq!(fs::read(&destination).await.unwrap(), b"cross-device-data");
    }
}
