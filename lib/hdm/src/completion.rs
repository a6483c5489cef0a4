//! Completion Monitor & Event Bus. In-memory pub/sub keyed by dedupe_key, plus
//! size-stability detection. Grounded in `original_source/app/hdm/completion.py`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone)]
pub struct DownloadCompletionEvent {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

type Sink = mpsc::UnboundedSender<DownloadCompletionEvent>;

/// In-memory pub/sub mapping `dedupe_key -> set of waiter queues`. `publish` snapshots
/// the current subscribers before delivering so a slow or absent subscriber never
/// blocks the publisher.
#[derive(Default)]
pub struct CompletionEventBus {
    subscribers: Mutex<HashMap<String, Vec<Sink>>>,
}

pub struct Subscription {
    dedupe_key: String,
    receiver: mpsc::UnboundedReceiver<DownloadCompletionEvent>,
    bus: Arc<CompletionEventBus>,
    sink: Sink,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<DownloadCompletionEvent> {
        self.receiver.recv().await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<DownloadCompletionEvent> {
        tokio::time::timeout(timeout, self.receiver.recv()).await.ok().flatten()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let bus = self.bus.clone();
        let dedupe_key = self.dedupe_key.clone();
        let sink_ptr = self.sink.clone();
        tokio::spawn(async move {
            bus.unsubscribe(&dedupe_key, &sink_ptr).await;
        });
    }
}

impl CompletionEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn subscribe(self: &Arc<Self>, dedupe_key: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subs = self.subscribers.lock().await;
        subs.entry(dedupe_key.to_string()).or_default().push(tx.clone());
        Subscription {
            dedupe_key: dedupe_key.to_string(),
            receiver: rx,
            bus: self.clone(),
            sink: tx,
        }
    }

    async fn unsubscribe(&self, dedupe_key: &str, sink: &Sink) {
        let mut subs = self.subscribers.lock().await;
        if let Some(list) = subs.get_mut(dedupe_key) {
            list.retain(|s| !s.same_channel(sink));
            if list.is_empty() {
                subs.remove(dedupe_key);
            }
        }
    }

    /// Publish an event to every subscriber currently registered for `dedupe_key`.
    pub async fn publish(&self, dedupe_key: &str, event: DownloadCompletionEvent) {
        let snapshot = {
            let subs = self.subscribers.lock().await;
            subs.get(dedupe_key).cloned().unwrap_or_default()
        };
        for sink in snapshot {
            let _ = sink.send(event.clone());
        }
    }

    pub async fn publish_event(&self, dedupe_key: &str, path: PathBuf, bytes_written: u64) {
        self.publish(
            dedupe_key,
            DownloadCompletionEvent {
                path,
                bytes_written,
                timestamp: chrono::Utc::now(),
            },
        )
        .await;
    }
}

/// Poll a file's size until it has held the same positive value for
/// `size_stable_seconds`. Resets on shrink-to-zero or disappearance.
pub async fn ensure_stable(
    path: &Path,
    size_stable_seconds: u64,
    poll_interval: Duration,
) -> std::io::Result<u64> {
    let required = Duration::from_secs(size_stable_seconds);
    let mut stable_since: Option<(u64, Instant)> = None;
    loop {
        let metadata = tokio::fs::metadata(path).await;
        match metadata {
            Ok(meta) if meta.len() > 0 => {
                let size = meta.len();
                match stable_since {
                    Some((stable_size, since)) if stable_size == size => {
                        if since.elapsed() >= required {
                            return Ok(size);
                        }
                    }
                    _ => {
                        stable_since = Some((size, Instant::now()));
                    }
                }
            }
            _ => {
                stable_since = None;
            }
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Monitors `downloads_dir` for the completion of a given item: checks for an
/// already-registered path, then waits on the event bus, falling back to scanning the
/// directory for a filename match.
pub struct DownloadCompletionMonitor {
    downloads_dir: PathBuf,
    size_stable_seconds: u64,
    poll_interval: Duration,
    bus: Arc<CompletionEventBus>,
}

impl DownloadCompletionMonitor {
    pub fn new(
        downloads_dir: impl Into<PathBuf>,
        size_stable_seconds: u64,
        poll_interval: Duration,
        bus: Arc<CompletionEventBus>,
    ) -> Self {
        Self {
            downloads_dir: downloads_dir.into(),
            size_stable_seconds,
            poll_interval,
            bus,
        }
    }

    pub fn publish_event(&self, dedupe_key: &str, path: PathBuf, bytes_written: u64) -> impl std::future::Future<Output = ()> + '_ {
        let bus = self.bus.clone();
        let dedupe_key = dedupe_key.to_string();
        async move { bus.publish_event(&dedupe_key, path, bytes_written).await }
    }

    /// Wait for a completion event or directory-scan match for `dedupe_key`, then
    /// validate and size-stabilize the candidate file.
    pub async fn wait_for_completion(
        &self,
        dedupe_key: &str,
        artist: &str,
        title: &str,
        expected_path: Option<&Path>,
    ) -> std::io::Result<(PathBuf, u64)> {
        if let Some(path) = expected_path {
            if is_valid(path).await {
                let size = ensure_stable(path, self.size_stable_seconds, self.poll_interval).await?;
                return Ok((path.to_path_buf(), size));
            }
        }
        if let Some(candidate) = self.scan_candidates(dedupe_key, artist, title).await {
            let size = ensure_stable(&candidate, self.size_stable_seconds, self.poll_interval).await?;
            return Ok((candidate, size));
        }

        let mut subscription = self.bus.subscribe(dedupe_key).await;
        loop {
            if let Some(event) = subscription.recv_timeout(self.poll_interval).await {
                if is_valid(&event.path).await {
                    let size =
                        ensure_stable(&event.path, self.size_stable_seconds, self.poll_interval).await?;
                    return Ok((event.path, size));
                }
            }
            if let Some(candidate) = self.scan_candidates(dedupe_key, artist, title).await {
                let size = ensure_stable(&candidate, self.size_stable_seconds, self.poll_interval).await?;
                return Ok((candidate, size));
            }
        }
    }

    async fn scan_candidates(&self, dedupe_key: &str, artist: &str, title: &str) -> Option<PathBuf> {
        let mut entries = tokio::fs::read_dir(&self.downloads_dir).await.ok()?;
        let dedupe_lower = dedupe_key.to_lowercase();
        let artist_lower = artist.to_lowercase();
        let title_lower = title.to_lowercase();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = path.file_name()?.to_string_lossy().to_lowercase();
            if name.contains(&dedupe_lower) || (name.contains(&artist_lower) && name.contains(&title_lower)) {
                return Some(path);
            }
        }
        None
    }
}

async fn is_valid(path: &Path) -> bool {
    matches!(tokio::fs::metadata(path).await, Ok(meta) if meta.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waits_for_size_stability() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        tokio::fs::write(&path, vec![0u8; 256]).await.unwrap();

        let writer_path = path.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let mut existing = tokio::fs::read(&writer_path).await.unwrap();
                existing.extend(vec![0u8; 256]);
                tokio::fs::write(&writer_path, existing).await.unwrap();
            }
        });

        let size = ensure_stable(&path, 1, Duration::from_millis(30)).await.unwrap();
        assert!(size >= 256);
    }

    #[tokio::test]
    async fn publish_delivers_to_subscriber() {
        let bus = CompletionEventBus::new();
        let mut sub = bus.subscribe("key").await;
        bus.publish_event("key", PathBuf::from("/tmp/x"), 10).await;
        let event = sub.recv().await.unwrap();
        assert_eq!(event.bytes_written, 10);
    }
}
