//! Crash recovery: on startup, scan sidecars left behind by a prior process and
//! republish completion events for files already on disk. Grounded in
//! `original_source/tests/orchestrator/test_flow_recovery.py`.

use std::sync::Arc;
use std::time::Duration;

use crate::completion::{ensure_stable, CompletionEventBus};
use crate::dedupe::DedupeManager;
use crate::sidecar::{SidecarStatus, SidecarStore};

pub struct HdmRecovery {
    sidecars: Arc<SidecarStore>,
    dedupe: Arc<DedupeManager>,
    bus: Arc<CompletionEventBus>,
    size_stable_seconds: u64,
    poll_interval: Duration,
}

impl HdmRecovery {
    pub fn new(
        sidecars: Arc<SidecarStore>,
        dedupe: Arc<DedupeManager>,
        bus: Arc<CompletionEventBus>,
        size_stable_seconds: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            sidecars,
            dedupe,
            bus,
            size_stable_seconds,
            poll_interval,
        }
    }

    /// Scan `<state_dir>/sidecars`. For each sidecar not already `moved`: if the dedupe
    /// index already lists a final path that still exists, delete the stale sidecar; if
    /// instead its `source_path` names an existing file, size-stabilize it and publish a
    /// completion event so a subsequently-submitted pipeline finishes the item without
    /// re-driving the remote transfer. Scan errors are logged and do not abort the scan.
    pub async fn run(&self) {
        let sidecars = match self.sidecars.list().await {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list sidecars during recovery");
                return;
            }
        };

        for sidecar in sidecars {
            if sidecar.status == SidecarStatus::Moved {
                continue;
            }

            if let Some(final_path) = self.dedupe.lookup_existing(&sidecar.dedupe_key).await {
                if tokio::fs::metadata(&final_path).await.is_ok() {
                    if let Err(e) = self.sidecars.delete(&sidecar.item_id).await {
                        tracing::warn!(error = %e, item_id = %sidecar.item_id, "failed to delete stale sidecar");
                    }
                    continue;
                }
            }

            let Some(source_path) = &sidecar.source_path else {
                continue;
            };
            let metadata = match tokio::fs::metadata(source_path).await {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if !metadata.is_file() {
                continue;
            }

            match ensure_stable(source_path, self.size_stable_seconds, self.poll_interval).await {
                Ok(size) => {
                    tracing::info!(
                        item_id = %sidecar.item_id,
                        dedupe_key = %sidecar.dedupe_key,
                        path = %source_path.display(),
                        "recovery republishing completion event for in-flight sidecar"
                    );
                    self.bus
                        .publish_event(&sidecar.dedupe_key, source_path.clone(), size)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, path = %source_path.display(), "recovery failed to size-stabilize candidate file");
                }
            }
        }
    }
}
