//! Per-item pipeline: dedupe fast-path, remote transfer follow, completion detection,
//! tagging, atomic move, dedupe registration. Grounded in
//! `original_source/app/hdm/pipeline.py`.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::completion::DownloadCompletionMonitor;
use crate::config::HdmConfig;
use crate::dedupe::DedupeManager;
use crate::error::{FatalDownloadError, PipelineError, RetryableDownloadError};
use crate::model::{DownloadItem, DownloadOutcome, ItemEvent};
use crate::mover::AtomicFileMover;
use crate::sidecar::{DownloadSidecar, SidecarStatus, SidecarStore};
use crate::slskd::{TransferClient, TransferStatus};
use crate::tagging::AudioTagger;

#[async_trait]
pub trait DownloadPipeline: Send + Sync {
    async fn run(&self, item: &DownloadItem, attempt: u32) -> Result<DownloadOutcome, PipelineError>;
}

pub struct DefaultDownloadPipeline {
    config: HdmConfig,
    dedupe: Arc<DedupeManager>,
    sidecars: Arc<SidecarStore>,
    completion: Arc<DownloadCompletionMonitor>,
    transfer: Arc<dyn TransferClient>,
    tagger: Arc<AudioTagger>,
    mover: Arc<AtomicFileMover>,
}

impl DefaultDownloadPipeline {
    pub fn new(
        config: HdmConfig,
        dedupe: Arc<DedupeManager>,
        sidecars: Arc<SidecarStore>,
        completion: Arc<DownloadCompletionMonitor>,
        transfer: Arc<dyn TransferClient>,
        tagger: Arc<AudioTagger>,
        mover: Arc<AtomicFileMover>,
    ) -> Self {
        Self {
            config,
            dedupe,
            sidecars,
            completion,
            transfer,
            tagger,
            mover,
        }
    }
}

#[async_trait]
impl DownloadPipeline for DefaultDownloadPipeline {
    async fn run(&self, item: &DownloadItem, attempt: u32) -> Result<DownloadOutcome, PipelineError> {
        let _lock = self.dedupe.acquire_lock(&item.dedupe_key).await?;
        let mut events = Vec::new();

        // (a) fast-path dedupe
        if let Some(existing) = self.dedupe.lookup_existing(&item.dedupe_key).await {
            if tokio::fs::metadata(&existing).await.is_ok() {
                events.push(ItemEvent::new("dedupe.skip"));
                return Ok(DownloadOutcome {
                    final_path: existing,
                    tags_written: false,
                    bytes_written: 0,
                    track_duration_seconds: None,
                    quality: None,
                    events,
                });
            }
        }

        let mut sidecar = DownloadSidecar::new(&item.batch_id, &item.item_id, &item.dedupe_key, attempt);
        self.sidecars.save(&sidecar).await?;

        // (b) remote transfer follow
        let mut completed_path: Option<PathBuf> = None;
        let mut completed_bytes: Option<u64> = None;
        let transfer = self.transfer.clone();
        let dedupe_key = item.dedupe_key.clone();
        let poll_interval = self.config.poll_interval;

        let stream_events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collected = stream_events.clone();
        let stream_result = transfer
            .stream_download_events(&dedupe_key, poll_interval, &mut |event| {
                collected.lock().unwrap().push(event);
            })
            .await;

        for event in stream_events.lock().unwrap().drain(..) {
            match event.status {
                TransferStatus::Accepted => {
                    events.push(ItemEvent::new("download.accepted"));
                    if let Some(id) = &event.download_id {
                        sidecar.with_download_id(id.clone());
                    }
                }
                TransferStatus::InProgress => {
                    events.push(ItemEvent::new("download.in_progress"));
                }
                TransferStatus::Completed => {
                    events.push(ItemEvent::new("download.completed"));
                    if let Some(path) = &event.path {
                        let path = PathBuf::from(path);
                        sidecar.with_source_path(path.clone());
                        self.completion
                            .publish_event(&dedupe_key, path.clone(), event.bytes_written.unwrap_or(0))
                            .await;
                        completed_path = Some(path);
                        completed_bytes = event.bytes_written;
                    }
                }
                TransferStatus::Failed => {
                    let retryable = event.retryable.unwrap_or(false);
                    let message = event
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "transfer failed".to_string());
                    if retryable {
                        let retry_after = event.retry_after_seconds.map(Duration::from_secs_f64);
                        return Err(match retry_after {
                            Some(d) => RetryableDownloadError::with_retry_after(message, d).into(),
                            None => RetryableDownloadError::new(message).into(),
                        });
                    } else {
                        return Err(FatalDownloadError::new(message).into());
                    }
                }
            }
        }
        sidecar.mark(SidecarStatus::Downloading);
        self.sidecars.save(&sidecar).await?;

        if let Err(e) = stream_result {
            if e.is_retryable() {
                return Err(RetryableDownloadError::new(e.to_string()).into());
            }
            return Err(FatalDownloadError::new(e.to_string()).into());
        }
        if completed_path.is_none() {
            return Err(FatalDownloadError::new("stream terminated unexpectedly".to_string()).into());
        }
        sidecar.mark(SidecarStatus::Downloaded);
        self.sidecars.save(&sidecar).await?;

        // (c) completion detection, size stability
        let expected_path = completed_path.clone();
        let (stable_path, stable_size) = self
            .completion
            .wait_for_completion(
                &item.dedupe_key,
                &item.artist,
                &item.title,
                expected_path.as_deref(),
            )
            .await?;
        events.push(ItemEvent::new("download.detected"));
        let bytes_written = completed_bytes.unwrap_or(stable_size);

        // (d) tagging
        let report = self.tagger.apply_tags(&stable_path, item);
        if report.applied {
            events.push(ItemEvent::new("tagging.completed"));
        } else {
            events.push(ItemEvent::new("tagging.skipped"));
        }

        // (e) atomic move
        let extension = stable_path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_string);
        let destination = self.dedupe.plan_destination(item, extension.as_deref());
        self.mover.move_into_place(&stable_path, &destination).await?;
        events.push(ItemEvent::new("file.moved"));

        // (f) register completion
        self.dedupe.register_completion(&item.dedupe_key, &destination).await?;
        sidecar.set_final(destination.clone(), bytes_written);
        self.sidecars.save(&sidecar).await?;

        let quality = report
            .codec
            .as_ref()
            .map(|codec| match report.bitrate_kbps {
                Some(kbps) => format!("{codec}/{kbps}"),
                None => codec.clone(),
            });

        Ok(DownloadOutcome {
            final_path: destination,
            tags_written: report.applied,
            bytes_written,
            track_duration_seconds: report.duration_seconds,
            quality,
            events,
        })
    }
}
