//! Orchestrator lifecycle: the bounded worker pool driving the scheduler, and the
//! `submit_batch`/`submit_single` entry points. Grounded in
//! `original_source/app/hdm/orchestrator.py`'s `HdmOrchestrator`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::aggregator::{BatchHandle, DownloadBatchAggregator};
use crate::config::HdmConfig;
use crate::error::ValidationError;
use crate::idempotency::IdempotencyStore;
use crate::model::{DownloadBatchRequest, DownloadItem, DownloadItemRequest};
use crate::pipeline::DownloadPipeline;
use crate::retry::{apply_retry_after, backoff_delay};
use crate::scheduler::{RoundRobinQueue, SharedQueue};

/// Coordinates batch submission, the round-robin scheduler, and a bounded pool of
/// workers driving the pipeline for each dequeued item.
pub struct HdmOrchestrator {
    config: HdmConfig,
    scheduler: SharedQueue,
    aggregator: Arc<DownloadBatchAggregator>,
    idempotency: Arc<dyn IdempotencyStore>,
    pipeline: Arc<dyn DownloadPipeline>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl HdmOrchestrator {
    pub fn new(
        config: HdmConfig,
        aggregator: Arc<DownloadBatchAggregator>,
        idempotency: Arc<dyn IdempotencyStore>,
        pipeline: Arc<dyn DownloadPipeline>,
    ) -> Arc<Self> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Arc::new(Self {
            config,
            scheduler: Arc::new(RoundRobinQueue::new()),
            aggregator,
            idempotency,
            pipeline,
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        })
    }

    /// Lazily spawn `worker_concurrency` workers, exactly once.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut workers = self.workers.lock().await;
        for worker_index in 0..self.config.worker_concurrency {
            let orchestrator = self.clone();
            workers.push(tokio::spawn(async move {
                orchestrator.run_worker(worker_index).await;
            }));
        }
    }

    /// Set the stopping flag, close the scheduler (waking blocked workers), cancel
    /// in-flight processing, and wait for every worker to exit concurrently.
    pub async fn shutdown(&self) {
        let _ = self.cancel_tx.send(true);
        self.scheduler.stop().await;
        let mut workers = self.workers.lock().await;
        join_all(workers.drain(..)).await;
    }

    /// Normalize, validate, register with the Aggregator, and enqueue every item of
    /// `request`. Never returns a pipeline error — results surface through the returned
    /// handle's `BatchSummary`.
    pub async fn submit_batch(
        &self,
        request: DownloadBatchRequest,
    ) -> Result<BatchHandle, ValidationError> {
        request.validate(self.config.batch_max_items)?;

        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let items = request.normalize(batch_id.clone());
        let item_ids: Vec<String> = items.iter().map(|i| i.item_id.clone()).collect();

        let handle = self
            .aggregator
            .create_batch(batch_id, request.requested_by.clone(), &item_ids)
            .await;

        for item in items {
            self.scheduler.put(item).await;
        }

        Ok(handle)
    }

    /// Sugar over `submit_batch` for a single item.
    pub async fn submit_single(
        &self,
        item: DownloadItemRequest,
        requested_by: impl Into<String>,
    ) -> Result<BatchHandle, ValidationError> {
        self.submit_batch(DownloadBatchRequest {
            batch_id: None,
            requested_by: requested_by.into(),
            items: vec![item],
            dedupe_prefix: None,
            default_priority: 0,
        })
        .await
    }

    async fn run_worker(self: Arc<Self>, worker_index: usize) {
        tracing::info!(worker_index, "worker started");
        loop {
            let item = match self.scheduler.take().await {
                Some(item) => item,
                None => break,
            };
            self.process_item(item).await;
        }
        tracing::info!(worker_index, "worker stopped");
    }

    async fn process_item(&self, item: DownloadItem) {
        let span = tracing::info_span!(
            "pipeline_item",
            batch_id = %item.batch_id,
            item_id = %item.item_id,
            dedupe_key = %item.dedupe_key,
        );
        self.process_item_inner(item).instrument(span).await
    }

    async fn process_item_inner(&self, item: DownloadItem) {
        self.aggregator
            .record_running(&item.batch_id, &item.item_id)
            .await;

        let reservation = match self.idempotency.reserve(&item.dedupe_key).await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "idempotency reserve failed");
                self.aggregator
                    .record_failure(&item.batch_id, &item.item_id, 0, format!("IdempotencyError: {e}"), 0.0)
                    .await;
                return;
            }
        };

        if !reservation.acquired {
            let reason = reservation.reason.unwrap_or("in_progress");
            tracing::info!(reason, "item is a duplicate, skipping pipeline");
            self.aggregator
                .record_duplicate(
                    &item.batch_id,
                    &item.item_id,
                    reason,
                    reservation.already_processed,
                )
                .await;
            return;
        }

        let success = self.drive_pipeline(&item).await;

        if let Err(e) = self.idempotency.release(&item.dedupe_key, success).await {
            tracing::warn!(error = %e, "idempotency release failed");
        }
    }

    /// Runs the retry loop described in spec.md §4.2. Returns whether the item ended in
    /// `done` (so the caller can release the idempotency reservation accordingly).
    async fn drive_pipeline(&self, item: &DownloadItem) -> bool {
        let started_at = Instant::now();
        let mut rng = rand::rng();

        for attempt in 1..=self.config.max_retries {
            if *self.cancel_rx.borrow() {
                self.finish_cancelled(item, attempt).await;
                return false;
            }

            let mut cancel_rx = self.cancel_rx.clone();
            let result = tokio::select! {
                biased;
                _ = cancel_rx.changed() => {
                    self.finish_cancelled(item, attempt).await;
                    return false;
                }
                result = self.pipeline.run(item, attempt) => result,
            };

            match result {
                Ok(outcome) => {
                    tracing::info!(attempt, "item completed successfully");
                    self.aggregator
                        .record_success(
                            &item.batch_id,
                            &item.item_id,
                            outcome,
                            attempt,
                            started_at.elapsed().as_secs_f64(),
                        )
                        .await;
                    return true;
                }
                Err(err) => {
                    let message = err.classified_message();
                    match err.retry_after() {
                        Some(retry_after_hint) => {
                            tracing::warn!(attempt, error = %message, "retryable pipeline failure");
                            self.aggregator
                                .record_retry(
                                    &item.batch_id,
                                    &item.item_id,
                                    attempt,
                                    message.clone(),
                                    retry_after_hint,
                                )
                                .await;
                            if attempt == self.config.max_retries {
                                self.aggregator
                                    .record_failure(
                                        &item.batch_id,
                                        &item.item_id,
                                        attempt,
                                        message,
                                        started_at.elapsed().as_secs_f64(),
                                    )
                                    .await;
                                return false;
                            }
                            let delay = backoff_delay(
                                self.config.retry_base_seconds,
                                attempt,
                                self.config.retry_jitter_pct,
                                &mut rng,
                            );
                            let delay = apply_retry_after(delay, retry_after_hint);
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(attempt, error = %message, "fatal pipeline failure");
                            self.aggregator
                                .record_failure(
                                    &item.batch_id,
                                    &item.item_id,
                                    attempt,
                                    message,
                                    started_at.elapsed().as_secs_f64(),
                                )
                                .await;
                            return false;
                        }
                    }
                }
            }
        }
        unreachable!("max_retries is validated to be > 0, so the loop above always returns")
    }

    async fn finish_cancelled(&self, item: &DownloadItem, attempt: u32) {
        tracing::warn!(attempt, "pipeline item cancelled by shutdown");
        self.aggregator
            .record_failure(
                &item.batch_id,
                &item.item_id,
                attempt,
                "Cancelled: shutdown requested",
                0.0,
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FatalDownloadError, PipelineError, RetryableDownloadError};
    use crate::idempotency::InMemoryIdempotencyStore;
    use crate::model::{BatchStatus, DownloadItemRequest, DownloadOutcome, ItemEvent};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    struct StubPipeline {
        attempts_before_success: u32,
        calls: AtomicU32,
        fatal: bool,
        log: Arc<AsyncMutex<Vec<String>>>,
    }

    #[async_trait]
    impl DownloadPipeline for StubPipeline {
        async fn run(&self, item: &DownloadItem, attempt: u32) -> Result<DownloadOutcome, PipelineError> {
            self.log
                .lock()
                .await
                .push(format!("{}{}", item.artist, item.title));
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(FatalDownloadError::new("nope").into());
            }
            if attempt < self.attempts_before_success {
                return Err(RetryableDownloadError::new("try again").into());
            }
            Ok(DownloadOutcome {
                final_path: PathBuf::from(format!("/music/{}.flac", item.item_id)),
                tags_written: true,
                bytes_written: 10,
                track_duration_seconds: Some(10.0),
                quality: Some("flac".into()),
                events: vec![ItemEvent::new("file.moved")],
            })
        }
    }

    fn test_config(worker_concurrency: usize) -> HdmConfig {
        let mut cfg = HdmConfig::default();
        cfg.worker_concurrency = worker_concurrency;
        cfg.retry_base_seconds = 0.001;
        cfg
    }

    fn item_request(artist: &str, title: &str) -> DownloadItemRequest {
        DownloadItemRequest {
            artist: artist.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_success_resolves_summary() {
        let pipeline = Arc::new(StubPipeline {
            attempts_before_success: 1,
            calls: AtomicU32::new(0),
            fatal: false,
            log: Arc::new(AsyncMutex::new(Vec::new())),
        });
        let orchestrator = HdmOrchestrator::new(
            test_config(1),
            DownloadBatchAggregator::new(),
            Arc::new(InMemoryIdempotencyStore::new()),
            pipeline,
        );
        orchestrator.start().await;

        let handle = orchestrator
            .submit_single(item_request("Artist", "Track"), "tester")
            .await
            .unwrap();
        let summary = handle.wait().await;

        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.totals.succeeded, 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn retryable_then_success_counts_one_retry() {
        let pipeline = Arc::new(StubPipeline {
            attempts_before_success: 2,
            calls: AtomicU32::new(0),
            fatal: false,
            log: Arc::new(AsyncMutex::new(Vec::new())),
        });
        let orchestrator = HdmOrchestrator::new(
            test_config(1),
            DownloadBatchAggregator::new(),
            Arc::new(InMemoryIdempotencyStore::new()),
            pipeline,
        );
        orchestrator.start().await;

        let handle = orchestrator
            .submit_single(item_request("Artist", "Track"), "tester")
            .await
            .unwrap();
        let summary = handle.wait().await;

        assert_eq!(summary.totals.retries, 1);
        assert_eq!(summary.items[0].attempts, 2);
        assert_eq!(summary.status, BatchStatus::Success);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn fatal_error_fails_without_retry() {
        let pipeline = Arc::new(StubPipeline {
            attempts_before_success: 1,
            calls: AtomicU32::new(0),
            fatal: true,
            log: Arc::new(AsyncMutex::new(Vec::new())),
        });
        let orchestrator = HdmOrchestrator::new(
            test_config(1),
            DownloadBatchAggregator::new(),
            Arc::new(InMemoryIdempotencyStore::new()),
            pipeline.clone(),
        );
        orchestrator.start().await;

        let handle = orchestrator
            .submit_single(item_request("Artist", "Track"), "tester")
            .await
            .unwrap();
        let summary = handle.wait().await;

        assert_eq!(summary.status, BatchStatus::Failure);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_dedupe_key_is_not_reprocessed() {
        let pipeline = Arc::new(StubPipeline {
            attempts_before_success: 1,
            calls: AtomicU32::new(0),
            fatal: false,
            log: Arc::new(AsyncMutex::new(Vec::new())),
        });
        let orchestrator = HdmOrchestrator::new(
            test_config(1),
            DownloadBatchAggregator::new(),
            Arc::new(InMemoryIdempotencyStore::new()),
            pipeline.clone(),
        );
        orchestrator.start().await;

        let mut request = DownloadItemRequest::default();
        request.artist = "Artist".into();
        request.title = "Track".into();
        request.dedupe_key = Some("fixed-key".into());

        let handle1 = orchestrator
            .submit_single(request.clone(), "tester")
            .await
            .unwrap();
        handle1.wait().await;

        let handle2 = orchestrator.submit_single(request, "tester").await.unwrap();
        let summary2 = handle2.wait().await;

        assert_eq!(summary2.totals.duplicates, 1);
        assert_eq!(summary2.items[0].error.as_deref(), Some("already_completed"));
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn cross_batch_fairness_preserved_through_orchestrator() {
        let log = Arc::new(AsyncMutex::new(Vec::new()));
        let pipeline = Arc::new(StubPipeline {
            attempts_before_success: 1,
            calls: AtomicU32::new(0),
            fatal: false,
            log: log.clone(),
        });
        let orchestrator = HdmOrchestrator::new(
            test_config(1),
            DownloadBatchAggregator::new(),
            Arc::new(InMemoryIdempotencyStore::new()),
            pipeline,
        );
        orchestrator.start().await;

        let batch_a = DownloadBatchRequest {
            batch_id: Some("A".into()),
            requested_by: "tester".into(),
            items: vec![
                item_request("A", "1"),
                item_request("A", "2"),
                item_request("A", "3"),
            ],
            dedupe_prefix: Some("A".into()),
            default_priority: 0,
        };
        let batch_b = DownloadBatchRequest {
            batch_id: Some("B".into()),
            requested_by: "tester".into(),
            items: vec![
                item_request("B", "1"),
                item_request("B", "2"),
                item_request("B", "3"),
            ],
            dedupe_prefix: Some("B".into()),
            default_priority: 0,
        };

        let handle_a = orchestrator.submit_batch(batch_a).await.unwrap();
        let handle_b = orchestrator.submit_batch(batch_b).await.unwrap();
        handle_a.wait().await;
        handle_b.wait().await;

        let order = log.lock().await;
        // spec.md §8 scenario 2, literal: worker_concurrency=1 interleaves the two
        // batches one item at a time rather than draining A before touching B.
        assert_eq!(*order, vec!["A1", "B1", "A2", "B2", "A3", "B3"]);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected_before_processing() {
        let pipeline = Arc::new(StubPipeline {
            attempts_before_success: 1,
            calls: AtomicU32::new(0),
            fatal: false,
            log: Arc::new(AsyncMutex::new(Vec::new())),
        });
        let mut cfg = test_config(1);
        cfg.batch_max_items = 1;
        let orchestrator = HdmOrchestrator::new(
            cfg,
            DownloadBatchAggregator::new(),
            Arc::new(InMemoryIdempotencyStore::new()),
            pipeline,
        );

        let request = DownloadBatchRequest {
            batch_id: None,
            requested_by: "tester".into(),
            items: vec![item_request("A", "1"), item_request("A", "2")],
            dedupe_prefix: None,
            default_priority: 0,
        };
        let err = orchestrator.submit_batch(request).await.unwrap_err();
        assert_eq!(
            err,
            ValidationError::TooManyItems { count: 2, max: 1 }
        );
    }
}
