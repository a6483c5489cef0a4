//! Batch aggregator: per-batch totals, per-item results, duration percentiles, and the
//! batch completion future. Grounded in
//! `original_source/tests/orchestrator/download_flow/test_aggregation_metrics.py`.

use itertools::Itertools;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::model::{
    BatchStatus, BatchSummary, BatchTotals, DownloadOutcome, DurationStats, ItemEvent, ItemResult,
    ItemState,
};

/// Owned by the Aggregator; mutated only through its `record_*` methods.
pub struct BatchState {
    pub batch_id: String,
    pub requested_by: String,
    pub total_items: usize,
    items: HashMap<String, ItemResult>,
    totals: BatchTotals,
    samples: Vec<f64>,
    completion: Option<oneshot::Sender<BatchSummary>>,
}

impl BatchState {
    fn remaining(&self) -> usize {
        self.totals.queued + self.totals.running
    }

    /// Decrement whichever bucket (`queued` or `running`) the item is currently counted
    /// in, based on its *current* recorded state, before moving it to a terminal state.
    /// A duplicate may never have passed through `record_running` (still `queued`), while
    /// a success/failure always has (`running`) — reading the actual state instead of
    /// assuming one keeps the two counters in sync with `items` regardless of which path
    /// got the item here.
    fn decrement_pending(&mut self, item_id: &str) {
        match self.items.get(item_id).map(|item| item.state) {
            Some(ItemState::Queued) => self.totals.queued = self.totals.queued.saturating_sub(1),
            Some(ItemState::Running) => self.totals.running = self.totals.running.saturating_sub(1),
            _ => {}
        }
    }
}

/// A handle returned to the caller of `submit_batch`/`submit_single`.
pub struct BatchHandle {
    pub batch_id: String,
    pub items_total: usize,
    pub requested_by: String,
    receiver: oneshot::Receiver<BatchSummary>,
}

impl BatchHandle {
    /// Await the batch's final summary. Resolves once every item has reached a
    /// terminal state (`done`, `failed`, or `duplicate`).
    pub async fn wait(self) -> BatchSummary {
        self.receiver
            .await
            .expect("aggregator always resolves the completion future before dropping the sender")
    }
}

/// Per-batch state under a mutex; per-item results indexed by `item_id`.
#[derive(Default)]
pub struct DownloadBatchAggregator {
    batches: Mutex<HashMap<String, BatchState>>,
}

impl DownloadBatchAggregator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new batch with `total` items, all initially `queued`. Returns the
    /// handle the caller awaits and registers the `item_id`s with the aggregator.
    pub async fn create_batch(
        &self,
        batch_id: impl Into<String>,
        requested_by: impl Into<String>,
        item_ids: &[String],
    ) -> BatchHandle {
        let batch_id = batch_id.into();
        let requested_by = requested_by.into();
        let total_items = item_ids.len();
        let (tx, rx) = oneshot::channel();

        let mut items = HashMap::with_capacity(total_items);
        for item_id in item_ids {
            items.insert(item_id.clone(), ItemResult::queued(item_id.clone()));
        }

        let mut totals = BatchTotals::default();
        totals.queued = total_items;

        let state = BatchState {
            batch_id: batch_id.clone(),
            requested_by: requested_by.clone(),
            total_items,
            items,
            totals,
            samples: Vec::new(),
            completion: Some(tx),
        };

        let mut batches = self.batches.lock().await;
        batches.insert(batch_id.clone(), state);

        BatchHandle {
            batch_id,
            items_total: total_items,
            requested_by,
            receiver: rx,
        }
    }

    /// Mark an item `running`, moving it out of `queued`.
    pub async fn record_running(&self, batch_id: &str, item_id: &str) {
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(batch_id) {
            if let Some(item) = batch.items.get_mut(item_id) {
                item.state = ItemState::Running;
            }
            batch.totals.queued = batch.totals.queued.saturating_sub(1);
            batch.totals.running += 1;
        }
    }

    pub async fn record_success(
        &self,
        batch_id: &str,
        item_id: &str,
        outcome: DownloadOutcome,
        attempts: u32,
        processing_seconds: f64,
    ) {
        let mut batches = self.batches.lock().await;
        let Some(batch) = batches.get_mut(batch_id) else {
            return;
        };
        batch.decrement_pending(item_id);
        if let Some(item) = batch.items.get_mut(item_id) {
            item.state = ItemState::Done;
            item.attempts = attempts;
            item.final_path = Some(outcome.final_path);
            item.tags_written = outcome.tags_written;
            item.bytes_written = outcome.bytes_written;
            item.duration_seconds = outcome.track_duration_seconds;
            item.quality = outcome.quality;
            item.events = outcome.events.clone();
        }
        batch.totals.succeeded += 1;
        batch.samples.push(processing_seconds);

        metrics::counter!("item_outcomes_total", "state" => "done").increment(1);
        metrics::histogram!("processing_seconds").record(processing_seconds);
        for (phase, seconds) in phase_durations(&outcome.events) {
            metrics::histogram!("phase_duration_seconds", "phase" => phase).record(seconds);
        }

        self.resolve_if_done(batch);
    }

    pub async fn record_failure(
        &self,
        batch_id: &str,
        item_id: &str,
        attempts: u32,
        error: impl Into<String>,
        processing_seconds: f64,
    ) {
        let error = error.into();
        let error_type = error_type_of(&error);
        let mut batches = self.batches.lock().await;
        let Some(batch) = batches.get_mut(batch_id) else {
            return;
        };
        batch.decrement_pending(item_id);
        if let Some(item) = batch.items.get_mut(item_id) {
            item.state = ItemState::Failed;
            item.attempts = attempts;
            item.error = Some(error);
        }
        batch.totals.failed += 1;
        batch.samples.push(processing_seconds);

        metrics::counter!("item_outcomes_total", "state" => "failed").increment(1);
        metrics::counter!("item_failures_total", "error_type" => error_type).increment(1);
        metrics::histogram!("processing_seconds").record(processing_seconds);

        self.resolve_if_done(batch);
    }

    pub async fn record_retry(
        &self,
        batch_id: &str,
        _item_id: &str,
        _attempt: u32,
        error: impl Into<String>,
        _retry_after: Option<std::time::Duration>,
    ) {
        let error = error.into();
        let error_type = error_type_of(&error);
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(batch_id) {
            batch.totals.retries += 1;
        }
        metrics::counter!("item_retries_total", "error_type" => error_type).increment(1);
    }

    pub async fn record_duplicate(
        &self,
        batch_id: &str,
        item_id: &str,
        reason: &str,
        already_processed: bool,
    ) {
        let mut batches = self.batches.lock().await;
        let Some(batch) = batches.get_mut(batch_id) else {
            return;
        };
        batch.decrement_pending(item_id);
        if let Some(item) = batch.items.get_mut(item_id) {
            item.state = ItemState::Duplicate;
            item.error = Some(reason.to_string());
        }
        batch.totals.duplicates += 1;
        batch.totals.dedupe_hits += 1;

        metrics::counter!("item_outcomes_total", "state" => "duplicate").increment(1);
        metrics::counter!("duplicates_total", "already_processed" => already_processed.to_string())
            .increment(1);
        metrics::counter!("dedupe_hits_total").increment(1);

        self.resolve_if_done(batch);
    }

    fn resolve_if_done(&self, batch: &mut BatchState) {
        if batch.remaining() > 0 {
            return;
        }
        let Some(sender) = batch.completion.take() else {
            return;
        };
        let status = if batch.totals.succeeded == 0 && batch.totals.failed > 0 {
            BatchStatus::Failure
        } else if batch.totals.failed > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::Success
        };
        let mut items: Vec<ItemResult> = batch.items.values().cloned().collect();
        items.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        let summary = BatchSummary {
            batch_id: batch.batch_id.clone(),
            status,
            totals: batch.totals.clone(),
            items,
            durations: DurationStats::compute(&batch.samples),
        };
        let _ = sender.send(summary);
    }
}

/// Class name portion of an `"Class: message"`-shaped error string, for metric labels.
fn error_type_of(error: &str) -> String {
    error
        .split(':')
        .next()
        .unwrap_or("Unknown")
        .trim()
        .to_string()
}

/// Compute `download`/`tagging`/`moving` phase durations from an ordered event list, by
/// pairing each named boundary event with its immediately preceding event.
fn phase_durations(events: &[ItemEvent]) -> Vec<(&'static str, f64)> {
    events
        .iter()
        .tuple_windows()
        .filter_map(|(previous, event)| {
            let phase = match event.name.as_str() {
                "download.completed" | "download.detected" => "download",
                "tagging.completed" | "tagging.skipped" => "tagging",
                "file.moved" => "moving",
                _ => return None,
            };
            let seconds = (event.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
            Some((phase, seconds.max(0.0)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn outcome() -> DownloadOutcome {
        DownloadOutcome {
            final_path: PathBuf::from("/music/a.flac"),
            tags_written: true,
            bytes_written: 100,
            track_duration_seconds: Some(180.0),
            quality: Some("flac".to_string()),
            events: vec![ItemEvent::new("file.moved")],
        }
    }

    #[tokio::test]
    async fn resolves_summary_once_all_items_terminal() {
        let aggregator = DownloadBatchAggregator::new();
        let handle = aggregator
            .create_batch("b1", "tester", &["i1".to_string(), "i2".to_string()])
            .await;
        aggregator.record_running("b1", "i1").await;
        aggregator.record_running("b1", "i2").await;
        aggregator
            .record_success("b1", "i1", outcome(), 1, 0.5)
            .await;
        aggregator
            .record_failure("b1", "i2", 3, "FatalDownloadError: nope", 0.2)
            .await;

        let summary = handle.wait().await;
        assert_eq!(summary.status, BatchStatus::Partial);
        assert_eq!(summary.totals.succeeded, 1);
        assert_eq!(summary.totals.failed, 1);
        assert_eq!(summary.items.len(), 2);
    }

    #[tokio::test]
    async fn all_success_yields_success_status() {
        let aggregator = DownloadBatchAggregator::new();
        let handle = aggregator
            .create_batch("b2", "tester", &["i1".to_string()])
            .await;
        aggregator.record_running("b2", "i1").await;
        aggregator
            .record_success("b2", "i1", outcome(), 1, 0.1)
            .await;
        assert_eq!(handle.wait().await.status, BatchStatus::Success);
    }

    #[tokio::test]
    async fn duplicate_after_success_counts_without_failure() {
        let aggregator = DownloadBatchAggregator::new();
        let handle = aggregator
            .create_batch("b3", "tester", &["i1".to_string()])
            .await;
        aggregator
            .record_duplicate("b3", "i1", "already_completed", true)
            .await;
        let summary = handle.wait().await;
        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.totals.duplicates, 1);
        assert_eq!(summary.totals.dedupe_hits, 1);
    }

    #[tokio::test]
    async fn duplicate_after_record_running_still_resolves_the_batch() {
        // Mirrors the sequence `HdmOrchestrator::process_item_inner` actually drives:
        // the worker marks the item `running` before it learns the idempotency
        // reservation was rejected. `totals.running`, not `totals.queued`, must be the
        // bucket that gets decremented here, or `remaining()` never reaches zero and
        // `BatchHandle::wait()` hangs forever.
        let aggregator = DownloadBatchAggregator::new();
        let handle = aggregator
            .create_batch("b4", "tester", &["i1".to_string()])
            .await;
        aggregator.record_running("b4", "i1").await;
        aggregator
            .record_duplicate("b4", "i1", "in_progress", false)
            .await;
        let summary = tokio::time::timeout(std::time::Duration::from_secs(1), handle.wait())
            .await
            .expect("batch must resolve once its only item goes duplicate after running");
        assert_eq!(summary.status, BatchStatus::Success);
        assert_eq!(summary.totals.duplicates, 1);
        assert_eq!(summary.totals.running, 0);
        assert_eq!(summary.totals.queued, 0);
    }

    #[test]
    fn error_type_extracts_class_name() {
        assert_eq!(
            error_type_of("RetryableDownloadError: peer timed out"),
            "RetryableDownloadError"
        );
        assert_eq!(error_type_of("no colon here"), "no colon here");
    }
}
