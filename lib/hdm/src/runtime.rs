//! Assembles every collaborator (sidecars, event bus, tagger, mover, dedupe manager,
//! transfer client, pipeline, idempotency store, orchestrator, recovery) into a ready
//! `HdmRuntime`. Grounded in `original_source/app/hdm/runtime.py`'s `build_hdm_runtime`.

use std::sync::Arc;

use crate::aggregator::DownloadBatchAggregator;
use crate::completion::{CompletionEventBus, DownloadCompletionMonitor};
use crate::config::{HdmConfig, SoulseekConfig};
use crate::dedupe::{DedupeManager, MoveTemplate};
use crate::error::HdmError;
use crate::idempotency::{IdempotencyStore, SqliteIdempotencyStore};
use crate::mover::AtomicFileMover;
use crate::orchestrator::HdmOrchestrator;
use crate::recovery::HdmRecovery;
use crate::sidecar::SidecarStore;
use crate::slskd::{SlskdClient, TransferClient};
use crate::tagging::AudioTagger;
use crate::pipeline::{DefaultDownloadPipeline, DownloadPipeline};

/// Everything needed to submit batches and recover from a prior process's crash. Drop
/// order does not matter: every collaborator is reference-counted.
pub struct HdmRuntime {
    pub orchestrator: Arc<HdmOrchestrator>,
    pub recovery: Arc<HdmRecovery>,
}

/// Build the full orchestrator runtime from configuration. Wires the directory layout
/// (`downloads_dir`, `music_dir`, `state_dir` — defaulting to `downloads_dir/.harmony`,
/// see [`HdmConfig::state_dir`] — and its `sidecars/` and `locks/` subdirectories), the
/// durable SQLite-backed idempotency store (an intentional strengthening over the
/// in-memory default the Python original wires — see DESIGN.md), and the default
/// Soulseek-gateway-backed pipeline.
pub async fn build_hdm_runtime(
    config: HdmConfig,
    soulseek: SoulseekConfig,
) -> Result<HdmRuntime, HdmError> {
    config.validate()?;

    let state_dir = config.state_dir();
    tokio::fs::create_dir_all(&state_dir).await?;

    let sidecars = Arc::new(SidecarStore::new(state_dir.join("sidecars")));
    sidecars.ensure_dir().await?;

    let template = MoveTemplate::compile(&config.move_template)?;
    let dedupe = Arc::new(DedupeManager::new(
        config.music_dir.clone(),
        state_dir.clone(),
        template,
    ));

    let bus = CompletionEventBus::new();
    let completion = Arc::new(DownloadCompletionMonitor::new(
        config.downloads_dir.clone(),
        config.size_stable_seconds,
        config.poll_interval,
        bus.clone(),
    ));

    let transfer: Arc<dyn TransferClient> = Arc::new(SlskdClient::new(soulseek));
    let tagger = Arc::new(AudioTagger::new());
    let mover = Arc::new(AtomicFileMover::new());

    let pipeline: Arc<dyn DownloadPipeline> = Arc::new(DefaultDownloadPipeline::new(
        config.clone(),
        dedupe.clone(),
        sidecars.clone(),
        completion,
        transfer,
        tagger,
        mover,
    ));

    let idempotency: Arc<dyn IdempotencyStore> =
        Arc::new(SqliteIdempotencyStore::new(state_dir.join("idempotency.db")));

    let aggregator = DownloadBatchAggregator::new();
    let orchestrator = HdmOrchestrator::new(config.clone(), aggregator, idempotency, pipeline);

    let recovery = Arc::new(HdmRecovery::new(
        sidecars,
        dedupe,
        bus,
        config.size_stable_seconds,
        config.poll_interval,
    ));

    Ok(HdmRuntime {
        orchestrator,
        recovery,
    })
}
