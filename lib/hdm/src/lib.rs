//! Harmony Download Manager (HDM) orchestrator core: a fair multi-batch scheduler
//! feeding a bounded worker pool, a per-item pipeline driving a remote transfer to
//! completion with tagging/dedupe/atomic move, an idempotency store, crash recovery,
//! and a batch aggregator. See `SPEC_FULL.md` for the full design.

pub mod aggregator;
pub mod completion;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod idempotency;
pub mod logging;
pub mod model;
pub mod mover;
pub mod orchestrator;
pub mod pipeline;
pub mod recovery;
pub mod retry;
pub mod runtime;
pub mod scheduler;
pub mod sidecar;
pub mod slskd;
pub mod tagging;

pub use aggregator::{BatchHandle, DownloadBatchAggregator};
pub use config::{HdmConfig, SoulseekConfig};
pub use error::HdmError;
pub use logging::init_tracing;
pub use model::{DownloadBatchRequest, DownloadItem, DownloadItemRequest};
pub use orchestrator::HdmOrchestrator;
pub use runtime::{build_hdm_runtime, HdmRuntime};
