use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for the orchestrator core. Field names mirror the environment
/// variables read by [`HdmConfig::from_env`].
#[derive(Debug, Clone)]
pub struct HdmConfig {
    pub worker_concurrency: usize,
    pub max_retries: u32,
    pub batch_max_items: usize,
    pub retry_base_seconds: f64,
    pub retry_jitter_pct: f64,
    pub size_stable_seconds: u64,
    pub poll_interval: Duration,
    pub move_template: String,
    pub downloads_dir: PathBuf,
    pub music_dir: PathBuf,
    pub state_dir_override: Option<PathBuf>,
}

impl Default for HdmConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 4,
            max_retries: 3,
            batch_max_items: 200,
            retry_base_seconds: 0.5,
            retry_jitter_pct: 0.2,
            size_stable_seconds: 3,
            poll_interval: Duration::from_secs_f64(1.0),
            move_template: "{artist}/{album}/{title}.{extension}".to_string(),
            downloads_dir: PathBuf::from("./downloads"),
            music_dir: PathBuf::from("./music"),
            state_dir_override: None,
        }
    }
}

impl HdmConfig {
    /// `state_dir`, defaulting to `downloads_dir/.harmony` per spec.md §6 unless an
    /// explicit override was configured.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir_override
            .clone()
            .unwrap_or_else(|| self.downloads_dir.join(".harmony"))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_concurrency == 0 {
            return Err(ConfigError::InvalidWorkerConcurrency);
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries);
        }
        if self.batch_max_items == 0 {
            return Err(ConfigError::InvalidBatchMaxItems);
        }
        if self.size_stable_seconds < 1 {
            return Err(ConfigError::InvalidSizeStableSeconds);
        }
        if self.poll_interval < Duration::from_secs_f64(0.25) {
            return Err(ConfigError::InvalidPollInterval);
        }
        Ok(())
    }

    /// Build from a map of environment-style key/value pairs (e.g. `std::env::vars()`
    /// collected into a `HashMap`, or an explicit map in tests).
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = env.get("HDM_WORKER_CONCURRENCY") {
            cfg.worker_concurrency = parse(v, "HDM_WORKER_CONCURRENCY")?;
        }
        if let Some(v) = env.get("HDM_MAX_RETRIES") {
            cfg.max_retries = parse(v, "HDM_MAX_RETRIES")?;
        }
        if let Some(v) = env.get("HDM_BATCH_MAX_ITEMS") {
            cfg.batch_max_items = parse(v, "HDM_BATCH_MAX_ITEMS")?;
        }
        if let Some(v) = env.get("HDM_RETRY_BASE_SECONDS") {
            cfg.retry_base_seconds = parse(v, "HDM_RETRY_BASE_SECONDS")?;
        }
        if let Some(v) = env.get("HDM_RETRY_JITTER_PCT") {
            cfg.retry_jitter_pct = parse(v, "HDM_RETRY_JITTER_PCT")?;
        }
        if let Some(v) = env.get("HDM_SIZE_STABLE_SECONDS") {
            cfg.size_stable_seconds = parse(v, "HDM_SIZE_STABLE_SECONDS")?;
        }
        if let Some(v) = env.get("HDM_POLL_INTERVAL_SECONDS") {
            let secs: f64 = parse(v, "HDM_POLL_INTERVAL_SECONDS")?;
            cfg.poll_interval = Duration::from_secs_f64(secs);
        }
        if let Some(v) = env.get("HDM_MOVE_TEMPLATE") {
            cfg.move_template = v.clone();
        }
        if let Some(v) = env.get("HDM_DOWNLOADS_DIR") {
            cfg.downloads_dir = PathBuf::from(v);
        }
        if let Some(v) = env.get("HDM_MUSIC_DIR") {
            cfg.music_dir = PathBuf::from(v);
        }
        if let Some(v) = env.get("HDM_STATE_DIR") {
            cfg.state_dir_override = Some(PathBuf::from(v));
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Configuration for the remote (Soulseek-style) transfer gateway client.
#[derive(Debug, Clone)]
pub struct SoulseekConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub jitter_pct: f64,
}

impl Default for SoulseekConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5030".to_string(),
            api_key: None,
            timeout_ms: 30_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            jitter_pct: 0.2,
        }
    }
}

impl SoulseekConfig {
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(v) = env.get("SLSKD_BASE_URL") {
            cfg.base_url = v.clone();
        }
        if let Some(v) = env.get("SLSKD_API_KEY") {
            cfg.api_key = Some(v.clone());
        }
        if let Some(v) = env.get("SLSKD_TIMEOUT_SEC") {
            let secs: f64 = parse(v, "SLSKD_TIMEOUT_SEC")?;
            cfg.timeout_ms = (secs * 1000.0) as u64;
        }
        if let Some(v) = env.get("SLSKD_MAX_RETRIES") {
            cfg.max_attempts = parse::<u32>(v, "SLSKD_MAX_RETRIES")?.max(1);
        }
        if let Some(v) = env.get("SLSKD_BACKOFF_BASE_MS") {
            cfg.backoff_base_ms = parse(v, "SLSKD_BACKOFF_BASE_MS")?;
        }
        if let Some(v) = env.get("SLSKD_JITTER_PCT") {
            cfg.jitter_pct = parse(v, "SLSKD_JITTER_PCT")?;
        }
        Ok(cfg)
    }
}

fn parse<T: std::str::FromStr>(value: &str, name: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Other(format!("invalid value for {name}: '{value}'")))
}
