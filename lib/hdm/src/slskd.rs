//! Remote Transfer Client: the Pipeline's view onto an external Soulseek-like peer
//! gateway (an slskd-style HTTP daemon). Generalized from
//! `soulbeet::slskd::client::SoulseekClient`'s `make_request`/`handle_response`
//! plumbing and its `poll_search` long-poll loop, narrowed to the
//! `enqueue`/`cancel`/`stream_download_events` contract this crate needs.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

use crate::config::SoulseekConfig;
use crate::error::GatewayError;
use crate::retry::{backoff_delay, Retryable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Accepted,
    InProgress,
    Completed,
    Failed,
}

/// A single status transition read from the gateway's transfer-status endpoint.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub download_id: Option<String>,
    pub status: TransferStatus,
    pub path: Option<String>,
    pub bytes_written: Option<u64>,
    pub retryable: Option<bool>,
    pub retry_after_seconds: Option<f64>,
    pub error_message: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub filename: String,
    pub size: u64,
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        GatewayError::is_retryable(self)
    }
}

/// The narrow contract the Pipeline consumes; implemented against slskd's HTTP API.
/// `enqueue`/`cancel` are used by the surrounding system that starts transfers, not by
/// the Pipeline itself — the Pipeline only follows an already-started transfer via
/// `stream_download_events`.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn enqueue(&self, username: &str, files: &[RemoteFile]) -> Result<String, GatewayError>;
    async fn cancel(&self, transfer_id: &str) -> Result<(), GatewayError>;

    /// Poll the gateway for `idempotency_key`'s status until it reaches a terminal
    /// state (`completed`/`failed`), invoking `on_event` for every observed transition.
    /// Polling is paced by `poll_interval`, mirroring the teacher's `poll_search` loop.
    async fn stream_download_events(
        &self,
        idempotency_key: &str,
        poll_interval: Duration,
        on_event: &mut (dyn FnMut(TransferEvent) + Send),
    ) -> Result<(), GatewayError>;
}

pub struct SlskdClient {
    http: Client,
    config: SoulseekConfig,
}

impl SlskdClient {
    pub fn new(config: SoulseekConfig) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .expect("reqwest client builds with static configuration");
        Self { http, config }
    }

    fn url(&self, path: &str) -> Result<url::Url, GatewayError> {
        let base = url::Url::parse(&self.config.base_url)?;
        base.join(path).map_err(GatewayError::from)
    }

    async fn make_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, GatewayError> {
        let mut attempt = 1;
        let mut rng = rand::rng();
        loop {
            let url = self.url(path)?;
            let mut request = self.http.request(method.clone(), url);
            if let Some(key) = &self.config.api_key {
                request = request.header("X-API-Key", key);
            }
            if let Some(body) = body {
                request = request.json(body);
            }
            let result = request.send().await.map_err(GatewayError::from);
            match result {
                Ok(response) => return self.handle_response(response).await,
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = backoff_delay(
                        self.config.backoff_base_ms as f64 / 1000.0,
                        attempt,
                        self.config.jitter_pct,
                        &mut rng,
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            response.json::<T>().await.map_err(GatewayError::from)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<no response body>".to_string());
            Err(GatewayError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn fetch_status(&self, idempotency_key: &str) -> Result<Value, GatewayError> {
        self.make_request(
            Method::GET,
            &format!("api/v0/transfers/{idempotency_key}"),
            None,
        )
        .await
    }
}

#[async_trait]
impl TransferClient for SlskdClient {
    async fn enqueue(&self, username: &str, files: &[RemoteFile]) -> Result<String, GatewayError> {
        let body = serde_json::json!({
            "username": username,
            "files": files.iter().map(|f| serde_json::json!({
                "filename": f.filename,
                "size": f.size,
            })).collect::<Vec<_>>(),
        });
        let response: Value = self
            .make_request(Method::POST, "api/v0/transfers/downloads", Some(&body))
            .await?;
        response
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Api {
                status: 0,
                message: "enqueue response missing transfer id".to_string(),
            })
    }

    async fn cancel(&self, transfer_id: &str) -> Result<(), GatewayError> {
        let _: Value = self
            .make_request(
                Method::DELETE,
                &format!("api/v0/transfers/downloads/{transfer_id}"),
                None,
            )
            .await
            .or_else(|e| match &e {
                GatewayError::Api { status, .. } if *status == StatusCode::NOT_FOUND.as_u16() => {
                    Ok(Value::Null)
                }
                _ => Err(e),
            })?;
        Ok(())
    }

    async fn stream_download_events(
        &self,
        idempotency_key: &str,
        poll_interval: Duration,
        on_event: &mut (dyn FnMut(TransferEvent) + Send),
    ) -> Result<(), GatewayError> {
        let mut last_status: Option<TransferStatus> = None;
        loop {
            let payload = self.fetch_status(idempotency_key).await?;
            let event = parse_transfer_event(&payload);
            let is_terminal = matches!(event.status, TransferStatus::Completed | TransferStatus::Failed);
            if last_status != Some(event.status) || is_terminal {
                last_status = Some(event.status);
                on_event(event.clone());
            }
            match event.status {
                TransferStatus::Completed => return Ok(()),
                TransferStatus::Failed => {
                    return Err(GatewayError::Api {
                        status: 0,
                        message: event.error_message.unwrap_or_else(|| "transfer failed".to_string()),
                    })
                }
                _ => tokio::time::sleep(poll_interval).await,
            }
        }
    }
}

fn parse_transfer_event(payload: &Value) -> TransferEvent {
    let state = payload
        .get("state")
        .or_else(|| payload.get("status"))
        .and_then(Value::as_str)
        .unwrap_or("in_progress");
    let status = match state.to_lowercase().as_str() {
        "accepted" | "queued" | "requested" => TransferStatus::Accepted,
        "completed" | "succeeded" => TransferStatus::Completed,
        "failed" | "errored" | "cancelled" | "rejected" => TransferStatus::Failed,
        _ => TransferStatus::InProgress,
    };
    let retry_after_seconds = payload
        .get("retry_after_seconds")
        .and_then(Value::as_f64)
        .or_else(|| {
            payload
                .get("retry_after_ms")
                .and_then(Value::as_f64)
                .map(|ms| ms / 1000.0)
        });

    TransferEvent {
        download_id: payload.get("id").and_then(Value::as_str).map(str::to_string),
        status,
        path: payload.get("path").and_then(Value::as_str).map(str::to_string),
        bytes_written: payload.get("bytes_written").and_then(Value::as_u64),
        retryable: payload.get("retryable").and_then(Value::as_bool),
        retry_after_seconds,
        error_message: payload.get("error").and_then(Value::as_str).map(str::to_string),
        payload: payload.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_completed_event_with_path() {
        let payload = serde_json::json!({
            "id": "abc",
            "state": "Completed",
            "path": "/downloads/track.flac",
            "bytes_written": 1024,
        });
        let event = parse_transfer_event(&payload);
        assert_eq!(event.status, TransferStatus::Completed);
        assert_eq!(event.path.as_deref(), Some("/downloads/track.flac"));
        assert_eq!(event.bytes_written, Some(1024));
    }

    #[test]
    fn parses_failed_event_with_retry_hint() {
        let payload = serde_json::json!({
            "state": "failed",
            "retryable": true,
            "retry_after_ms": 2000,
            "error": "peer disconnected",
        });
        let event = parse_transfer_event(&payload);
        assert_eq!(event.status, TransferStatus::Failed);
        assert_eq!(event.retryable, Some(true));
        assert_eq!(event.retry_after_seconds, Some(2.0));
    }

    #[test]
    fn unknown_state_defaults_to_in_progress() {
        let payload = serde_json::json!({ "state": "queued_for_peer" });
        assert_eq!(parse_transfer_event(&payload).status, TransferStatus::Accepted);
        let payload = serde_json::json!({ "state": "transferring" });
        assert_eq!(parse_transfer_event(&payload).status, TransferStatus::InProgress);
    }
}
