//! Idempotency store: reserve/release dedupe keys across processes; remember
//! completions. Grounded in `original_source/app/hdm/idempotency.py` for the
//! in-memory variant and `original_source/tests/test_hdm_sqlite_idempotency.py` for the
//! durable variant's retry/transition semantics.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;
use tracing::warn;

use crate::retry::{with_retry, Retryable};

#[derive(Debug, Clone)]
pub struct IdempotencyReservation {
    pub acquired: bool,
    pub already_processed: bool,
    pub reason: Option<&'static str>,
}

impl IdempotencyReservation {
    fn acquired() -> Self {
        Self {
            acquired: true,
            already_processed: false,
            reason: None,
        }
    }

    fn already_completed() -> Self {
        Self {
            acquired: false,
            already_processed: true,
            reason: Some("already_completed"),
        }
    }

    fn in_progress() -> Self {
        Self {
            acquired: false,
            already_processed: false,
            reason: Some("in_progress"),
        }
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn reserve(&self, dedupe_key: &str) -> Result<IdempotencyReservation, sqlx::Error>;
    async fn release(&self, dedupe_key: &str, success: bool) -> Result<(), sqlx::Error>;
}

/// In-memory variant for tests and single-process deployments: a single lock guards
/// both sets, matching the Python original's single `asyncio.Lock`.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    state: StdMutex<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    in_progress: HashSet<String>,
    completed: HashSet<String>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn reserve(&self, dedupe_key: &str) -> Result<IdempotencyReservation, sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        if state.completed.contains(dedupe_key) {
            return Ok(IdempotencyReservation::already_completed());
        }
        if state.in_progress.contains(dedupe_key) {
            return Ok(IdempotencyReservation::in_progress());
        }
        state.in_progress.insert(dedupe_key.to_string());
        Ok(IdempotencyReservation::acquired())
    }

    async fn release(&self, dedupe_key: &str, success: bool) -> Result<(), sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        state.in_progress.remove(dedupe_key);
        if success {
            state.completed.insert(dedupe_key.to_string());
        }
        Ok(())
    }
}

struct BusyError(sqlx::Error);

impl Retryable for BusyError {
    fn is_retryable(&self) -> bool {
        matches!(&self.0, sqlx::Error::Database(db) if db.code().as_deref() == Some("5") || db.code().as_deref() == Some("6"))
    }
}

/// Durable, file-backed idempotency store, safe under concurrent processes. Table
/// `(dedupe_key PRIMARY KEY, status TEXT, attempts INT, updated_at TIMESTAMP)`.
pub struct SqliteIdempotencyStore {
    path: std::path::PathBuf,
    pool: Mutex<Option<SqlitePool>>,
    retry_base_seconds: f64,
    max_attempts: u32,
}

impl SqliteIdempotencyStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_retry_config(path, 0.05, 3)
    }

    pub fn with_retry_config(
        path: impl AsRef<Path>,
        retry_base_seconds: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            pool: Mutex::new(None),
            retry_base_seconds,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Open the pool lazily; retried on the next call if initialization fails, rather
    /// than failing permanently at construction time.
    async fn pool(&self) -> Result<SqlitePool, sqlx::Error> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let opts = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            self.path.to_string_lossy()
        ))?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_millis(50));
        let pool = SqlitePoolOptions::new().max_connections(4).connect_with(opts).await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS idempotency (
                dedupe_key TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }

    async fn reserve_once(&self, dedupe_key: &str) -> Result<IdempotencyReservation, sqlx::Error> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;
        let existing = sqlx::query("SELECT status, attempts FROM idempotency WHERE dedupe_key = ?")
            .bind(dedupe_key)
            .fetch_optional(&mut *tx)
            .await?;

        let reservation = match existing {
            Some(row) => {
                let status: String = row.get("status");
                if status == "completed" {
                    IdempotencyReservation::already_completed()
                } else {
                    IdempotencyReservation::in_progress()
                }
            }
            None => {
                sqlx::query(
                    "INSERT INTO idempotency (dedupe_key, status, attempts, updated_at) VALUES (?, 'in_progress', 1, ?)",
                )
                .bind(dedupe_key)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
                IdempotencyReservation::acquired()
            }
        };
        tx.commit().await?;
        Ok(reservation)
    }

    async fn release_once(&self, dedupe_key: &str, success: bool) -> Result<(), sqlx::Error> {
        let pool = self.pool().await?;
        if success {
            sqlx::query("UPDATE idempotency SET status = 'completed', updated_at = ? WHERE dedupe_key = ?")
                .bind(Utc::now().to_rfc3339())
                .bind(dedupe_key)
                .execute(&pool)
                .await?;
        } else {
            sqlx::query("DELETE FROM idempotency WHERE dedupe_key = ?")
                .bind(dedupe_key)
                .execute(&pool)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn reserve(&self, dedupe_key: &str) -> Result<IdempotencyReservation, sqlx::Error> {
        with_retry(self.max_attempts, self.retry_base_seconds, 0.2, || async {
            self.reserve_once(dedupe_key).await.map_err(BusyError)
        })
        .await
        .map_err(|e| {
            warn!(dedupe_key, "idempotency reserve failed after retries");
            e.0
        })
    }

    async fn release(&self, dedupe_key: &str, success: bool) -> Result<(), sqlx::Error> {
        with_retry(self.max_attempts, self.retry_base_seconds, 0.2, || async {
            self.release_once(dedupe_key, success).await.map_err(BusyError)
        })
        .await
        .map_err(|e| e.0)
    }
}
