//! Durable storage for derived campaign metrics: the repository capability,
//! its Postgres and in-memory backends, and the retry policy wrapped around writes.

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use cpa_core::MetricRecord;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cpa-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Connectivity loss, pool exhaustion and lock/serialization conflicts are worth another attempt.
pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => RetryDisposition::Retryable,
        sqlx::Error::Database(db_err) => match db_err.code() {
            Some(code) if is_transient_sqlstate(&code) => RetryDisposition::Retryable,
            _ => RetryDisposition::NonRetryable,
        },
        _ => RetryDisposition::NonRetryable,
    }
}

fn is_transient_sqlstate(code: &str) -> bool {
    // class 08: connection exception
    code.starts_with("08")
        || matches!(
            code,
            "40001" | "40P01" | "55P03" | "53300" | "57P01" | "57P02" | "57P03"
        )
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("storage failure: {0}")]
    Permanent(String),
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: usize,
        #[source]
        source: Box<RepositoryError>,
    },
}

impl RepositoryError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Database(err) => classify_sqlx_error(err),
            Self::Transient(_) => RetryDisposition::Retryable,
            Self::Permanent(_) | Self::RetriesExhausted { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Fixed-delay retry wrapped explicitly around a storage call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it succeeds, fails non-retryably, or `max_attempts` is reached.
    /// The delay is awaited inline; there is no cancellation between attempts.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RepositoryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RepositoryError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.disposition() == RetryDisposition::Retryable => {
                    if attempt >= max_attempts {
                        return Err(RepositoryError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: Box::new(err),
                        });
                    }
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(self.delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient storage failure, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Per-date completion marker written in the same transaction as the rows it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchMarker {
    pub date: NaiveDate,
    pub record_count: usize,
    pub content_sha256: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub records: usize,
    pub batches: Vec<BatchMarker>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Groups records by date and digests each group independent of input order.
pub fn batch_markers(records: &[MetricRecord]) -> Vec<BatchMarker> {
    let mut by_date: BTreeMap<NaiveDate, Vec<&MetricRecord>> = BTreeMap::new();
    for record in records {
        by_date.entry(record.date).or_default().push(record);
    }

    by_date
        .into_iter()
        .map(|(date, mut rows)| {
            rows.sort_by(|a, b| a.campaign_id.cmp(&b.campaign_id));
            let canonical = rows
                .iter()
                .map(|r| {
                    let cpa = r.cpa.map(|v| v.to_string()).unwrap_or_default();
                    format!("{}|{}|{}|{}|{}\n", r.date, r.campaign_id, r.spend, r.conversions, cpa)
                })
                .collect::<String>();
            BatchMarker {
                date,
                record_count: rows.len(),
                content_sha256: sha256_hex(canonical.as_bytes()),
            }
        })
        .collect()
}

/// Idempotency gate plus durable write. Any backend implementing both satisfies the pipeline.
#[async_trait]
pub trait Repository: Send + Sync {
    /// True when at least one row for `date` is durably stored.
    async fn exists(&self, date: NaiveDate) -> Result<bool, RepositoryError>;

    /// Insert-or-overwrite keyed on (date, campaign_id). Re-applying identical rows is a no-op in effect.
    async fn upsert(&self, records: &[MetricRecord]) -> Result<UpsertReport, RepositoryError>;
}

const SCHEMA_DDL: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS daily_stats (
        date DATE NOT NULL,
        campaign_id TEXT NOT NULL,
        spend DOUBLE PRECISION NOT NULL,
        conversions BIGINT NOT NULL,
        cpa DOUBLE PRECISION,
        PRIMARY KEY (date, campaign_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS daily_stats_batches (
        date DATE PRIMARY KEY,
        record_count BIGINT NOT NULL,
        content_sha256 TEXT NOT NULL,
        completed_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, creating the tables if they are missing.
    pub async fn from_pool(pool: PgPool) -> Result<Self, RepositoryError> {
        let repo = Self { pool };
        repo.ensure_schema().await?;
        Ok(repo)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> Result<(), RepositoryError> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn exists(&self, date: NaiveDate) -> Result<bool, RepositoryError> {
        let found: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM daily_stats WHERE date = $1)")
                .bind(date)
                .fetch_one(&self.pool)
                .await?;
        Ok(found)
    }

    async fn upsert(&self, records: &[MetricRecord]) -> Result<UpsertReport, RepositoryError> {
        if records.is_empty() {
            return Ok(UpsertReport::default());
        }
        let batches = batch_markers(records);

        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                r#"
                INSERT INTO daily_stats (date, campaign_id, spend, conversions, cpa)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (date, campaign_id) DO UPDATE SET
                    spend = EXCLUDED.spend,
                    conversions = EXCLUDED.conversions,
                    cpa = EXCLUDED.cpa
                "#,
            )
            .bind(record.date)
            .bind(&record.campaign_id)
            .bind(record.spend)
            .bind(i64::from(record.conversions))
            .bind(record.cpa)
            .execute(&mut *tx)
            .await?;
        }
        for batch in &batches {
            sqlx::query(
                r#"
                INSERT INTO daily_stats_batches (date, record_count, content_sha256, completed_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (date) DO UPDATE SET
                    record_count = EXCLUDED.record_count,
                    content_sha256 = EXCLUDED.content_sha256,
                    completed_at = EXCLUDED.completed_at
                "#,
            )
            .bind(batch.date)
            .bind(i64::try_from(batch.record_count).unwrap_or(i64::MAX))
            .bind(&batch.content_sha256)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(records = records.len(), dates = batches.len(), "upserted daily_stats rows");
        Ok(UpsertReport {
            records: records.len(),
            batches,
        })
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    rows: BTreeMap<(NaiveDate, String), MetricRecord>,
    batches: BTreeMap<NaiveDate, BatchMarker>,
    injected_failures: VecDeque<RepositoryError>,
}

/// Process-local backend for dry runs and tests. Queued failures are returned by
/// upcoming `upsert` calls before any row is touched.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<InMemoryState>,
    exists_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = MetricRecord>) -> Self {
        let mut state = InMemoryState::default();
        for record in records {
            state
                .rows
                .insert((record.date, record.campaign_id.clone()), record);
        }
        Self {
            state: Mutex::new(state),
            ..Self::default()
        }
    }

    pub async fn push_upsert_failure(&self, err: RepositoryError) {
        self.state.lock().await.injected_failures.push_back(err);
    }

    pub async fn records(&self) -> Vec<MetricRecord> {
        self.state.lock().await.rows.values().cloned().collect()
    }

    pub async fn batch(&self, date: NaiveDate) -> Option<BatchMarker> {
        self.state.lock().await.batches.get(&date).cloned()
    }

    pub fn exists_calls(&self) -> usize {
        self.exists_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn exists(&self, date: NaiveDate) -> Result<bool, RepositoryError> {
        self.exists_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().await;
        Ok(state.rows.keys().any(|(row_date, _)| *row_date == date))
    }

    async fn upsert(&self, records: &[MetricRecord]) -> Result<UpsertReport, RepositoryError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().await;
        if let Some(err) = state.injected_failures.pop_front() {
            return Err(err);
        }

        let batches = batch_markers(records);
        for record in records {
            state
                .rows
                .insert((record.date, record.campaign_id.clone()), record.clone());
        }
        for batch in &batches {
            state.batches.insert(batch.date, batch.clone());
        }
        Ok(UpsertReport {
            records: records.len(),
            batches,
        })
    }
}
