// SQLite-backed request store
// Durable storage for production; shares the lifecycle rules with the in-memory store

//! # SQLite Storage
//!
//! `SqliteRequestStore` keeps each record as a JSON document in a `requests`
//! table. Mode, status and processing time are also kept as columns so
//! listing and statistics can be answered in SQL.
//!
//! Updates read the stored record, run `RequestRecord::apply` and
//! `check_invariants`, then write it back inside one transaction. Writers are
//! additionally serialized in-process so two updates never both hold a read
//! lock while waiting to write.
//!
//! ## Rust Learning Notes:
//!
//! Queries use the runtime `sqlx::query` API rather than the `query!` macros,
//! so building the crate never needs a live database.

use anyhow::Context;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::{collections::HashMap, str::FromStr};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use super::storage::{RequestStore, StoreStats};
use crate::models::{RecordUpdate, RequestMode, RequestRecord, RequestStatus};
use crate::{Result, ServiceError};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS requests (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    mode TEXT NOT NULL,
    status TEXT NOT NULL,
    processing_time_ms REAL,
    record TEXT NOT NULL
)";

const MODE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_requests_mode ON requests (mode, seq)";

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> ServiceError {
    move |e| ServiceError::Storage(anyhow::Error::new(e).context(context))
}

fn parse_mode(value: &str) -> Result<RequestMode> {
    [RequestMode::Sync, RequestMode::Async]
        .into_iter()
        .find(|mode| mode.as_str() == value)
        .ok_or_else(|| ServiceError::Storage(anyhow::anyhow!("unknown mode '{value}' in store")))
}

fn parse_status(value: &str) -> Result<RequestStatus> {
    RequestStatus::ALL
        .into_iter()
        .find(|status| status.as_str() == value)
        .ok_or_else(|| ServiceError::Storage(anyhow::anyhow!("unknown status '{value}' in store")))
}

/// Durable storage backed by a SQLite database
pub struct SqliteRequestStore {
    pool: SqlitePool,
    writer: Mutex<()>,
}

impl SqliteRequestStore {
    /// Open (creating if needed) the database at `url` and ensure the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db_error("invalid database url"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // An in-memory database lives only as long as its connections
        let pool_options = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(db_error("failed to open database"))?;

        let store = Self::with_pool(pool).await?;
        info!(url = %url, "SQLite request store ready");
        Ok(store)
    }

    /// Use an existing pool, creating the schema if it is missing
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(db_error("failed to create requests table"))?;
        sqlx::query(MODE_INDEX)
            .execute(&pool)
            .await
            .map_err(db_error("failed to create requests index"))?;

        Ok(Self {
            pool,
            writer: Mutex::new(()),
        })
    }

    fn decode(document: &str) -> Result<RequestRecord> {
        Ok(serde_json::from_str(document)?)
    }
}

#[async_trait::async_trait]
impl RequestStore for SqliteRequestStore {
    async fn create(&self, record: RequestRecord) -> Result<RequestRecord> {
        record.check_invariants()?;
        let document = serde_json::to_string(&record)?;

        let _writer = self.writer.lock().await;
        let inserted = sqlx::query(
            "INSERT INTO requests (id, mode, status, processing_time_ms, record)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(record.id.to_string())
        .bind(record.mode.as_str())
        .bind(record.status.as_str())
        .bind(record.processing_time_ms)
        .bind(&document)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(record),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(
                ServiceError::InvalidInput(format!("request {} already exists", record.id)),
            ),
            Err(e) => Err(db_error("failed to insert request")(e)),
        }
    }

    async fn get(&self, id: &Uuid) -> Result<RequestRecord> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT record FROM requests WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error("failed to read request"))?;

        match document {
            Some(document) => Self::decode(&document),
            None => Err(ServiceError::NotFound(id.to_string())),
        }
    }

    async fn update(&self, id: &Uuid, update: RecordUpdate) -> Result<RequestRecord> {
        let _writer = self.writer.lock().await;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("failed to begin transaction"))?;

        let document: Option<String> =
            sqlx::query_scalar("SELECT record FROM requests WHERE id = ?1")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error("failed to read request"))?;
        let mut record = match document {
            Some(document) => Self::decode(&document)?,
            None => return Err(ServiceError::NotFound(id.to_string())),
        };

        // Dropping `tx` on an early return rolls back
        record.apply(update)?;
        record.check_invariants()?;

        sqlx::query(
            "UPDATE requests SET status = ?1, processing_time_ms = ?2, record = ?3 WHERE id = ?4",
        )
        .bind(record.status.as_str())
        .bind(record.processing_time_ms)
        .bind(serde_json::to_string(&record)?)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(db_error("failed to write request"))?;

        tx.commit()
            .await
            .map_err(db_error("failed to commit request update"))?;

        Ok(record)
    }

    async fn list(
        &self,
        mode: Option<RequestMode>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RequestRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);

        let documents: Vec<String> = sqlx::query_scalar(
            "SELECT record FROM requests
             WHERE ?1 IS NULL OR mode = ?1
             ORDER BY seq DESC
             LIMIT ?2 OFFSET ?3",
        )
        .bind(mode.map(|m| m.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to list requests"))?;

        documents.iter().map(|document| Self::decode(document)).collect()
    }

    async fn stats(&self) -> Result<StoreStats> {
        let counts = sqlx::query(
            "SELECT mode, status, COUNT(*) AS n FROM requests GROUP BY mode, status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to count requests"))?;

        let mut stats = StoreStats::default();
        for row in counts {
            let mode = parse_mode(row.try_get("mode").context("mode column")?)?;
            let status = parse_status(row.try_get("status").context("status column")?)?;
            let n: i64 = row.try_get("n").context("count column")?;
            let n = usize::try_from(n).unwrap_or_default();

            stats.total += n;
            *stats.by_mode.entry(mode).or_default() += n;
            *stats.by_status.entry(status).or_default() += n;
        }

        let averages = sqlx::query(
            "SELECT mode, AVG(processing_time_ms) AS avg_ms FROM requests
             WHERE processing_time_ms IS NOT NULL GROUP BY mode",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("failed to average processing times"))?;

        let mut avg_processing_time_ms = HashMap::new();
        for row in averages {
            let mode = parse_mode(row.try_get("mode").context("mode column")?)?;
            let avg: f64 = row.try_get("avg_ms").context("average column")?;
            avg_processing_time_ms.insert(mode, avg);
        }
        stats.avg_processing_time_ms = avg_processing_time_ms;

        Ok(stats)
    }
}
