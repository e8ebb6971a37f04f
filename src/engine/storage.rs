// Storage abstraction for request records
// This defines the single write path for every record in the system

//! # Storage Abstraction Layer
//!
//! This module provides the storage abstraction for `RequestRecord`s. Every
//! component that changes a record (the sync path, the dispatcher, callback
//! delivery) does so through `RequestStore::update`, which applies a
//! `RecordUpdate` atomically and enforces the lifecycle state machine.
//!
//! ## Storage Architecture
//!
//! The storage layer follows the **Repository Pattern**:
//! - **RequestStore trait**: Defines the interface for all storage operations
//! - **InMemoryRequestStore**: Default implementation for development and tests
//! - **SqliteRequestStore** (`sqlite_storage`): Durable implementation for production
//!
//! ## Thread Safety
//!
//! - Multiple async tasks read and update records concurrently
//! - Updates hold the write lock for the whole validate-and-apply step, so a
//!   reader never observes half of a transition
//! - Send + Sync bounds allow sharing the store across tasks via `Arc`
//!
//! ## Rust Learning Notes:
//!
//! ### Result<Option<T>> vs Result<T>
//! `get` returns `Result<RequestRecord>` with a `NotFound` error rather than
//! `Option`, because every caller in this crate treats a missing record as a
//! failure of the operation it was performing.

use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{RecordUpdate, RequestMode, RequestRecord, RequestStatus};
use crate::{Result, ServiceError};

/// Aggregate numbers for the statistics endpoint
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_mode: HashMap<RequestMode, usize>,
    pub by_status: HashMap<RequestStatus, usize>,
    /// Mean processing time per mode, over records that have one
    pub avg_processing_time_ms: HashMap<RequestMode, f64>,
}

impl StoreStats {
    pub fn count_mode(&self, mode: RequestMode) -> usize {
        self.by_mode.get(&mode).copied().unwrap_or(0)
    }

    pub fn count_status(&self, status: RequestStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Storage trait for request record persistence
///
/// ## Design Principles
///
/// - **Async by Default**: All operations return futures for non-blocking I/O
/// - **Atomic Updates**: `update` applies all fields of a `RecordUpdate` or none
/// - **Thread-Safe**: Send + Sync bounds allow sharing across async tasks
#[async_trait::async_trait]
pub trait RequestStore: Send + Sync {
    /// Persist a new record.
    ///
    /// ## Errors
    /// - A record with the same id already exists
    async fn create(&self, record: RequestRecord) -> Result<RequestRecord>;

    /// Get a record by id
    ///
    /// ## Errors
    /// - `ServiceError::NotFound` when no record has that id
    async fn get(&self, id: &Uuid) -> Result<RequestRecord>;

    /// Apply a partial update and return the record as stored afterwards
    ///
    /// ## Errors
    /// - `ServiceError::NotFound` when no record has that id
    /// - `ServiceError::InvalidTransition` when the status change is not an
    ///   edge of the lifecycle state machine
    /// - `ServiceError::InvalidInput` when the fields do not fit the transition
    async fn update(&self, id: &Uuid, update: RecordUpdate) -> Result<RequestRecord>;

    /// List records, newest first, optionally filtered by mode
    async fn list(
        &self,
        mode: Option<RequestMode>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RequestRecord>>;

    /// Aggregate counts for observability
    async fn stats(&self) -> Result<StoreStats>;
}

#[derive(Default)]
struct StoreInner {
    records: HashMap<Uuid, RequestRecord>,
    /// Ids in creation order; timestamps alone can tie
    order: Vec<Uuid>,
}

/// In-memory storage implementation for development and testing
///
/// ## Limitations
///
/// - **Not persistent**: Data is lost when process restarts
/// - **Not distributed**: Cannot share data across multiple processes
/// - **Memory bound**: Records are never evicted
#[derive(Default)]
pub struct InMemoryRequestStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn create(&self, record: RequestRecord) -> Result<RequestRecord> {
        record.check_invariants()?;

        let mut inner = self.inner.write().await;
        if inner.records.contains_key(&record.id) {
            return Err(ServiceError::InvalidInput(format!(
                "request {} already exists",
                record.id
            )));
        }

        inner.order.push(record.id);
        inner.records.insert(record.id, record.clone());

        Ok(record)
    }

    async fn get(&self, id: &Uuid) -> Result<RequestRecord> {
        let inner = self.inner.read().await;

        inner
            .records
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &Uuid, update: RecordUpdate) -> Result<RequestRecord> {
        let mut inner = self.inner.write().await;

        let record = inner
            .records
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))?;

        record.apply(update)?;
        record.check_invariants()?;

        Ok(record.clone())
    }

    async fn list(
        &self,
        mode: Option<RequestMode>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RequestRecord>> {
        let inner = self.inner.read().await;

        let records = inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.records.get(id))
            .filter(|record| mode.map_or(true, |m| record.mode == m))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect();

        Ok(records)
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.inner.read().await;

        let mut stats = StoreStats {
            total: inner.records.len(),
            ..StoreStats::default()
        };
        let mut time_totals: HashMap<RequestMode, (f64, usize)> = HashMap::new();

        for record in inner.records.values() {
            *stats.by_mode.entry(record.mode).or_default() += 1;
            *stats.by_status.entry(record.status).or_default() += 1;

            if let Some(ms) = record.processing_time_ms {
                let entry = time_totals.entry(record.mode).or_default();
                entry.0 += ms;
                entry.1 += 1;
            }
        }

        stats.avg_processing_time_ms = time_totals
            .into_iter()
            .map(|(mode, (sum, count))| (mode, sum / count as f64))
            .collect();

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn record(mode: RequestMode) -> RequestRecord {
        let callback = match mode {
            RequestMode::Async => Some("https://example.com/cb".to_string()),
            RequestMode::Sync => None,
        };
        RequestRecord::new(mode, json!({"value": 1}), 1, callback)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryRequestStore::new();
        let created = store.create(record(RequestMode::Sync)).await.unwrap();

        let fetched = store.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
    }

    #[tokio::test]
    async fn test_get_is_idempotent() {
        let store = InMemoryRequestStore::new();
        let created = store.create(record(RequestMode::Async)).await.unwrap();

        let first = store.get(&created.id).await.unwrap();
        let second = store.get(&created.id).await.unwrap();
        let third = store.get(&created.id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second, third);
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let store = InMemoryRequestStore::new();
        let result = store.get(&Uuid::new_v4()).await;
        assert!(matches!(result, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = InMemoryRequestStore::new();
        let created = store.create(record(RequestMode::Sync)).await.unwrap();
        assert!(store.create(created).await.is_err());
    }

    #[tokio::test]
    async fn test_update_moves_timestamp_and_status() {
        let store = InMemoryRequestStore::new();
        let created = store.create(record(RequestMode::Async)).await.unwrap();

        let updated = store
            .update(
                &created.id,
                RecordUpdate::transition(RequestStatus::Processing),
            )
            .await
            .unwrap();

        assert_eq!(updated.status, RequestStatus::Processing);
        assert!(updated.updated_at >= created.updated_at);
        assert_eq!(store.get(&created.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_rejected_update_leaves_record_unchanged() {
        let store = InMemoryRequestStore::new();
        let created = store.create(record(RequestMode::Async)).await.unwrap();

        let result = store
            .update(&created.id, RecordUpdate::transition(RequestStatus::Failed))
            .await;
        assert!(matches!(result, Err(ServiceError::InvalidTransition { .. })));

        assert_eq!(store.get(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn test_only_one_concurrent_claim_succeeds() {
        let store = Arc::new(InMemoryRequestStore::new());
        let created = store.create(record(RequestMode::Async)).await.unwrap();

        let claims = (0..8).map(|_| {
            let store = store.clone();
            let id = created.id;
            tokio::spawn(async move {
                store
                    .update(&id, RecordUpdate::transition(RequestStatus::Processing))
                    .await
                    .is_ok()
            })
        });

        let wins = futures::future::join_all(claims)
            .await
            .into_iter()
            .filter(|claimed| matches!(claimed, Ok(true)))
            .count();

        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_list_newest_first_with_paging_and_filter() {
        let store = InMemoryRequestStore::new();
        let mut ids = Vec::new();
        for i in 0..5 {
            let mode = if i % 2 == 0 {
                RequestMode::Sync
            } else {
                RequestMode::Async
            };
            ids.push(store.create(record(mode)).await.unwrap().id);
        }

        let all = store.list(None, 100, 0).await.unwrap();
        let listed: Vec<Uuid> = all.iter().map(|r| r.id).collect();
        let expected: Vec<Uuid> = ids.iter().rev().copied().collect();
        assert_eq!(listed, expected);

        let page = store.list(None, 2, 1).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[3]);
        assert_eq!(page[1].id, ids[2]);

        let sync_only = store.list(Some(RequestMode::Sync), 100, 0).await.unwrap();
        assert_eq!(sync_only.len(), 3);
        assert!(sync_only.iter().all(|r| r.mode == RequestMode::Sync));
    }

    #[tokio::test]
    async fn test_stats_counts_and_averages() {
        let store = InMemoryRequestStore::new();
        let a = store.create(record(RequestMode::Sync)).await.unwrap();
        let b = store.create(record(RequestMode::Sync)).await.unwrap();
        store.create(record(RequestMode::Async)).await.unwrap();

        for (id, ms) in [(a.id, 10.0), (b.id, 30.0)] {
            store
                .update(&id, RecordUpdate::transition(RequestStatus::Processing))
                .await
                .unwrap();
            store
                .update(
                    &id,
                    RecordUpdate::transition(RequestStatus::Completed)
                        .with_result(json!({"sum": 1}))
                        .with_processing_time(ms),
                )
                .await
                .unwrap();
        }

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.count_mode(RequestMode::Sync), 2);
        assert_eq!(stats.count_mode(RequestMode::Async), 1);
        assert_eq!(stats.count_status(RequestStatus::Completed), 2);
        assert_eq!(stats.count_status(RequestStatus::Pending), 1);
        assert_eq!(
            stats.avg_processing_time_ms.get(&RequestMode::Sync),
            Some(&20.0)
        );
        assert!(stats.avg_processing_time_ms.get(&RequestMode::Async).is_none());
    }
}
