// Request service - the entry point the HTTP layer talks to

//! # Request Service
//!
//! `RequestService` owns the wired-up engine: store, circuit registry, event
//! bus, delivery and dispatcher. Handlers call into it and never touch the
//! components directly.
//!
//! - `process_sync` runs the work on the caller's request and returns the
//!   finished record.
//! - `accept_async` stores a pending record, hands it to the dispatcher and
//!   returns at once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::circuit_breaker::CircuitBreakerRegistry;
use super::delivery::CallbackDelivery;
use super::dispatcher::{default_work, run_work, AsyncDispatcher, WorkFn};
use super::events::{DeliveryEventBus, MetricsSnapshot};
use super::sqlite_storage::SqliteRequestStore;
use super::ssrf::SsrfGuard;
use super::storage::{InMemoryRequestStore, RequestStore};
use super::work::{WorkProcessor, MAX_COMPLEXITY, MIN_COMPLEXITY};
use crate::config::AppConfig;
use crate::models::{CircuitBreakerStatus, RequestMode, RequestRecord, RequestStatus};
use crate::{Result, ServiceError};

/// Request counts for the statistics surface
#[derive(Debug, Clone, Serialize)]
pub struct RequestStats {
    pub total: usize,
    pub by_mode: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    pub avg_processing_time_ms: BTreeMap<String, f64>,
    /// Percentage of finished requests whose computation succeeded
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitStats {
    pub tracked_domains: usize,
    pub open_circuits: usize,
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub domains: Vec<CircuitBreakerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub in_flight: usize,
    pub queued: usize,
    pub running: bool,
}

/// Everything the engine can report about itself
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub requests: RequestStats,
    pub callbacks: MetricsSnapshot,
    pub circuit_breakers: CircuitStats,
    pub dispatcher: DispatcherStats,
}

pub struct RequestService {
    store: Arc<dyn RequestStore>,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<DeliveryEventBus>,
    dispatcher: Arc<AsyncDispatcher>,
    work: WorkFn,
}

impl RequestService {
    /// Wire an engine from configuration, persisting to SQLite when a
    /// database is configured and in memory otherwise
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store: Arc<dyn RequestStore> = match config.storage_url() {
            Some(url) => Arc::new(SqliteRequestStore::connect(url).await?),
            None => Arc::new(InMemoryRequestStore::new()),
        };
        Self::build(config, store, SsrfGuard::new(config.environment))
    }

    /// Wire an engine around a given store and destination guard
    pub fn build(config: &AppConfig, store: Arc<dyn RequestStore>, guard: SsrfGuard) -> Result<Self> {
        let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker_config()));
        let events = Arc::new(DeliveryEventBus::new());
        let delivery = Arc::new(CallbackDelivery::new(
            store.clone(),
            guard,
            breakers.clone(),
            events.clone(),
            config.delivery_config(),
        )?);
        let work = default_work();
        let dispatcher = Arc::new(AsyncDispatcher::with_work(
            config.dispatcher_config(),
            store.clone(),
            delivery,
            work.clone(),
        ));

        Ok(Self {
            store,
            breakers,
            events,
            dispatcher,
            work,
        })
    }

    fn check_request(data: &Value, complexity: u32) -> Result<()> {
        WorkProcessor::validate_input(data)?;
        if !(MIN_COMPLEXITY..=MAX_COMPLEXITY).contains(&complexity) {
            return Err(ServiceError::InvalidInput(format!(
                "complexity must be between {MIN_COMPLEXITY} and {MAX_COMPLEXITY}"
            )));
        }
        Ok(())
    }

    /// Run a request to completion before returning.
    ///
    /// The record is stored either way. A failed computation comes back as
    /// `ServiceError::Computation` with the record left in `failed`.
    pub async fn process_sync(&self, data: Value, complexity: u32) -> Result<RequestRecord> {
        Self::check_request(&data, complexity)?;

        let record = self
            .store
            .create(RequestRecord::new(RequestMode::Sync, data, complexity, None))
            .await?;
        tracing::info!(request_id = %record.id, complexity, "Sync request accepted");

        let record = run_work(self.store.as_ref(), &self.work, record.id).await?;
        match record.status {
            RequestStatus::Completed => Ok(record),
            _ => Err(ServiceError::Computation(
                record
                    .error_message
                    .unwrap_or_else(|| "computation failed".to_string()),
            )),
        }
    }

    /// Store a pending request and schedule it in the background.
    ///
    /// Queue space is reserved first; when there is none the request is
    /// refused and not stored.
    ///
    /// The callback URL is only checked for syntax here; destination policy is
    /// applied at delivery time and recorded on the request.
    pub async fn accept_async(
        &self,
        data: Value,
        complexity: u32,
        callback_url: Option<String>,
    ) -> Result<RequestRecord> {
        Self::check_request(&data, complexity)?;
        if let Some(url) = callback_url.as_deref() {
            SsrfGuard::check_syntax(url)?;
        }

        // a full or closed queue rejects before anything is stored
        let slot = self.dispatcher.reserve()?;
        let record = self
            .store
            .create(RequestRecord::new(
                RequestMode::Async,
                data,
                complexity,
                callback_url,
            ))
            .await?;

        self.dispatcher.submit_reserved(slot, &record)?;
        tracing::info!(
            request_id = %record.id,
            complexity,
            has_callback = record.callback_url.is_some(),
            "Async request accepted"
        );

        Ok(record)
    }

    pub async fn get(&self, id: &Uuid) -> Result<RequestRecord> {
        self.store.get(id).await
    }

    pub async fn list(
        &self,
        mode: Option<RequestMode>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RequestRecord>> {
        self.store.list(mode, limit, offset).await
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let store_stats = self.store.stats().await?;

        let by_mode = [RequestMode::Sync, RequestMode::Async]
            .into_iter()
            .map(|mode| (mode.to_string(), store_stats.count_mode(mode)))
            .collect();
        let by_status = RequestStatus::ALL
            .iter()
            .map(|status| (status.to_string(), store_stats.count_status(*status)))
            .collect();
        let avg_processing_time_ms = store_stats
            .avg_processing_time_ms
            .iter()
            .map(|(mode, avg)| (mode.to_string(), *avg))
            .collect();

        let succeeded = store_stats.count_status(RequestStatus::Completed)
            + store_stats.count_status(RequestStatus::CallbackSent)
            + store_stats.count_status(RequestStatus::CallbackFailed);
        let finished = succeeded + store_stats.count_status(RequestStatus::Failed);
        let success_rate = if finished == 0 {
            0.0
        } else {
            succeeded as f64 / finished as f64 * 100.0
        };

        let domains = self.breakers.snapshot();
        let breaker_config = self.breakers.config();

        Ok(ServiceStats {
            requests: RequestStats {
                total: store_stats.total,
                by_mode,
                by_status,
                avg_processing_time_ms,
                success_rate,
            },
            callbacks: self.events.metrics().snapshot(),
            circuit_breakers: CircuitStats {
                tracked_domains: domains.len(),
                open_circuits: self.breakers.open_count(),
                failure_threshold: breaker_config.failure_threshold,
                cooldown_secs: breaker_config.cooldown.as_secs(),
                domains,
            },
            dispatcher: DispatcherStats {
                in_flight: self.dispatcher.in_flight(),
                queued: self.dispatcher.queued(),
                running: self.dispatcher.is_running(),
            },
        })
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn events(&self) -> &Arc<DeliveryEventBus> {
        &self.events
    }

    /// Stop accepting async work and drain what was accepted
    pub async fn shutdown(&self) {
        self.dispatcher.shutdown().await;
    }

    /// Poll until a record reaches a terminal state or `timeout` passes
    pub async fn wait_for_terminal(&self, id: &Uuid, timeout: Duration) -> Result<RequestRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let record = self.store.get(id).await?;
            if record.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(record);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
