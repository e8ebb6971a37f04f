// Background scheduler for asynchronous requests

//! # Async Dispatcher
//!
//! `AsyncDispatcher::submit` puts a record id on a bounded queue and returns
//! straight away. Callers that create the record themselves take a
//! `QueueSlot` with `reserve` first, so a rejected request leaves nothing
//! behind. A single worker loop pulls ids off the queue and runs each
//! one as a task in a `JoinSet`, with a semaphore capping how many run at once.
//!
//! Each task drives one record through its lifecycle:
//!
//! ```text
//! pending ─► processing ─► completed ─► callback_sent | callback_failed
//!                       └► failed
//! ```
//!
//! ## Failure containment
//!
//! Nothing a task does reaches the submitter. Computation errors and panics in
//! the work function become a `failed` record; delivery problems become a
//! `callback_failed` record; store errors are logged.
//!
//! ## Shutdown
//!
//! `shutdown` drops the queue's sender. The worker loop keeps receiving until
//! the queue is empty, then waits for every running task to finish.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashSet;
use serde_json::Value;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use uuid::Uuid;

use super::delivery::CallbackDelivery;
use super::storage::RequestStore;
use super::work::WorkProcessor;
use crate::models::{RecordUpdate, RequestRecord, RequestStatus};
use crate::{Result, ServiceError};

/// The computation a record's payload is run through
pub type WorkFn = Arc<dyn Fn(&Value, u32) -> Result<Value> + Send + Sync>;

/// `WorkProcessor::compute`, with its output as JSON
pub fn default_work() -> WorkFn {
    Arc::new(|data: &Value, complexity: u32| {
        let output = WorkProcessor::compute(data, complexity)?;
        Ok(serde_json::to_value(output)?)
    })
}

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Tasks allowed to run at the same time
    pub concurrency: usize,
    /// Submissions that may wait for a worker before `QueueFull`
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 32,
            queue_capacity: 1024,
        }
    }
}

struct WorkerContext {
    store: Arc<dyn RequestStore>,
    delivery: Arc<CallbackDelivery>,
    work: WorkFn,
}

/// A reserved place on the dispatcher queue
pub struct QueueSlot {
    permit: mpsc::OwnedPermit<Uuid>,
}

/// Background work scheduler with its own lifecycle
pub struct AsyncDispatcher {
    config: DispatcherConfig,
    sender: Mutex<Option<mpsc::Sender<Uuid>>>,
    accepted: DashSet<Uuid>,
    permits: Arc<Semaphore>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AsyncDispatcher {
    /// Start the worker loop. Must be called inside a Tokio runtime.
    pub fn new(
        config: DispatcherConfig,
        store: Arc<dyn RequestStore>,
        delivery: Arc<CallbackDelivery>,
    ) -> Self {
        Self::with_work(config, store, delivery, default_work())
    }

    pub fn with_work(
        config: DispatcherConfig,
        store: Arc<dyn RequestStore>,
        delivery: Arc<CallbackDelivery>,
        work: WorkFn,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let ctx = Arc::new(WorkerContext {
            store,
            delivery,
            work,
        });

        let worker = tokio::spawn(worker_loop(receiver, ctx, permits.clone()));

        Self {
            config,
            sender: Mutex::new(Some(sender)),
            accepted: DashSet::new(),
            permits,
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }

    /// Hold a place on the queue before the record it is for exists.
    ///
    /// Dropping the slot unused gives the place back.
    ///
    /// ## Errors
    /// - `QueueFull` when the queue is at capacity
    /// - `ShuttingDown` after `shutdown` has been called
    pub fn reserve(&self) -> Result<QueueSlot> {
        let sender = {
            let guard = self
                .sender
                .lock()
                .map_err(|_| ServiceError::Internal("dispatcher lock poisoned".to_string()))?;
            guard.as_ref().ok_or(ServiceError::ShuttingDown)?.clone()
        };

        match sender.try_reserve_owned() {
            Ok(permit) => Ok(QueueSlot { permit }),
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("Work queue full");
                Err(ServiceError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ServiceError::ShuttingDown),
        }
    }

    /// Hand a pending record to the worker through a reserved slot
    ///
    /// ## Errors
    /// - `AlreadySubmitted` when this id was accepted before
    pub fn submit_reserved(&self, slot: QueueSlot, record: &RequestRecord) -> Result<()> {
        if !self.accepted.insert(record.id) {
            return Err(ServiceError::AlreadySubmitted(record.id.to_string()));
        }

        slot.permit.send(record.id);
        tracing::debug!(request_id = %record.id, "Request queued");
        Ok(())
    }

    /// Schedule a pending record. Never waits for the work itself.
    ///
    /// ## Errors
    /// - `AlreadySubmitted` when this id was accepted before
    /// - `QueueFull` when the queue is at capacity
    /// - `ShuttingDown` after `shutdown` has been called
    pub fn submit(&self, record: &RequestRecord) -> Result<()> {
        if self.accepted.contains(&record.id) {
            return Err(ServiceError::AlreadySubmitted(record.id.to_string()));
        }
        let slot = self.reserve()?;
        self.submit_reserved(slot, record)
    }

    /// Tasks currently holding a worker slot
    pub fn in_flight(&self) -> usize {
        self.config
            .concurrency
            .max(1)
            .saturating_sub(self.permits.available_permits())
    }

    /// Submissions waiting in the queue
    pub fn queued(&self) -> usize {
        match self.sender.lock() {
            Ok(guard) => guard
                .as_ref()
                .map_or(0, |sender| sender.max_capacity() - sender.capacity()),
            Err(_) => 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }

    /// Stop accepting work and wait for everything accepted to finish
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        drop(sender);

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::error!("Dispatcher worker loop ended abnormally: {}", e);
            }
        }
        tracing::info!("Dispatcher drained");
    }
}

async fn worker_loop(
    mut receiver: mpsc::Receiver<Uuid>,
    ctx: Arc<WorkerContext>,
    permits: Arc<Semaphore>,
) {
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            next = receiver.recv() => {
                let Some(id) = next else { break };
                let permit = match permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    process(&ctx, id).await;
                });
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join(joined);
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        tracing::error!("Dispatcher task ended abnormally: {}", e);
    }
}

async fn process(ctx: &WorkerContext, id: Uuid) {
    let record = match run_work(ctx.store.as_ref(), &ctx.work, id).await {
        Ok(record) => record,
        Err(e) => {
            tracing::error!(request_id = %id, error = %e, "Async processing aborted");
            return;
        }
    };

    if record.status == RequestStatus::Completed && record.callback_url.is_some() {
        if let Err(e) = ctx.delivery.deliver(&record).await {
            tracing::error!(request_id = %id, error = %e, "Callback delivery aborted");
        }
    }
}

/// Move a pending record through processing to `completed` or `failed`.
///
/// Shared by the sync path and the dispatcher. The computation runs on the
/// blocking pool; an error or panic there produces a `failed` record rather
/// than an `Err`.
///
/// ## Errors
/// Only when the store refuses a transition (for example, the record was
/// already claimed).
pub async fn run_work(
    store: &dyn RequestStore,
    work: &WorkFn,
    id: Uuid,
) -> Result<RequestRecord> {
    let record = store
        .update(&id, RecordUpdate::transition(RequestStatus::Processing))
        .await?;

    let started = Instant::now();
    let work = work.clone();
    let payload = record.payload.clone();
    let complexity = record.complexity;
    let computed = tokio::task::spawn_blocking(move || work(&payload, complexity)).await;
    let processing_time_ms = started.elapsed().as_secs_f64() * 1000.0;

    let update = match computed {
        Ok(Ok(result)) => RecordUpdate::transition(RequestStatus::Completed)
            .with_result(result)
            .with_processing_time(processing_time_ms),
        Ok(Err(e)) => {
            tracing::warn!(request_id = %id, error = %e, "Computation failed");
            RecordUpdate::transition(RequestStatus::Failed)
                .with_error(e.to_string())
                .with_processing_time(processing_time_ms)
        }
        Err(join_error) => {
            let message = panic_message(join_error);
            tracing::error!(request_id = %id, error = %message, "Computation panicked");
            RecordUpdate::transition(RequestStatus::Failed)
                .with_error(message)
                .with_processing_time(processing_time_ms)
        }
    };

    let record = store.update(&id, update).await?;
    tracing::info!(
        request_id = %id,
        status = %record.status,
        processing_time_ms,
        "Processing finished"
    );
    Ok(record)
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return format!("computation was cancelled: {error}");
    }
    let payload = error.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("computation panicked: {detail}")
}
