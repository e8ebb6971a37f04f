// Delivery events and counters

//! # Delivery Event Bus
//!
//! Every callback attempt, and every sequence that ends before an attempt is
//! made, is published as a `DeliveryEvent` on a broadcast channel and counted
//! in `DeliveryMetrics`. Nothing in the delivery path waits on subscribers: a
//! lagging or absent receiver just misses events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::DeliveryOutcome;

const EVENT_BUFFER: usize = 1000;

/// What happened to one attempt (or to a sequence that never got one)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    Failed(String),
    Blocked(String),
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryEvent {
    pub request_id: Uuid,
    pub domain: String,
    /// 1-based attempt number; 0 when no attempt was made
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub status_code: Option<u16>,
    pub latency_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl DeliveryEvent {
    pub fn new(request_id: Uuid, domain: impl Into<String>, attempt: u32, outcome: AttemptOutcome) -> Self {
        Self {
            request_id,
            domain: domain.into(),
            attempt,
            outcome,
            status_code: None,
            latency_ms: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_status(mut self, status_code: Option<u16>) -> Self {
        self.status_code = status_code;
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Running totals for the statistics surface
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    blocked: AtomicU64,
    circuit_open: AtomicU64,
    sequences_sent: AtomicU64,
    sequences_failed: AtomicU64,
}

/// Copy of `DeliveryMetrics` at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub blocked: u64,
    pub circuit_open: u64,
    pub callbacks_sent: u64,
    pub callbacks_failed: u64,
}

impl DeliveryMetrics {
    fn record_event(&self, event: &DeliveryEvent) {
        match event.outcome {
            AttemptOutcome::Delivered => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::Failed(_) => {
                self.attempts.fetch_add(1, Ordering::Relaxed);
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::Blocked(_) => {
                self.blocked.fetch_add(1, Ordering::Relaxed);
            }
            AttemptOutcome::CircuitOpen => {
                self.circuit_open.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Count a finished delivery sequence
    pub fn record_outcome(&self, outcome: &DeliveryOutcome) {
        let counter = if outcome.is_sent() {
            &self.sequences_sent
        } else {
            &self.sequences_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            circuit_open: self.circuit_open.load(Ordering::Relaxed),
            callbacks_sent: self.sequences_sent.load(Ordering::Relaxed),
            callbacks_failed: self.sequences_failed.load(Ordering::Relaxed),
        }
    }
}

/// Event bus for publishing and subscribing to delivery events
pub struct DeliveryEventBus {
    sender: broadcast::Sender<DeliveryEvent>,
    metrics: Arc<DeliveryMetrics>,
}

impl Default for DeliveryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            sender,
            metrics: Arc::new(DeliveryMetrics::default()),
        }
    }

    /// Count an event and hand it to current subscribers
    pub fn publish(&self, event: DeliveryEvent) {
        self.metrics.record_event(&event);
        tracing::debug!(
            target: "callback_delivery",
            request_id = %event.request_id,
            domain = %event.domain,
            attempt = event.attempt,
            outcome = ?event.outcome,
            "Delivery event"
        );
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.sender.subscribe()
    }

    pub fn metrics(&self) -> Arc<DeliveryMetrics> {
        self.metrics.clone()
    }
}
