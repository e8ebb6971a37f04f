// Callback delivery with retries, backoff and circuit gating

//! # Callback Delivery
//!
//! `CallbackDelivery::deliver` runs one delivery sequence for a completed
//! request:
//!
//! 1. The destination goes through `SsrfGuard` once. A rejection ends the
//!    sequence with zero attempts.
//! 2. Up to `max_attempts` times: ask the domain's circuit for permission,
//!    count the attempt on the record, POST the callback body.
//! 3. Between failed attempts, sleep `base * 2^(attempt-1)` plus jitter.
//!
//! Connections go only to the addresses the guard vetted; a hostname is pinned
//! to them rather than looked up again.
//!
//! The record always ends in `callback_sent` or `callback_failed`, and the
//! returned `DeliveryOutcome` says how many attempts were made and how long
//! each backoff was. An attempt admitted by the circuit is always reported
//! back to it, even when the store fails before the request goes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::Client;
use uuid::Uuid;

use super::circuit_breaker::CircuitBreakerRegistry;
use super::events::{AttemptOutcome, DeliveryEvent, DeliveryEventBus};
use super::ssrf::{SsrfGuard, SsrfVerdict, VettedDestination};
use super::storage::RequestStore;
use crate::models::{
    CallbackPayload, DeliveryFailure, DeliveryOutcome, RecordUpdate, RequestRecord, RequestStatus,
};
use crate::{Result, ServiceError};

/// Configuration for callback delivery
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Network attempts per sequence, including the first
    pub max_attempts: u32,
    /// Bound on a single attempt
    pub attempt_timeout: Duration,
    /// Delay before the second attempt; doubles each time
    pub backoff_base: Duration,
    pub user_agent: String,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            user_agent: "SyncAsyncApi/1.0".to_string(),
        }
    }
}

impl DeliveryConfig {
    /// Delay after failed attempt `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` plus jitter drawn from `[0, base/2)`. Since the
    /// jitter is smaller than the gap between consecutive exponential steps,
    /// successive delays strictly increase.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let exponential = self.backoff_base.saturating_mul(1u32 << exponent);

        let half = self.backoff_base / 2;
        let jitter = if half.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..half)
        };

        exponential + jitter
    }
}

/// Why one attempt failed
#[derive(Debug)]
struct AttemptError {
    message: String,
    status: Option<u16>,
}

/// Delivers completed results to callback URLs
pub struct CallbackDelivery {
    store: Arc<dyn RequestStore>,
    guard: SsrfGuard,
    breakers: Arc<CircuitBreakerRegistry>,
    events: Arc<DeliveryEventBus>,
    config: DeliveryConfig,
    client: Client,
}

impl CallbackDelivery {
    pub fn new(
        store: Arc<dyn RequestStore>,
        guard: SsrfGuard,
        breakers: Arc<CircuitBreakerRegistry>,
        events: Arc<DeliveryEventBus>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        let client = build_client(&config, None)?;

        Ok(Self {
            store,
            guard,
            breakers,
            events,
            config,
            client,
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Client that connects only to the vetted addresses
    fn client_for(&self, destination: &VettedDestination) -> Result<Client> {
        match destination.host.as_deref() {
            Some(host) => build_client(&self.config, Some((host, &destination.addrs))),
            None => Ok(self.client.clone()),
        }
    }

    /// Run one delivery sequence for a completed record.
    ///
    /// ## Errors
    /// Only for records that cannot be delivered at all (no callback URL, no
    /// result) or when the store rejects the final status change. Destination
    /// failures and a failed attempt count are reported through the returned
    /// outcome and the record's final state.
    pub async fn deliver(&self, record: &RequestRecord) -> Result<DeliveryOutcome> {
        let url = record.callback_url.as_deref().ok_or_else(|| {
            ServiceError::InvalidInput(format!("request {} has no callback url", record.id))
        })?;
        if record.status != RequestStatus::Completed {
            return Err(ServiceError::InvalidInput(format!(
                "request {} is {}, not completed",
                record.id, record.status
            )));
        }
        let payload = CallbackPayload::from_record(record).ok_or_else(|| {
            ServiceError::InvalidInput(format!("request {} has no result", record.id))
        })?;
        let domain = domain_of(url);

        let destination = match self.guard.validate(url).await {
            SsrfVerdict::Allowed(destination) => destination,
            SsrfVerdict::Rejected(reason) => {
                tracing::warn!(
                    target: "callback_delivery",
                    request_id = %record.id,
                    domain = %domain,
                    reason = %reason,
                    "Callback destination blocked"
                );
                self.events.publish(DeliveryEvent::new(
                    record.id,
                    &domain,
                    0,
                    AttemptOutcome::Blocked(reason.clone()),
                ));
                return self
                    .finish_failed(
                        record.id,
                        DeliveryFailure::BlockedDestination(reason),
                        0,
                        Vec::new(),
                    )
                    .await;
            }
        };
        let client = match self.client_for(&destination) {
            Ok(client) => client,
            Err(e) => {
                return self
                    .finish_failed(record.id, DeliveryFailure::Aborted(e.to_string()), 0, Vec::new())
                    .await;
            }
        };

        let max_attempts = self.config.max_attempts;
        let mut backoff = Vec::new();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if !self.breakers.allow(&domain) {
                tracing::warn!(
                    target: "callback_delivery",
                    request_id = %record.id,
                    domain = %domain,
                    attempt,
                    "Circuit open, skipping callback"
                );
                self.events.publish(DeliveryEvent::new(
                    record.id,
                    &domain,
                    attempt - 1,
                    AttemptOutcome::CircuitOpen,
                ));
                return self
                    .finish_failed(record.id, DeliveryFailure::CircuitOpen, attempt - 1, backoff)
                    .await;
            }

            if let Err(e) = self
                .store
                .update(&record.id, RecordUpdate::callback_attempt())
                .await
            {
                // release the circuit's admission before giving up
                self.breakers.record_failure(&domain);
                tracing::error!(
                    target: "callback_delivery",
                    request_id = %record.id,
                    domain = %domain,
                    attempt,
                    error = %e,
                    "Could not record callback attempt"
                );
                return self
                    .finish_failed(
                        record.id,
                        DeliveryFailure::Aborted(e.to_string()),
                        attempt - 1,
                        backoff,
                    )
                    .await;
            }

            let started = Instant::now();
            let sent = self
                .send(&client, url, &payload.for_attempt(attempt, max_attempts), record.id)
                .await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match sent {
                Ok(status) => {
                    self.breakers.record_success(&domain);
                    self.events.publish(
                        DeliveryEvent::new(record.id, &domain, attempt, AttemptOutcome::Delivered)
                            .with_status(Some(status))
                            .with_latency(latency_ms),
                    );
                    self.store
                        .update(&record.id, RecordUpdate::transition(RequestStatus::CallbackSent))
                        .await?;

                    tracing::info!(
                        target: "callback_delivery",
                        request_id = %record.id,
                        domain = %domain,
                        attempt,
                        status,
                        latency_ms,
                        "Callback delivered"
                    );

                    let outcome = DeliveryOutcome::Sent {
                        attempts: attempt,
                        backoff,
                    };
                    self.events.metrics().record_outcome(&outcome);
                    return Ok(outcome);
                }
                Err(error) => {
                    self.breakers.record_failure(&domain);
                    self.events.publish(
                        DeliveryEvent::new(
                            record.id,
                            &domain,
                            attempt,
                            AttemptOutcome::Failed(error.message.clone()),
                        )
                        .with_status(error.status)
                        .with_latency(latency_ms),
                    );
                    tracing::warn!(
                        target: "callback_delivery",
                        request_id = %record.id,
                        domain = %domain,
                        attempt,
                        max_attempts,
                        error = %error.message,
                        "Callback attempt failed"
                    );
                    last_error = error.message;

                    if attempt < max_attempts {
                        let delay = self.config.backoff_delay(attempt);
                        tokio::time::sleep(delay).await;
                        backoff.push(delay);
                    }
                }
            }
        }

        self.finish_failed(
            record.id,
            DeliveryFailure::RetriesExhausted {
                attempts: max_attempts,
                last_error,
            },
            max_attempts,
            backoff,
        )
        .await
    }

    async fn send(
        &self,
        client: &Client,
        url: &str,
        payload: &CallbackPayload,
        request_id: Uuid,
    ) -> std::result::Result<u16, AttemptError> {
        let response = client
            .post(url)
            .header("X-Request-Id", request_id.to_string())
            .json(payload)
            .send()
            .await
            .map_err(|e| AttemptError {
                message: if e.is_timeout() {
                    format!("timed out after {:?}", self.config.attempt_timeout)
                } else {
                    format!("request error: {e}")
                },
                status: None,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(AttemptError {
                message: format!("HTTP {}", status.as_u16()),
                status: Some(status.as_u16()),
            })
        }
    }

    async fn finish_failed(
        &self,
        request_id: Uuid,
        reason: DeliveryFailure,
        attempts: u32,
        backoff: Vec<Duration>,
    ) -> Result<DeliveryOutcome> {
        self.store
            .update(
                &request_id,
                RecordUpdate::transition(RequestStatus::CallbackFailed).with_error(reason.to_string()),
            )
            .await?;

        tracing::warn!(
            target: "callback_delivery",
            request_id = %request_id,
            attempts,
            reason = %reason,
            "Callback delivery failed"
        );

        let outcome = DeliveryOutcome::Failed {
            reason,
            attempts,
            backoff,
        };
        self.events.metrics().record_outcome(&outcome);
        Ok(outcome)
    }
}

fn build_client(config: &DeliveryConfig, pin: Option<(&str, &[SocketAddr])>) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(config.attempt_timeout)
        .user_agent(config.user_agent.clone())
        .redirect(reqwest::redirect::Policy::none());
    if let Some((host, addrs)) = pin {
        builder = builder.resolve_to_addrs(host, addrs);
    }

    builder
        .build()
        .map_err(|e| ServiceError::Internal(format!("Failed to build HTTP client: {e}")))
}

/// Circuit key for a callback URL: the lower-cased hostname
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        .unwrap_or_default()
}
