// Request records - the persisted lifecycle of every accepted request

//! # Request Models
//!
//! This module defines the core types for request tracking:
//! - `RequestRecord`: One accepted request and everything that happened to it
//! - `RequestStatus`: The lifecycle state machine
//! - `RecordUpdate`: A partial, atomic change applied through the store
//!
//! ## Lifecycle
//!
//! ```text
//! pending --> processing --> completed --> callback_sent
//!                  |             |
//!                  |             +-------> callback_failed
//!                  +--> failed
//! ```
//!
//! `completed` is terminal when the request has no callback URL.
//!
//! ## Rust Learning Notes:
//!
//! ### Validate, Then Mutate
//! `RequestRecord::apply` checks every rule of an update before touching a
//! single field. Either the whole update lands or nothing changes, so no reader
//! can observe a `completed` record without its result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::{Result, ServiceError};

/// How the request was submitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    /// Completed before the response was returned
    Sync,
    /// Acknowledged immediately, completed in the background
    Async,
}

impl RequestMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Async => "async",
        }
    }
}

impl fmt::Display for RequestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    CallbackSent,
    CallbackFailed,
}

impl RequestStatus {
    /// Every status, in lifecycle order
    pub const ALL: [RequestStatus; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::CallbackSent,
        Self::CallbackFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::CallbackSent => "callback_sent",
            Self::CallbackFailed => "callback_failed",
        }
    }

    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// This only checks the shape of the graph. Whether `completed` may move on
    /// to a callback state also depends on the record having a callback URL,
    /// which `RequestRecord::apply` checks.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Completed, Self::CallbackSent)
                | (Self::Completed, Self::CallbackFailed)
        )
    }

    /// States in which the computed result must be present
    pub fn carries_result(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::CallbackSent | Self::CallbackFailed
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted record of one accepted request
///
/// Records are owned by the `RequestStore`. Other components read clones and
/// describe changes as a `RecordUpdate`; nobody holds a private copy that could
/// drift from the stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    /// Unique identifier, generated at creation
    pub id: Uuid,

    pub mode: RequestMode,

    pub status: RequestStatus,

    /// Input data exactly as the caller sent it
    pub payload: serde_json::Value,

    /// Work complexity level (1-10)
    pub complexity: u32,

    /// Computed output, present only once the work has completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Where completion is reported; always absent for sync requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<f64>,

    /// Network attempts made to deliver the callback
    pub callback_attempts: u32,

    /// Why the request failed or why its callback was not delivered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RequestRecord {
    /// Create a new pending record
    pub fn new(
        mode: RequestMode,
        payload: serde_json::Value,
        complexity: u32,
        callback_url: Option<String>,
    ) -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            mode,
            status: RequestStatus::Pending,
            payload,
            complexity,
            result: None,
            callback_url,
            processing_time_ms: None,
            callback_attempts: 0,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// No further transition is possible from the current state
    pub fn is_terminal(&self) -> bool {
        match self.status {
            RequestStatus::Pending | RequestStatus::Processing => false,
            RequestStatus::Completed => self.callback_url.is_none(),
            RequestStatus::Failed | RequestStatus::CallbackSent | RequestStatus::CallbackFailed => {
                true
            }
        }
    }

    /// Check the record-level invariants.
    ///
    /// - `result` is present exactly when the status carries a result
    /// - `callback_attempts > 0` implies a callback URL
    pub fn check_invariants(&self) -> Result<()> {
        if self.result.is_some() != self.status.carries_result() {
            return Err(ServiceError::Internal(format!(
                "record {} in status {} has result present = {}",
                self.id,
                self.status,
                self.result.is_some()
            )));
        }
        if self.callback_attempts > 0 && self.callback_url.is_none() {
            return Err(ServiceError::Internal(format!(
                "record {} has callback attempts without a callback url",
                self.id
            )));
        }
        Ok(())
    }

    /// Apply a partial update atomically.
    ///
    /// All checks run before any field is written, so a rejected update leaves
    /// the record untouched.
    pub fn apply(&mut self, update: RecordUpdate) -> Result<()> {
        let next_status = update.status.unwrap_or(self.status);

        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(ServiceError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            let needs_callback = matches!(
                next,
                RequestStatus::CallbackSent | RequestStatus::CallbackFailed
            );
            if needs_callback && self.callback_url.is_none() {
                return Err(ServiceError::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
        }

        // result is written once, together with the move into `completed`
        let entering_completed =
            update.status == Some(RequestStatus::Completed) && self.result.is_none();
        match (&update.result, entering_completed) {
            (Some(_), false) => {
                return Err(ServiceError::InvalidInput(format!(
                    "result can only be set on the transition to completed (record {})",
                    self.id
                )));
            }
            (None, true) => {
                return Err(ServiceError::InvalidInput(format!(
                    "transition to completed requires a result (record {})",
                    self.id
                )));
            }
            _ => {}
        }

        if update.processing_time_ms.is_some() {
            let finishing = matches!(
                update.status,
                Some(RequestStatus::Completed) | Some(RequestStatus::Failed)
            );
            if !finishing || self.processing_time_ms.is_some() {
                return Err(ServiceError::InvalidInput(format!(
                    "processing time is recorded once, when processing finishes (record {})",
                    self.id
                )));
            }
        }

        if update.increment_callback_attempts {
            if self.callback_url.is_none() {
                return Err(ServiceError::InvalidInput(format!(
                    "record {} has no callback url to attempt",
                    self.id
                )));
            }
            if next_status != RequestStatus::Completed {
                return Err(ServiceError::InvalidInput(format!(
                    "callback attempts are only made while completed (record {} is {})",
                    self.id, next_status
                )));
            }
        }

        let now = Utc::now();

        if let Some(next) = update.status {
            self.status = next;
            if next != RequestStatus::Processing {
                self.completed_at = Some(now);
            }
        }
        if let Some(result) = update.result {
            self.result = Some(result);
        }
        if let Some(ms) = update.processing_time_ms {
            self.processing_time_ms = Some(ms);
        }
        if let Some(message) = update.error_message {
            self.error_message = Some(message);
        }
        if update.increment_callback_attempts {
            self.callback_attempts += 1;
        }
        self.updated_at = now;

        Ok(())
    }
}

/// A partial change to a record, applied atomically by the store
///
/// Built with small constructors so call sites read like the transition they
/// perform:
///
/// ```rust
/// use sync_async_api::{RecordUpdate, RequestStatus};
///
/// let update = RecordUpdate::transition(RequestStatus::Completed)
///     .with_result(serde_json::json!({"sum": 3.0}))
///     .with_processing_time(12.5);
/// assert_eq!(update.status, Some(RequestStatus::Completed));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<RequestStatus>,
    pub result: Option<serde_json::Value>,
    pub processing_time_ms: Option<f64>,
    pub error_message: Option<String>,
    pub increment_callback_attempts: bool,
}

impl RecordUpdate {
    /// Move the record to `status`
    pub fn transition(status: RequestStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Count one callback attempt without changing status
    pub fn callback_attempt() -> Self {
        Self {
            increment_callback_attempts: true,
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_processing_time(mut self, ms: f64) -> Self {
        self.processing_time_ms = Some(ms);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}
