// Callback payloads and delivery outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use super::request::RequestRecord;

/// Body POSTed to a caller's callback URL
///
/// The first four fields are the stable wire contract. `callback_metadata`
/// describes the attempt that carried the body and may be ignored by receivers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    pub request_id: Uuid,
    pub result: serde_json::Value,
    pub processing_time_ms: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_metadata: Option<CallbackMetadata>,
}

/// Per-attempt details attached to a callback body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackMetadata {
    pub attempt: u32,
    pub max_attempts: u32,
    pub sent_at: DateTime<Utc>,
}

impl CallbackPayload {
    /// Build the payload for a completed record.
    ///
    /// Returns `None` when the record has no result yet.
    pub fn from_record(record: &RequestRecord) -> Option<Self> {
        let result = record.result.clone()?;

        Some(Self {
            request_id: record.id,
            result,
            processing_time_ms: record.processing_time_ms.unwrap_or_default(),
            timestamp: Utc::now(),
            callback_metadata: None,
        })
    }

    /// Copy of this payload stamped for a specific attempt
    pub fn for_attempt(&self, attempt: u32, max_attempts: u32) -> Self {
        Self {
            callback_metadata: Some(CallbackMetadata {
                attempt,
                max_attempts,
                sent_at: Utc::now(),
            }),
            ..self.clone()
        }
    }
}

/// Why a delivery sequence ended without reaching the destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The destination was refused before any attempt
    BlockedDestination(String),
    /// The domain's circuit was open when an attempt was due
    CircuitOpen,
    /// Every allowed attempt failed
    RetriesExhausted { attempts: u32, last_error: String },
    /// The sequence could not continue for a reason local to this service
    Aborted(String),
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BlockedDestination(reason) => write!(f, "blocked destination: {reason}"),
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "callback failed after {attempts} attempts: {last_error}"),
            Self::Aborted(reason) => write!(f, "delivery aborted: {reason}"),
        }
    }
}

/// Result of one `CallbackDelivery::deliver` call
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Sent {
        attempts: u32,
        backoff: Vec<Duration>,
    },
    Failed {
        reason: DeliveryFailure,
        attempts: u32,
        backoff: Vec<Duration>,
    },
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent { .. })
    }

    /// Network attempts actually made
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Sent { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    /// Delays slept between attempts, in order
    pub fn backoff(&self) -> &[Duration] {
        match self {
            Self::Sent { backoff, .. } | Self::Failed { backoff, .. } => backoff,
        }
    }

    pub fn failure(&self) -> Option<&DeliveryFailure> {
        match self {
            Self::Sent { .. } => None,
            Self::Failed { reason, .. } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RecordUpdate, RequestMode, RequestStatus};
    use serde_json::json;

    #[test]
    fn test_payload_requires_result() {
        let record = RequestRecord::new(
            RequestMode::Async,
            json!({"a": 1}),
            1,
            Some("https://example.com/cb".into()),
        );
        assert!(CallbackPayload::from_record(&record).is_none());
    }

    #[test]
    fn test_payload_wire_fields() {
        let mut record = RequestRecord::new(
            RequestMode::Async,
            json!({"a": 1}),
            1,
            Some("https://example.com/cb".into()),
        );
        record
            .apply(RecordUpdate::transition(RequestStatus::Processing))
            .unwrap();
        record
            .apply(
                RecordUpdate::transition(RequestStatus::Completed)
                    .with_result(json!({"sum": 1.0}))
                    .with_processing_time(3.5),
            )
            .unwrap();

        let payload = CallbackPayload::from_record(&record)
            .unwrap()
            .for_attempt(2, 3);
        let wire = serde_json::to_value(&payload).unwrap();

        assert_eq!(wire["request_id"], json!(record.id.to_string()));
        assert_eq!(wire["result"], json!({"sum": 1.0}));
        assert_eq!(wire["processing_time_ms"], json!(3.5));
        assert!(wire["timestamp"].is_string());
        assert_eq!(wire["callback_metadata"]["attempt"], json!(2));
        assert_eq!(wire["callback_metadata"]["max_attempts"], json!(3));
    }

    #[test]
    fn test_failure_reasons_are_distinguishable() {
        assert_eq!(DeliveryFailure::CircuitOpen.to_string(), "circuit open");
        assert!(DeliveryFailure::BlockedDestination("loopback".into())
            .to_string()
            .starts_with("blocked destination"));
        assert_eq!(
            DeliveryFailure::RetriesExhausted {
                attempts: 3,
                last_error: "HTTP 500".into()
            }
            .to_string(),
            "callback failed after 3 attempts: HTTP 500"
        );
    }
}
