// Sync/Async API - Rust Edition
// Contrasts complete-before-respond and accept-then-notify request handling

//! # Sync/Async API Library
//!
//! This is the library crate behind the `server` binary. It accepts work in two
//! styles and reports asynchronous completion back to caller-supplied callback
//! URLs.
//!
//! ## Core Components
//!
//! ### Request Lifecycle
//! - [`RequestRecord`]: The persisted record of one accepted request
//! - [`RequestStatus`]: The lifecycle state machine
//!   (`pending → processing → completed | failed → callback_sent | callback_failed`)
//! - [`RequestStore`]: The single write path for records
//!
//! ### Completion Delivery
//!
//! #### [`AsyncDispatcher`] - Background Work Scheduler
//!
//! `submit` enqueues a record and returns immediately. A worker loop runs the
//! computation off the request path, moves the record through its states and
//! hands completed work to [`CallbackDelivery`].
//!
//! #### [`CallbackDelivery`] - Retry Loop
//!
//! - **Destination check**: [`SsrfGuard`] runs once before the first attempt
//! - **Circuit gate**: [`CircuitBreakerRegistry`] is consulted before every attempt
//! - **Bounded retries**: at most `max_attempts`, with exponential backoff
//!
//! #### [`CircuitBreakerRegistry`] - Per-Domain Health
//!
//! Shared across every in-flight delivery. After enough consecutive failures a
//! domain is skipped for a cool-down window, then tried once.
//!
//! ### HTTP Surface
//! The [`api`] module exposes `/sync`, `/async`, `/requests`, `/stats` and
//! `/healthz` on top of [`RequestService`].

// Domain models (records, callback payloads, circuit snapshots)
pub mod models;

// Processing engine: storage, work, delivery and scheduling
pub mod engine;

// HTTP API built on axum
pub mod api;

// Layered configuration (defaults, environment, CLI)
pub mod config;

pub use models::{
    CallbackPayload,     // Outbound callback body
    CircuitBreakerStatus, // Per-domain circuit snapshot
    CircuitState,        // closed / open / half_open
    DeliveryFailure,     // Why a delivery ended in callback_failed
    DeliveryOutcome,     // Result of one delivery sequence
    RecordUpdate,        // Atomic partial update of a record
    RequestMode,         // sync / async
    RequestRecord,       // The persisted request
    RequestStatus,       // Lifecycle state
};

pub use engine::{
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry},
    delivery::{CallbackDelivery, DeliveryConfig},
    dispatcher::{AsyncDispatcher, DispatcherConfig},
    events::{DeliveryEvent, DeliveryEventBus, DeliveryMetrics},
    service::RequestService,
    sqlite_storage::SqliteRequestStore,
    ssrf::{HostResolver, SsrfGuard, SsrfVerdict, SystemResolver, VettedDestination},
    storage::{InMemoryRequestStore, RequestStore},
    work::{WorkOutput, WorkProcessor},
};

pub use api::{ApiServer, ApiServerBuilder};
pub use config::{AppConfig, Environment};

use thiserror::Error;

/// Errors produced anywhere in the service.
///
/// The background path never hands these to a live caller: the dispatcher
/// converts them into record state. The synchronous path and the HTTP layer
/// surface them directly.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// A record with the given id does not exist
    #[error("Request not found: {0}")]
    NotFound(String),

    /// Caller-supplied data failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The callback URL is malformed or uses an unsupported scheme
    #[error("Invalid callback URL: {0}")]
    InvalidCallbackUrl(String),

    /// The store refused a transition outside the lifecycle state machine
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: RequestStatus,
        to: RequestStatus,
    },

    /// The work function rejected its inputs or could not produce a result
    #[error("Computation error: {0}")]
    Computation(String),

    /// The dispatcher already holds this record
    #[error("Request already submitted: {0}")]
    AlreadySubmitted(String),

    /// The dispatcher queue is at capacity
    #[error("Work queue is full")]
    QueueFull,

    /// The dispatcher has been shut down
    #[error("Dispatcher is shut down")]
    ShuttingDown,

    /// Too many requests from one client
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        ServiceError::Internal(err.to_string())
    }
}

/// Type alias for Results that use the crate error type
pub type Result<T> = std::result::Result<T, ServiceError>;
