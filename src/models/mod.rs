// Domain models for the sync/async API
// Plain data types shared by the engine and the HTTP layer

//! # Domain Models Module
//!
//! These types carry no behavior beyond keeping themselves consistent. The
//! engine decides *when* things change; the models decide *whether* a change is
//! legal.
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom create a flat API, so callers write
//! `use sync_async_api::models::RequestRecord` instead of
//! `use sync_async_api::models::request::RequestRecord`.

// Request records and the lifecycle state machine
pub mod request;

// Callback wire payload and delivery outcomes
pub mod callback;

// Circuit breaker states and snapshots
pub mod circuit;

pub use request::{RecordUpdate, RequestMode, RequestRecord, RequestStatus};

pub use callback::{CallbackMetadata, CallbackPayload, DeliveryFailure, DeliveryOutcome};

pub use circuit::{CircuitBreakerStatus, CircuitState};
