// Request processing engine
// Storage, computation and the asynchronous completion-delivery subsystem

//! # Engine Module
//!
//! The engine sits between the domain models and the HTTP layer.
//!
//! ## Engine Components
//!
//! ### Storage (`storage` module)
//! - The single write path for request records
//! - In-memory implementation behind the `RequestStore` trait
//! - SQLite implementation (`sqlite_storage`) for durable deployments
//!
//! ### Work (`work` module)
//! - Deterministic CPU-bound computation and input validation
//!
//! ### Completion Delivery
//! - `ssrf`: destination policy, checked once per delivery sequence
//! - `circuit_breaker`: per-domain health, consulted before every attempt
//! - `events`: attempt events and counters
//! - `delivery`: the retry loop
//! - `dispatcher`: background scheduling and lifecycle driving
//!
//! ### Service (`service` module)
//! - Wires the components together for the HTTP layer
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! 1. Create a directory with the module name (`engine/`)
//! 2. Add a `mod.rs` file as the module root
//! 3. Declare submodules in `mod.rs`
//! 4. Re-export important types for clean API

pub mod circuit_breaker;
pub mod delivery;
pub mod dispatcher;
pub mod events;
pub mod service;
pub mod sqlite_storage;
pub mod ssrf;
pub mod storage;
pub mod work;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
pub use delivery::{CallbackDelivery, DeliveryConfig};
pub use dispatcher::{AsyncDispatcher, DispatcherConfig, QueueSlot, WorkFn};
pub use events::{AttemptOutcome, DeliveryEvent, DeliveryEventBus, DeliveryMetrics, MetricsSnapshot};
pub use service::{RequestService, ServiceStats};
pub use sqlite_storage::SqliteRequestStore;
pub use ssrf::{HostResolver, SsrfGuard, SsrfVerdict, SystemResolver, VettedDestination};
pub use storage::{InMemoryRequestStore, RequestStore, StoreStats};
pub use work::{WorkOutput, WorkProcessor};
