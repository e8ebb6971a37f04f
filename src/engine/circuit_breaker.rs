// Per-domain circuit breakers for callback delivery

//! # Circuit Breaker Registry
//!
//! Tracks the health of every callback destination, keyed by lower-cased
//! hostname. A domain that fails `failure_threshold` times in a row is skipped
//! until `cooldown` has passed, then exactly one trial is let through. The trial
//! either closes the circuit or re-opens it for another cool-down.
//!
//! ## Rust Learning Notes:
//!
//! ### DashMap entries as per-key locks
//! `DashMap::entry` holds a shard write lock for as long as the returned
//! `RefMut` lives. Each read-modify-write below happens inside one entry
//! borrow, so two deliveries racing on the same domain cannot both take the
//! half-open trial.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::models::{CircuitBreakerStatus, CircuitState};

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a trial.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

/// Circuit for a single domain
#[derive(Debug, Default)]
struct DomainCircuit {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<DateTime<Utc>>,
    /// Monotonic twin of `opened_at`, used for the cool-down check
    opened_instant: Option<Instant>,
    /// When the current half-open trial was admitted
    trial_started: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl DomainCircuit {
    fn can_execute(&mut self, domain: &str, config: &CircuitBreakerConfig) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = self
                    .opened_instant
                    .map_or(true, |opened| opened.elapsed() >= config.cooldown);
                if cooled {
                    self.state = CircuitState::HalfOpen;
                    self.trial_started = Some(Instant::now());
                    tracing::info!(
                        target: "circuit_breaker",
                        domain = %domain,
                        "Circuit breaker transitioning to half-open for trial"
                    );
                }
                cooled
            }
            // The trial is already out. A trial that never reported back
            // loses its lease after one cool-down.
            CircuitState::HalfOpen => {
                let expired = self
                    .trial_started
                    .map_or(true, |started| started.elapsed() >= config.cooldown);
                if expired {
                    self.trial_started = Some(Instant::now());
                    tracing::warn!(
                        target: "circuit_breaker",
                        domain = %domain,
                        "Half-open trial never reported; admitting a new trial"
                    );
                }
                expired
            }
        }
    }

    fn record_success(&mut self, domain: &str) {
        self.last_success_at = Some(Utc::now());
        self.failure_count = 0;

        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.opened_at = None;
                self.opened_instant = None;
                self.trial_started = None;
                tracing::info!(
                    target: "circuit_breaker",
                    domain = %domain,
                    "Circuit breaker closed after successful trial"
                );
            }
            CircuitState::Closed => {}
            CircuitState::Open => {
                // An attempt admitted before the circuit opened finished late
                tracing::warn!(
                    target: "circuit_breaker",
                    domain = %domain,
                    "Success recorded while circuit is open"
                );
            }
        }
    }

    fn record_failure(&mut self, domain: &str, config: &CircuitBreakerConfig) {
        let now = Utc::now();
        self.last_failure_at = Some(now);
        self.failure_count += 1;

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= config.failure_threshold {
                    self.open(now);
                    tracing::warn!(
                        target: "circuit_breaker",
                        domain = %domain,
                        failure_count = self.failure_count,
                        threshold = config.failure_threshold,
                        "Circuit breaker opened due to consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.open(now);
                tracing::warn!(
                    target: "circuit_breaker",
                    domain = %domain,
                    "Circuit breaker reopened after failed trial"
                );
            }
            CircuitState::Open => {}
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.opened_instant = Some(Instant::now());
        self.trial_started = None;
    }

    fn status(&self, domain: &str) -> CircuitBreakerStatus {
        CircuitBreakerStatus {
            domain: domain.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            opened_at: self.opened_at,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
        }
    }
}

/// Process-wide registry of domain circuits, shared by every delivery
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    circuits: DashMap<String, DomainCircuit>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether an attempt against `domain` may go ahead.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open and
    /// admits this one caller; everyone else is refused until the trial
    /// reports back.
    pub fn allow(&self, domain: &str) -> bool {
        let key = domain.to_ascii_lowercase();
        let mut circuit = self.circuits.entry(key.clone()).or_default();
        circuit.can_execute(&key, &self.config)
    }

    pub fn record_success(&self, domain: &str) {
        let key = domain.to_ascii_lowercase();
        let mut circuit = self.circuits.entry(key.clone()).or_default();
        circuit.record_success(&key);
    }

    pub fn record_failure(&self, domain: &str) {
        let key = domain.to_ascii_lowercase();
        let mut circuit = self.circuits.entry(key.clone()).or_default();
        circuit.record_failure(&key, &self.config);
    }

    /// Current view of one domain; unknown domains report a fresh closed circuit
    pub fn status(&self, domain: &str) -> CircuitBreakerStatus {
        let key = domain.to_ascii_lowercase();
        match self.circuits.get(&key) {
            Some(circuit) => circuit.status(&key),
            None => DomainCircuit::default().status(&key),
        }
    }

    /// Every tracked domain, sorted by name
    pub fn snapshot(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<CircuitBreakerStatus> = self
            .circuits
            .iter()
            .map(|entry| entry.value().status(entry.key()))
            .collect();
        statuses.sort_by(|a, b| a.domain.cmp(&b.domain));
        statuses
    }

    pub fn open_count(&self) -> usize {
        self.circuits
            .iter()
            .filter(|entry| entry.value().state != CircuitState::Closed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registry(threshold: u32, cooldown: Duration) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn test_closed_by_default() {
        let breakers = CircuitBreakerRegistry::default();
        assert!(breakers.allow("example.com"));
        assert_eq!(breakers.status("example.com").state, CircuitState::Closed);
    }

    #[test]
    fn test_opens_after_threshold() {
        let breakers = registry(5, Duration::from_secs(60));

        for _ in 0..4 {
            breakers.record_failure("example.com");
            assert!(breakers.allow("example.com"));
        }
        breakers.record_failure("example.com");

        assert!(!breakers.allow("example.com"));
        let status = breakers.status("example.com");
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 5);
        assert!(status.opened_at.is_some());
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let breakers = registry(3, Duration::from_secs(60));

        breakers.record_failure("example.com");
        breakers.record_failure("example.com");
        breakers.record_success("example.com");
        breakers.record_failure("example.com");
        breakers.record_failure("example.com");

        assert!(breakers.allow("example.com"));
        assert_eq!(breakers.status("example.com").failure_count, 2);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let breakers = registry(1, Duration::from_millis(20));
        breakers.record_failure("example.com");
        assert!(!breakers.allow("example.com"));

        std::thread::sleep(Duration::from_millis(40));

        assert!(breakers.allow("example.com"));
        assert_eq!(breakers.status("example.com").state, CircuitState::HalfOpen);
        assert!(!breakers.allow("example.com"));
    }

    #[test]
    fn test_trial_success_closes() {
        let breakers = registry(1, Duration::from_millis(10));
        breakers.record_failure("example.com");
        std::thread::sleep(Duration::from_millis(25));
        assert!(breakers.allow("example.com"));

        breakers.record_success("example.com");

        let status = breakers.status("example.com");
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert!(status.opened_at.is_none());
        assert!(breakers.allow("example.com"));
    }

    #[test]
    fn test_trial_failure_reopens() {
        let breakers = registry(1, Duration::from_millis(10));
        breakers.record_failure("example.com");
        let first_open = breakers.status("example.com").opened_at;
        std::thread::sleep(Duration::from_millis(25));
        assert!(breakers.allow("example.com"));

        breakers.record_failure("example.com");

        let status = breakers.status("example.com");
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.opened_at > first_open);
        assert!(!breakers.allow("example.com"));
    }

    #[test]
    fn test_unreported_trial_lease_expires() {
        let breakers = registry(1, Duration::from_millis(20));
        breakers.record_failure("example.com");
        std::thread::sleep(Duration::from_millis(40));
        assert!(breakers.allow("example.com"));
        assert!(!breakers.allow("example.com"));

        // the trial never reports back
        std::thread::sleep(Duration::from_millis(40));

        assert!(breakers.allow("example.com"));
        assert_eq!(breakers.status("example.com").state, CircuitState::HalfOpen);
        assert!(!breakers.allow("example.com"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_all_counted() {
        let breakers = Arc::new(registry(1_000, Duration::from_secs(60)));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let breakers = breakers.clone();
                tokio::spawn(async move { breakers.record_failure("example.com") })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let status = breakers.status("example.com");
        assert_eq!(status.failure_count, 200);
        assert_eq!(status.state, CircuitState::Closed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allow_admits_one_trial() {
        let breakers = Arc::new(registry(5, Duration::from_millis(20)));
        for _ in 0..5 {
            breakers.record_failure("example.com");
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let barrier = Arc::new(tokio::sync::Barrier::new(64));
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let breakers = breakers.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    breakers.allow("example.com")
                })
            })
            .collect();

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(breakers.status("example.com").state, CircuitState::HalfOpen);
    }

    #[test]
    fn test_domains_are_isolated_and_case_insensitive() {
        let breakers = registry(1, Duration::from_secs(60));
        breakers.record_failure("Bad.Example.com");

        assert!(!breakers.allow("bad.example.com"));
        assert!(breakers.allow("good.example.com"));
        assert_eq!(breakers.open_count(), 1);

        let domains: Vec<String> = breakers.snapshot().into_iter().map(|s| s.domain).collect();
        assert_eq!(domains, vec!["bad.example.com", "good.example.com"]);
    }
}
