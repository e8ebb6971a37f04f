// API middleware
// Per-client sliding-window rate limiting

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use serde::Serialize;
use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::warn;

use super::types::create_error_response;

// Configuration for rate limiting
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    // Requests allowed per client within one window
    pub max_requests: u32,
    pub window: Duration,
}

// Checks between sweeps of idle clients
const SWEEP_INTERVAL: u64 = 1024;

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub active_clients: usize,
    pub recent_requests: usize,
    pub rejected_requests: u64,
    pub max_requests_per_window: u32,
    pub window_seconds: u64,
}

// Sliding-window limiter keyed by client address
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    clients: DashMap<IpAddr, VecDeque<Instant>>,
    rejected: AtomicU64,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
            rejected: AtomicU64::new(0),
            checks: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Record a request from `client` if it fits in the window
    pub fn check(&self, client: IpAddr) -> bool {
        self.check_at(client, Instant::now())
    }

    fn check_at(&self, client: IpAddr, now: Instant) -> bool {
        // must run before the entry lock below is taken
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == SWEEP_INTERVAL - 1 {
            self.sweep(now);
        }

        let mut timestamps = self.clients.entry(client).or_default();
        self.expire(&mut timestamps, now);

        if timestamps.len() >= self.config.max_requests as usize {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        timestamps.push_back(now);
        true
    }

    fn expire(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.config.window) {
            while timestamps.front().map_or(false, |t| *t <= cutoff) {
                timestamps.pop_front();
            }
        }
    }

    /// Drop clients with no requests left in the window
    fn sweep(&self, now: Instant) {
        self.clients.retain(|_, timestamps| {
            self.expire(timestamps, now);
            !timestamps.is_empty()
        });
    }

    pub fn stats(&self) -> RateLimiterStats {
        self.stats_at(Instant::now())
    }

    fn stats_at(&self, now: Instant) -> RateLimiterStats {
        self.sweep(now);
        let recent_requests = self.clients.iter().map(|entry| entry.value().len()).sum();

        RateLimiterStats {
            active_clients: self.clients.len(),
            recent_requests,
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            max_requests_per_window: self.config.max_requests,
            window_seconds: self.config.window.as_secs(),
        }
    }
}

// Peer address from the connection, or a shared bucket when unknown
fn client_ip(request: &Request<Body>) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

// Rate limiting middleware for Axum
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next<Body>,
) -> Response {
    let client = client_ip(&request);

    if !limiter.check(client) {
        warn!(client = %client, "Rate limit exceeded");
        let mut body = create_error_response(
            "Too many requests. Please try again later.".to_string(),
            "rate_limit_error",
            "RATE_LIMITED",
        );
        body.path = Some(request.uri().path().to_string());
        body.retry_after = Some(limiter.config().window.as_secs());
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window: Duration) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window,
        })
    }

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = limiter(3, Duration::from_secs(60));
        let client: IpAddr = "203.0.113.7".parse().unwrap();

        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(limiter.check(client));
        assert!(!limiter.check(client));

        let stats = limiter.stats();
        assert_eq!(stats.active_clients, 1);
        assert_eq!(stats.recent_requests, 3);
        assert_eq!(stats.rejected_requests, 1);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(1, Duration::from_secs(60));

        assert!(limiter.check("203.0.113.1".parse().unwrap()));
        assert!(limiter.check("203.0.113.2".parse().unwrap()));
        assert!(!limiter.check("203.0.113.1".parse().unwrap()));
    }

    #[test]
    fn test_window_slides() {
        let limiter = limiter(2, Duration::from_secs(10));
        let client: IpAddr = "203.0.113.7".parse().unwrap();
        let start = Instant::now();

        assert!(limiter.check_at(client, start));
        assert!(limiter.check_at(client, start + Duration::from_secs(4)));
        assert!(!limiter.check_at(client, start + Duration::from_secs(8)));

        // the first request has left the window
        assert!(limiter.check_at(client, start + Duration::from_secs(11)));
        assert!(!limiter.check_at(client, start + Duration::from_secs(12)));
    }

    #[test]
    fn test_idle_clients_are_forgotten() {
        let limiter = limiter(5, Duration::from_secs(10));
        let start = Instant::now();

        for i in 1..=20u8 {
            assert!(limiter.check_at(IpAddr::from([203, 0, 113, i]), start));
        }
        assert_eq!(limiter.stats_at(start).active_clients, 20);

        let later = start + Duration::from_secs(11);
        assert!(limiter.check_at("203.0.113.1".parse().unwrap(), later));

        let stats = limiter.stats_at(later);
        assert_eq!(stats.active_clients, 1);
        assert_eq!(stats.recent_requests, 1);
        assert_eq!(limiter.clients.len(), 1);
    }

    #[test]
    fn test_checks_sweep_idle_clients() {
        let limiter = limiter(SWEEP_INTERVAL as u32, Duration::from_secs(10));
        let start = Instant::now();
        let later = start + Duration::from_secs(11);

        for i in 0..100u8 {
            assert!(limiter.check_at(IpAddr::from([198, 51, 100, i]), start));
        }
        let steady: IpAddr = "203.0.113.9".parse().unwrap();
        for _ in 100..SWEEP_INTERVAL {
            assert!(limiter.check_at(steady, later));
        }

        // only the client still inside the window is kept
        assert_eq!(limiter.clients.len(), 1);
        assert!(limiter.clients.contains_key(&steady));
    }
}
