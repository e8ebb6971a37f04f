// Service configuration
// Defaults, then environment variables, then CLI overrides applied by the binary

//! # Configuration
//!
//! `AppConfig` is loaded with the `config` crate from built-in defaults and
//! environment variables (`ENVIRONMENT`, `SERVER_PORT`, `CALLBACK_MAX_ATTEMPTS`,
//! ...). Each component gets its own small config derived from it, so the
//! engine never reads the environment itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::api::middleware::RateLimitConfig;
use crate::engine::circuit_breaker::CircuitBreakerConfig;
use crate::engine::delivery::DeliveryConfig;
use crate::engine::dispatcher::DispatcherConfig;
use crate::{Result, ServiceError};

/// Deployment environment.
///
/// Production enables destination blocking for callbacks and per-IP rate
/// limiting. Development lets callbacks reach loopback and private test
/// endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ServiceError::InvalidInput(format!(
                "unknown environment '{other}' (expected development or production)"
            ))),
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = ServiceError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub environment: Environment,
    pub server_host: String,
    pub server_port: u16,
    pub log_level: String,

    /// Comma-separated list of allowed CORS origins
    pub cors_origins: String,

    pub callback_max_attempts: u32,
    pub callback_timeout_secs: u64,
    pub callback_backoff_base_ms: u64,

    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_secs: u64,

    pub worker_concurrency: usize,
    pub queue_capacity: usize,

    /// Only enforced in production
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,

    /// SQLite database for request records; production falls back to
    /// `DEFAULT_DATABASE_URL` when unset
    pub database_url: Option<String>,
}

/// Database used in production when `DATABASE_URL` is not set
pub const DEFAULT_DATABASE_URL: &str = "sqlite://requests.db?mode=rwc";

impl AppConfig {
    /// Load from defaults and the process environment
    pub fn load() -> Result<Self> {
        Self::from_source(::config::Environment::default().try_parsing(true))
    }

    /// Load from defaults and an arbitrary source (used by tests)
    pub fn from_source<S>(source: S) -> Result<Self>
    where
        S: ::config::Source + Send + Sync + 'static,
    {
        let settings = ::config::Config::builder()
            .set_default("environment", "development")?
            .set_default("server_host", "0.0.0.0")?
            .set_default("server_port", 8000)?
            .set_default("log_level", "info")?
            .set_default("cors_origins", "http://localhost:3000,http://127.0.0.1:3000")?
            .set_default("callback_max_attempts", 3)?
            .set_default("callback_timeout_secs", 10)?
            .set_default("callback_backoff_base_ms", 1000)?
            .set_default("circuit_failure_threshold", 5)?
            .set_default("circuit_cooldown_secs", 60)?
            .set_default("worker_concurrency", 32)?
            .set_default("queue_capacity", 1024)?
            .set_default("rate_limit_max_requests", 50)?
            .set_default("rate_limit_window_secs", 60)?
            .add_source(source)
            .build()?;

        let config: AppConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.callback_max_attempts == 0 {
            return Err(ServiceError::InvalidInput(
                "callback_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.worker_concurrency == 0 || self.queue_capacity == 0 {
            return Err(ServiceError::InvalidInput(
                "worker_concurrency and queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ServiceError::InvalidInput(
                "circuit_failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn cors_origin_list(&self) -> Vec<String> {
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_attempts: self.callback_max_attempts,
            attempt_timeout: Duration::from_secs(self.callback_timeout_secs),
            backoff_base: Duration::from_millis(self.callback_backoff_base_ms),
            ..DeliveryConfig::default()
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: Duration::from_secs(self.circuit_cooldown_secs),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            concurrency: self.worker_concurrency,
            queue_capacity: self.queue_capacity,
        }
    }

    /// Where records are persisted; `None` keeps them in memory
    pub fn storage_url(&self) -> Option<&str> {
        self.database_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .or_else(|| self.environment.is_production().then_some(DEFAULT_DATABASE_URL))
    }

    /// Rate limiting is switched off outside production
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        self.environment.is_production().then(|| RateLimitConfig {
            max_requests: self.rate_limit_max_requests,
            window: Duration::from_secs(self.rate_limit_window_secs),
        })
    }
}
