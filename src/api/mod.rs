// HTTP API module
// Exposes the sync and async processing styles side by side over axum

//! # HTTP API
//!
//! | Method | Path              | Purpose                                   |
//! |--------|-------------------|-------------------------------------------|
//! | POST   | `/sync`           | Process and return the result             |
//! | POST   | `/async`          | Accept, return 202, notify a callback URL |
//! | GET    | `/requests`       | List records (`mode`, `limit`, `offset`)  |
//! | GET    | `/requests/:id`   | Fetch one record                          |
//! | GET    | `/stats`          | Engine, rate limit and system statistics  |
//! | GET    | `/healthz`        | Liveness                                  |
//! | POST   | `/test-callback`  | Echo receiver for manual callback testing |
//!
//! In production the two processing routes sit behind a per-client rate
//! limiter.

pub mod handlers;
pub mod middleware;
pub mod types;

#[cfg(test)]
mod handlers_tests;

use axum::{
    http::{header, HeaderValue, Method},
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::config::{AppConfig, Environment};
use crate::engine::service::RequestService;
use crate::{Result, ServiceError};
use handlers::{
    async_request, get_request, health_check, list_requests, not_found, stats, sync_request,
    test_callback, AppState,
};
use middleware::{rate_limit, RateLimiter};

/// API server
pub struct ApiServer {
    config: AppConfig,
    state: AppState,
}

impl ApiServer {
    /// Create a server with an engine built from `config`
    pub async fn new(config: AppConfig) -> Result<Self> {
        let service = Arc::new(RequestService::from_config(&config).await?);
        Ok(Self::with_service(config, service))
    }

    /// Create a server around an existing engine
    pub fn with_service(config: AppConfig, service: Arc<RequestService>) -> Self {
        let mut state = AppState::new(service, config.environment);
        if let Some(limits) = config.rate_limit_config() {
            state = state.with_rate_limiter(Arc::new(RateLimiter::new(limits)));
        }

        Self { config, state }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<RequestService> {
        &self.state.service
    }

    fn cors_layer(&self) -> CorsLayer {
        let origins: Vec<HeaderValue> = self
            .config
            .cors_origin_list()
            .iter()
            .filter_map(|origin| match origin.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();

        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_credentials(true)
    }

    /// Create the Axum router with all routes
    pub fn create_router(&self) -> Router {
        let mut work_routes: Router<AppState> = Router::new()
            .route("/sync", post(sync_request))
            .route("/async", post(async_request));

        if let Some(limiter) = &self.state.rate_limiter {
            work_routes = work_routes.route_layer(from_fn_with_state(limiter.clone(), rate_limit));
        }

        Router::new()
            .merge(work_routes)
            .route("/requests", get(list_requests))
            .route("/requests/:id", get(get_request))
            .route("/stats", get(stats))
            .route("/healthz", get(health_check))
            .route("/test-callback", post(test_callback))
            .fallback(not_found)
            .with_state(self.state.clone())
            .layer(self.cors_layer())
            .layer(TraceLayer::new_for_http())
    }

    /// Run until Ctrl-C, then drain accepted async work
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run until `signal` resolves, then drain accepted async work
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.create_router();
        let addr: SocketAddr = self.config.bind_address().parse().map_err(|e| {
            ServiceError::InvalidInput(format!(
                "invalid bind address {}: {e}",
                self.config.bind_address()
            ))
        })?;

        info!("🚀 Sync/Async API server starting");
        info!("📡 Server address: http://{}", addr);
        info!("🔗 API endpoints:");
        info!("   POST http://{}/sync", addr);
        info!("   POST http://{}/async", addr);
        info!("   GET  http://{}/requests", addr);
        info!("   GET  http://{}/stats", addr);
        info!("   GET  http://{}/healthz", addr);
        info!("📋 Configuration:");
        info!("   Environment: {}", self.config.environment);
        info!(
            "   Storage: {}",
            self.config.storage_url().unwrap_or("in-memory")
        );
        info!(
            "   Rate limiting: {}",
            if self.state.rate_limiter.is_some() { "enabled" } else { "disabled" }
        );
        info!(
            "   Callbacks: {} attempts, {}s timeout",
            self.config.callback_max_attempts, self.config.callback_timeout_secs
        );

        let served = axum::Server::try_bind(&addr)
            .map_err(|e| ServiceError::Internal(format!("failed to bind {addr}: {e}")))?
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(signal)
            .await;

        info!("🛑 HTTP server stopped, draining background work");
        self.state.service.shutdown().await;

        served.map_err(|e| ServiceError::Internal(format!("server error: {e}")))
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Builder pattern for the API server
#[derive(Default)]
pub struct ApiServerBuilder {
    config: Option<AppConfig>,
    host: Option<String>,
    port: Option<u16>,
    environment: Option<Environment>,
    service: Option<Arc<RequestService>>,
}

impl ApiServerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn with_service(mut self, service: Arc<RequestService>) -> Self {
        self.service = Some(service);
        self
    }

    /// Falls back to `AppConfig::load` when no config was given
    pub async fn build(self) -> Result<ApiServer> {
        let mut config = match self.config {
            Some(config) => config,
            None => AppConfig::load()?,
        };

        if let Some(host) = self.host {
            config.server_host = host;
        }
        if let Some(port) = self.port {
            config.server_port = port;
        }
        if let Some(environment) = self.environment {
            config.environment = environment;
        }

        match self.service {
            Some(service) => Ok(ApiServer::with_service(config, service)),
            None => ApiServer::new(config).await,
        }
    }
}
