// Sync/Async API - HTTP server
// Run with: cargo run --bin server -- --environment development

//! # Server Binary
//!
//! Loads configuration (`.env`, environment variables, then command-line
//! flags), sets up logging and serves the API until Ctrl-C. On shutdown the
//! listener stops first, then every accepted async request is drained.
//!
//! ## Rust Learning Notes:
//!
//! `main` returns `anyhow::Result`, so any error type from the library or the
//! runtime can be propagated with `?` and printed with its context chain.

use anyhow::Context;
use clap::Parser;
use dotenv::dotenv;
use sync_async_api::{ApiServerBuilder, AppConfig, Environment};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "server")]
#[command(about = "Sync/Async API server - immediate results or callbacks on completion")]
#[command(version)]
struct Args {
    /// Interface to bind
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// development or production
    #[arg(short, long, env = "ENVIRONMENT")]
    environment: Option<Environment>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let dotenv_result = dotenv();

    let args = Args::parse();
    let config = AppConfig::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .init();

    if let Err(e) = dotenv_result {
        info!("No .env file loaded ({}); using process environment", e);
    }

    let mut builder = ApiServerBuilder::new().with_config(config);
    if let Some(host) = args.host {
        builder = builder.with_host(host);
    }
    if let Some(port) = args.port {
        builder = builder.with_port(port);
    }
    if let Some(environment) = args.environment {
        builder = builder.with_environment(environment);
    }

    let server = builder.build().await.context("failed to build server")?;
    server.run().await.context("server exited with an error")?;

    info!("👋 Shutdown complete");
    Ok(())
}
