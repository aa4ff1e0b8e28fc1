//! DB HTTP Gateway - Main entry point.
//!
//! Loads the JSON config, builds one pool per alias, and serves statement
//! batches over HTTP until SIGINT/SIGTERM.

use clap::Parser;
use db_http_gateway::config::{Cli, GatewayConfig};
use db_http_gateway::db::{MacroCache, PoolRegistry, StatementExecutor};
use db_http_gateway::transport::{HttpSettings, HttpTransport, Transport};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = match GatewayConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!();
            eprintln!("Usage: db-http-gateway --config <path/to/config.json>");
            std::process::exit(1);
        }
    };

    info!(
        config = %cli.config.display(),
        aliases = config.db_aliases.len(),
        clusters = config.clusters.len(),
        "Starting DB HTTP Gateway v{}",
        env!("CARGO_PKG_VERSION")
    );

    let registry = Arc::new(PoolRegistry::from_config(&config)?);
    if cli.skip_connect_check {
        info!("Skipping startup connection check");
    } else {
        registry.probe_all().await?;
    }

    let macros = Arc::new(match &config.macro_path {
        Some(path) => MacroCache::with_root(path),
        None => MacroCache::new(),
    });
    if macros.root().is_some() {
        macros.reload()?;
    }

    let executor = Arc::new(
        StatementExecutor::with_checkout_timeout(config.checkout_timeout_duration())
            .with_macros(macros.clone()),
    );

    let transport = HttpTransport::new(
        registry,
        executor,
        macros,
        HttpSettings {
            host: config.server_host.clone(),
            port: config.server_port,
            use_gzip: config.use_gzip,
            max_concurrent_requests: config.max_concurrent_requests,
        },
    );

    info!(
        transport = transport.name(),
        max_concurrent_requests = config.max_concurrent_requests,
        gzip = config.use_gzip,
        "Serving requests"
    );
    if let Err(e) = transport.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}
