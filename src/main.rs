//! Transaction submitter service
//!
//! Accepts signed transactions over HTTP, broadcasts them one at a time through
//! the submission queue, and reports each outcome once the chain stops listing
//! the transaction as pending.

use anyhow::{Context, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tx_submitter::api::{self, AppState};
use tx_submitter::chain::ChainManager;
use tx_submitter::config::{LoggingConfig, Settings};
use tx_submitter::metrics::{self, MetricsServer};
use tx_submitter::tx::{NonceTracker, RawTransactionSender, TransactionQueue};

/// Seconds between chain health checks
const HEALTH_CHECK_INTERVAL_SECS: u64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::load()?;

    // Initialize logging
    init_logging(&settings.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting transaction submitter");
    info!(chains = settings.enabled_chains().len(), "Loaded configuration");

    let shutdown = CancellationToken::new();

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        let shutdown = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown).await {
                error!(error = %e, "Metrics server error");
            }
        }))
    } else {
        None
    };

    // Initialize chain manager (handles all chain connections)
    let chain_manager =
        Arc::new(ChainManager::new(&settings).context("Failed to initialize chains")?);
    info!("Chain connections initialized");

    // One nonce tracker per chain
    let nonce_trackers = Arc::new(DashMap::new());
    for chain_id in chain_manager.connected_chains() {
        let provider = chain_manager.get_provider(chain_id)?;
        nonce_trackers.insert(chain_id, Arc::new(NonceTracker::new(provider)));
    }

    // Start the submission queue
    let (queue, worker) = TransactionQueue::from_config(&settings.queue, chain_manager.clone());
    let worker_handle = worker.spawn();

    let sender = Arc::new(RawTransactionSender::new(
        chain_manager.clone(),
        settings.sender.clone(),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            queue: queue.clone(),
            nonce_trackers,
            chain_manager: chain_manager.clone(),
            sender,
            started_at: Utc::now(),
        };
        let config = settings.api.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = api::run_server(config, state, shutdown).await {
                error!(error = %e, "API server error");
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(
                    HEALTH_CHECK_INTERVAL_SECS,
                ))
                .await;

                let health = chain_manager.health_check().await;
                let unhealthy = health.iter().filter(|(_, healthy)| !healthy).count();
                if unhealthy > 0 {
                    warn!(unhealthy, total = health.len(), "Chains unhealthy");
                }

                metrics::record_health_check();
            }
        }
    });

    info!("Transaction submitter is running");
    info!(host = %settings.api.host, port = settings.api.port, "API server listening");
    if settings.metrics.enabled {
        info!(port = settings.metrics.port, "Metrics exported at /metrics");
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Answer everything still buffered before the servers go away
    queue.stop();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Queue worker terminated abnormally");
    }

    shutdown.cancel();
    health_handle.abort();
    if let Err(e) = api_handle.await {
        warn!(error = %e, "API server task ended abnormally");
    }
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Transaction submitter stopped");
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tx_submitter=debug,hyper=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
