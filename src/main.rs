//! Escrow Relayer - unattended custodial escrow with on-chain forwarding
//!
//! Watches deposits into the escrow wallet, validates them against the
//! declared intent, and forwards the net amount to the destination once the
//! deposit is final.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod error;
mod lifecycle;
mod metrics;
mod state;
mod tx;

#[cfg(test)]
mod test_utils;

use chain::{ChainGateway, ChainProvider};
use config::Settings;
use error::EscrowError;
use lifecycle::{EscrowService, LifecycleEngine};
use metrics::MetricsServer;
use state::LedgerStore;
use tx::Forwarder;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Escrow Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration with {} RPC endpoint(s)",
        settings.chain.rpc_urls.len()
    );

    // Open the ledger; on-disk state is ground truth after a restart
    let ledger = Arc::new(LedgerStore::open(&settings.ledger.path)?);
    info!("Ledger opened at {:?}", ledger.path());

    // Initialize chain provider
    let gateway: Arc<dyn ChainGateway> = Arc::new(ChainProvider::new(&settings.chain)?);
    info!("Chain provider initialized");

    // Escrow wallet
    let wallet = tx::load_wallet(&settings.wallet)?;
    let forwarder = Arc::new(Forwarder::new(
        gateway.clone(),
        ledger.clone(),
        wallet,
        settings.chain.chain_id,
    ));
    let escrow_address = forwarder.escrow_address();

    let node_chain_id = match forwarder.chain_id().await {
        Ok(chain_id) => {
            info!("Connected to chain {}", chain_id);
            Some(chain_id)
        }
        Err(e @ EscrowError::Config(_)) => return Err(e.into()),
        Err(e) => {
            warn!("Chain id unavailable at startup, checked again before signing: {}", e);
            None
        }
    };

    let engine = Arc::new(LifecycleEngine::new(
        gateway.clone(),
        ledger.clone(),
        forwarder.clone(),
        settings.relayer.clone(),
    ));

    let service = Arc::new(EscrowService::new(
        ledger.clone(),
        settings.relayer.fee_basis_points,
        settings.api.admin_token().map(str::to_string),
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = api::AppState {
            service: service.clone(),
            escrow_address,
            chain_id: node_chain_id,
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start lifecycle engine
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Lifecycle engine error: {}", e);
            }
        }
    });

    info!("Escrow Relayer is running, escrow wallet {:?}", escrow_address);
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Let an in-flight cycle finish so its last write lands
    engine.stop();
    if let Err(e) = engine_handle.await {
        warn!("Lifecycle engine task ended abnormally: {}", e);
    }

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Escrow Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,escrow_relayer=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
