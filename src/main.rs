//! txm-relayer daemon: runs the transaction manager for one chain with its
//! HTTP API and metrics endpoint.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use txm_relayer::api::{self, AppState};
use txm_relayer::chain::{ChainClient, EthersChainClient};
use txm_relayer::config::{Settings, StoreBackend};
use txm_relayer::keystore::LocalKeystore;
use txm_relayer::metrics::MetricsServer;
use txm_relayer::store::{MemoryTxStore, PgTxStore, TxStore};
use txm_relayer::TxManager;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting txm-relayer v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load().context("Failed to load configuration")?;
    info!(
        "Loaded configuration for chain {} ({})",
        settings.chain.name, settings.txm.chain_id
    );

    let store: Arc<dyn TxStore> = match settings.database.backend {
        StoreBackend::Postgres => {
            let store = PgTxStore::new(&settings.database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            info!("Database migrations complete");
            Arc::new(store)
        }
        StoreBackend::Memory => {
            warn!("Using in-memory store, transactions will not survive a restart");
            Arc::new(MemoryTxStore::new())
        }
    };

    let keystore = Arc::new(LocalKeystore::from_env(
        &settings.keys.private_keys_env,
        settings.keys.disabled_addresses.clone(),
    )?);

    let ethers_client = Arc::new(EthersChainClient::new(settings.txm.chain_id, &settings.chain)?);
    let client: Arc<dyn ChainClient> = ethers_client.clone();
    info!("Chain connection initialized");

    let manager = Arc::new(TxManager::new(
        settings.txm.clone(),
        store.clone(),
        client.clone(),
        keystore,
        None,
    ));
    manager.start().await?;

    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            store: store.clone(),
            client: client.clone(),
            chain_id: settings.txm.chain_id,
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

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

    let health_handle = tokio::spawn({
        let store = store.clone();
        let client = ethers_client.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;

                if !client.health_check().await {
                    warn!("Chain health check failed");
                }
                if let Err(e) = store.health_check().await {
                    warn!("Database health check failed: {}", e);
                }
            }
        }
    });

    info!("txm-relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    manager.stop().await;

    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("txm-relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,txm_relayer=debug,sqlx=warn,hyper=warn"));

    let json = std::env::var("TXM_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
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
