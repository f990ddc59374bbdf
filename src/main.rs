//! Fusion coordinator - cross-chain HTLC swap coordination between EVM and NEAR
//!
//! Accepts Dutch-auction orders from makers, lets resolvers claim and fill
//! them, verifies both escrows on chain and releases secrets when safe.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use fusion_coordinator::api::{self, AppState};
use fusion_coordinator::chain::ChainRegistry;
use fusion_coordinator::config::{Settings, StoreBackend};
use fusion_coordinator::coordination::CoordinationEngine;
use fusion_coordinator::metrics::{self, MetricsServer};
use fusion_coordinator::store::{MemoryStore, OrderStore, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Fusion Coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for instance {}",
        settings.coordinator.instance_id
    );

    // Initialize order store
    let store: Arc<dyn OrderStore> = match (&settings.coordinator.store, &settings.database) {
        (StoreBackend::Postgres, Some(database)) => {
            let store = PostgresStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
        (StoreBackend::Postgres, None) => {
            anyhow::bail!("store = \"postgres\" requires a [database] section")
        }
        (StoreBackend::Memory, _) => {
            warn!("Using in-memory order store; orders are lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Connect chains
    let chains = Arc::new(ChainRegistry::from_settings(&settings).await?);
    info!("Chain connections initialized: {:?}", chains.families());

    // Initialize coordination engine
    let engine = Arc::new(CoordinationEngine::new(
        store.clone(),
        chains.clone(),
        &settings,
    ));
    info!("Coordination engine initialized");

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            engine: engine.clone(),
            chains: chains.clone(),
            store: store.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Start coordination engine
    let coordination_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let chains = chains.clone();
        let store = store.clone();
        let interval = settings.coordinator.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = true;
                for (family, chain_ok) in chains.health_check().await {
                    if !chain_ok {
                        warn!("Chain {} health check failed", family);
                        healthy = false;
                    }
                }

                if let Err(e) = store.health_check().await {
                    warn!("Order store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("Fusion Coordinator is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    coordination_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Fusion Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,fusion_coordinator=debug,sqlx=warn,hyper=warn")
    });

    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
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
