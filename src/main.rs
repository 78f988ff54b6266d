//! HTLC Swap Coordinator - intent marketplace and cross-chain swap driver
//!
//! Serves the marketplace API, follows HTLC events on every configured ledger
//! and keeps matches in step with what the ledgers report.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use htlc_swap_coordinator::api::{self, AppState};
use htlc_swap_coordinator::clock::{Clock, SystemClock};
use htlc_swap_coordinator::config::Settings;
use htlc_swap_coordinator::coordination::{CoordinationEngine, SwapCoordinator};
use htlc_swap_coordinator::intents::{IntentRegistry, StaticRates};
use htlc_swap_coordinator::ledger::LedgerManager;
use htlc_swap_coordinator::metrics::MetricsServer;
use htlc_swap_coordinator::secret::Commitments;
use htlc_swap_coordinator::store::{MatchingStore, MemoryStore, PostgresStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting HTLC Swap Coordinator v{}", env!("CARGO_PKG_VERSION"));

    let settings = Arc::new(Settings::load()?);
    info!(
        "Loaded configuration for {} networks (hash function {})",
        settings.enabled_networks().len(),
        settings.protocol.hash_function.name()
    );

    let store: Arc<dyn MatchingStore> = match &settings.database {
        Some(database) => {
            let store = PostgresStore::new(database).await?;
            store.run_migrations().await?;
            info!("Database connection established");
            Arc::new(store)
        }
        None => {
            info!("Using in-memory matching store");
            Arc::new(MemoryStore::new())
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let ledgers = Arc::new(LedgerManager::new(&settings, store.clone(), clock.clone()).await?);
    info!("Ledger connections initialized");

    let registry = Arc::new(IntentRegistry::new(
        &settings,
        store.clone(),
        Arc::new(StaticRates::new(settings.rates.clone())),
        clock.clone(),
    ));

    let watcher = ledgers.secret_watcher(settings.coordinator.poll_interval_ms);
    let coordinator = Arc::new(SwapCoordinator::new(
        &settings,
        registry.clone(),
        ledgers.clone(),
        watcher.clone(),
    ));

    let engine = Arc::new(CoordinationEngine::new(
        registry.clone(),
        ledgers.clone(),
        watcher,
        Commitments::new(settings.protocol.hash_function),
        settings.coordinator.sweep_interval_secs,
        settings.coordinator.health_check_interval_secs,
    ));
    info!("Coordination engine initialized");

    let api_handle = tokio::spawn({
        let state = AppState {
            settings: settings.clone(),
            registry: registry.clone(),
            ledgers: ledgers.clone(),
            coordinator,
        };
        let config = settings.api.clone();
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

    let listener_handle = tokio::spawn({
        let ledgers = ledgers.clone();
        async move {
            if let Err(e) = ledgers.start_listeners().await {
                error!("Ledger listener error: {}", e);
            }
        }
    });

    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Coordination engine error: {}", e);
            }
        }
    });

    info!("HTLC Swap Coordinator is running");
    info!("API server: http://{}:{}/api", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    engine.stop().await;
    ledgers.stop().await;

    api_handle.abort();
    listener_handle.abort();
    engine_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("HTLC Swap Coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,htlc_swap_coordinator=debug,sqlx=warn,hyper=warn")
    });

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
