//! Warden - Entry Point
//!
//! Restores the pool, starts the health worker, background services and the
//! API server, and shuts them down in order on SIGINT/SIGTERM.

use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::api::{ApiServer, AppState};
use warden::models::PoolEvent;
use warden::proxy::{AssignmentBroker, HealthWorker, HttpProber, PriorityScheduler, Registry};
use warden::repository::{ProxyRepository, ProxyStore};
use warden::services::{BlacklistEvictionService, PersistenceService, ServiceHandle};
use warden::{Config, Database};

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("warden={},tower_http=debug", config.log.level).into());

    if config.log.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Load persisted state, then merge in the configured proxy list
async fn populate(registry: &Registry, store: &dyn ProxyStore, config: &Config) -> anyhow::Result<()> {
    match store.load_all().await {
        Ok(records) => {
            let restored = registry.restore(records);
            info!("Restored {} proxies", restored);
        }
        Err(e) => warn!("Could not restore persisted proxies, starting empty: {}", e),
    }

    if let Some(path) = &config.proxy_list_path {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read proxy list {}", path))?;
        let report = registry.ingest_lines(contents.lines(), None);
        info!(
            path = %path,
            added = report.added,
            existing = report.existing,
            invalid = report.invalid.len(),
            "Proxy list loaded"
        );
    }

    Ok(())
}

/// Surface events that need attention from whoever holds the account
async fn log_assignment_alerts(registry: Arc<Registry>) {
    let mut events = registry.subscribe();
    loop {
        match events.recv().await {
            Ok(event) => {
                let Some(account_id) = event.account_id() else {
                    continue;
                };
                let key = event.key();
                match &event {
                    PoolEvent::AssignedProxyDegraded { score, error, .. } => {
                        warn!(key = %key, account_id = %account_id, score = *score, error = ?error, "Assigned proxy degraded");
                    }
                    PoolEvent::AssignedProxyBlacklisted { .. } => {
                        warn!(key = %key, account_id = %account_id, "Assigned proxy blacklisted");
                    }
                    PoolEvent::Removed { .. } => {
                        warn!(key = %key, account_id = %account_id, "Assigned proxy removed");
                    }
                    _ => {}
                }
            }
            Err(RecvError::Lagged(n)) => warn!("Alert listener lagged by {} events", n),
            Err(RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config);

    info!("Starting Warden");

    let db = Database::new(&config.database)
        .await
        .context("failed to connect to database")?;
    let latency = db.health_check().await?;
    info!("Connected to database ({:?} round-trip)", latency);

    db.run_migrations().await?;
    info!("Database migrations complete");

    let registry = Arc::new(Registry::new(config.score_policy(), config.pool.event_capacity));
    let store: Arc<dyn ProxyStore> = Arc::new(ProxyRepository::new(db.pool().clone()));
    populate(&registry, store.as_ref(), &config).await?;

    let broker = Arc::new(AssignmentBroker::new(Arc::clone(&registry)));
    info!("{} assignments carried over", broker.active_assignments());

    let prober = Arc::new(HttpProber::new(config.probe_config()));
    let worker = Arc::new(HealthWorker::new(
        Arc::clone(&registry),
        PriorityScheduler::new(config.scheduler_config()),
        prober,
        config.worker_config(),
    ));
    let worker_handle = Arc::clone(&worker).start();

    // Background services
    let (services, persistence_shutdown) = ServiceHandle::new();
    let persistence = PersistenceService::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        config.persistence_config(),
    );
    let persistence_task = tokio::spawn(async move {
        persistence.run(persistence_shutdown).await;
    });

    let eviction = BlacklistEvictionService::new(Arc::clone(&registry), config.eviction_config());
    let eviction_shutdown = services.subscribe();
    let eviction_task = tokio::spawn(async move {
        eviction.run(eviction_shutdown).await;
    });

    let alerts_task = tokio::spawn(log_assignment_alerts(Arc::clone(&registry)));

    // API server
    let api_server = ApiServer::new(
        config.api.clone(),
        AppState::new(Arc::clone(&registry), broker, Arc::clone(&worker)),
    );
    let api_shutdown = services.subscribe();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api_server.run(api_shutdown).await {
            error!("API server error: {}", e);
        }
    });

    info!("API listening on {}", config.api_addr());

    shutdown_signal().await;
    info!("Shutdown signal received");

    // Stop probing before the last flush so it captures final results
    worker_handle.stop().await;
    services.shutdown();
    let _ = tokio::join!(api_task, eviction_task, persistence_task);
    alerts_task.abort();

    db.close().await;
    info!("Warden stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
