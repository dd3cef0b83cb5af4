//! API server using Axum

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

use crate::config::ApiServerConfig;
use crate::error::{Result, WardenError};
use crate::proxy::{AssignmentBroker, HealthWorker, Registry};

use super::middleware::cors_layer;
use super::routes;

/// Shared state for API handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub broker: Arc<AssignmentBroker>,
    pub worker: Arc<HealthWorker>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        registry: Arc<Registry>,
        broker: Arc<AssignmentBroker>,
        worker: Arc<HealthWorker>,
    ) -> Self {
        Self {
            registry,
            broker,
            worker,
            started_at: Instant::now(),
        }
    }
}

/// API server
pub struct ApiServer {
    config: ApiServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ApiServerConfig, state: AppState) -> Self {
        Self { config, state }
    }

    pub fn build_router(&self) -> Router {
        routes::create_router(self.state.clone())
            .layer(cors_layer(&self.config.cors_origins))
            .layer(TraceLayer::new_for_http())
    }

    /// Serve until `shutdown` flips
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| WardenError::InvalidConfig(format!("invalid API address: {}", e)))?;

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("API server listening on {}", addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await
            .map_err(|e| WardenError::Internal(e.to_string()))?;

        info!("API server shut down");
        Ok(())
    }
}
