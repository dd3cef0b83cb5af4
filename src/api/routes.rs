//! API route definitions

use axum::routing::{delete, get, post, put};
use axum::Router;

use super::handlers;
use super::server::AppState;
use super::websocket;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/status", get(handlers::health::status))
        .nest("/api", pool_routes())
        .with_state(state)
}

fn pool_routes() -> Router<AppState> {
    Router::new()
        // Pool management
        .route("/proxies", get(handlers::proxy::list_proxies))
        .route("/proxies/stats", get(handlers::proxy::pool_stats))
        .route("/proxies/import", post(handlers::proxy::import_proxies))
        .route(
            "/proxies/failed",
            delete(handlers::proxy::delete_failed_proxies),
        )
        .route("/proxies/:key", get(handlers::proxy::get_proxy))
        .route("/proxies/:key", delete(handlers::proxy::delete_proxy))
        .route("/proxies/:key/probe", post(handlers::proxy::probe_proxy))
        .route("/proxies/:key/reset", post(handlers::proxy::reset_proxy))
        .route("/proxies/:key/fraud", put(handlers::proxy::report_fraud_score))
        // Assignments
        .route("/assignments", post(handlers::assignment::acquire))
        .route(
            "/assignments/:account_id",
            delete(handlers::assignment::release),
        )
        // WebSocket endpoints
        .route("/ws/events", get(websocket::events::events_ws))
}
