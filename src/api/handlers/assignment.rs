//! Assignment handlers

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::api::server::AppState;
use crate::error::WardenError;
use crate::models::{AcquireRequest, ProxyHandle};

/// Acquire a proxy for an account
pub async fn acquire(
    State(state): State<AppState>,
    Json(req): Json<AcquireRequest>,
) -> Result<impl IntoResponse, WardenError> {
    let proxy = state.broker.acquire(&req)?;
    Ok(Json(ProxyHandle::from(&proxy)))
}

/// Release an account's proxy; releasing nothing is not an error
pub async fn release(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    match state.broker.release(&account_id) {
        Some(proxy) => Json(json!({
            "released": true,
            "key": proxy.key,
            "status": proxy.status,
        })),
        None => Json(json!({ "released": false })),
    }
}
