//! Proxy pool handlers

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::api::server::AppState;
use crate::error::WardenError;
use crate::models::{normalize_country, ProxyFilter, ProxyStatus};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Query parameters for listing proxies
#[derive(Debug, Deserialize, Default)]
pub struct ListProxiesQuery {
    pub status: Option<String>,
    pub min_score: Option<u8>,
    pub country: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

impl ListProxiesQuery {
    fn filter(&self) -> Result<ProxyFilter, WardenError> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(ProxyStatus::from_str(raw).ok_or_else(|| {
                let known: Vec<&str> = ProxyStatus::ALL.iter().map(|s| s.as_str()).collect();
                WardenError::InvalidRequest(format!(
                    "unknown status: {} (expected one of {})",
                    raw,
                    known.join(", ")
                ))
            })?),
        };

        Ok(ProxyFilter {
            status,
            min_score: self.min_score,
            country: self.country.clone(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub lines: Vec<String>,
    pub country: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FraudScoreRequest {
    pub fraud_score: u8,
}

/// List proxies, best score first
pub async fn list_proxies(
    State(state): State<AppState>,
    Query(query): Query<ListProxiesQuery>,
) -> Result<impl IntoResponse, WardenError> {
    let filter = query.filter()?;
    let page = state.registry.list_paginated(
        &filter,
        query.page.unwrap_or(1),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
    );
    Ok(Json(page))
}

pub async fn pool_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.stats())
}

pub async fn get_proxy(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, WardenError> {
    state
        .registry
        .get(&key)
        .map(Json)
        .ok_or(WardenError::ProxyNotFound { key })
}

/// Ingest `host:port[:user:pass]` lines; existing entries are left untouched
pub async fn import_proxies(
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> Result<impl IntoResponse, WardenError> {
    if req.lines.is_empty() {
        return Err(WardenError::InvalidRequest("lines must not be empty".to_string()));
    }
    let country = normalize_country(req.country.as_deref())?;

    let report = state.registry.ingest_lines(&req.lines, country.as_deref());
    let status = if report.added > 0 {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(report)))
}

/// Probe one proxy now, bypassing the schedule
pub async fn probe_proxy(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, WardenError> {
    let proxy = state.worker.probe_now(&key).await?;
    Ok(Json(proxy))
}

/// Return a blacklisted proxy to service
pub async fn reset_proxy(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, WardenError> {
    let proxy = state.registry.reset(&key)?;
    Ok(Json(proxy))
}

pub async fn report_fraud_score(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<FraudScoreRequest>,
) -> Result<impl IntoResponse, WardenError> {
    let proxy = state.registry.record_fraud_score(&key, req.fraud_score)?;
    info!(key = %key, fraud_score = req.fraud_score, status = %proxy.status, "Fraud score recorded");
    Ok(Json(proxy))
}

pub async fn delete_proxy(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, WardenError> {
    let proxy = state.registry.remove(&key)?;
    info!(key = %key, "Deleted proxy");
    Ok(Json(json!({ "deleted": proxy.key })))
}

/// Delete every blacklisted proxy
pub async fn delete_failed_proxies(State(state): State<AppState>) -> impl IntoResponse {
    let removed = state.registry.remove_blacklisted();
    info!(count = removed.len(), "Deleted blacklisted proxies");
    Json(json!({
        "removed": removed.len(),
        "keys": removed,
    }))
}
