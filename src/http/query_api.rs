//! Router HTTP API (default port 8080, base `/api/v1`).

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

use super::rate_limit::IpRateLimiter;
use super::ApiError;
use crate::error::Error;
use crate::router::QueryRouter;
use crate::types::{FeatureResult, QueryOptions, QuerySummary, StorageTier};

pub struct QueryApiState {
    pub router: Arc<QueryRouter>,
    pub limiter: IpRateLimiter,
}

/// Build the router-facing API.
pub fn query_router(state: Arc<QueryApiState>) -> Router {
    Router::new()
        .route("/api/v1/feature/{key}", get(get_feature))
        .route("/api/v1/feature/{key}", put(put_feature))
        .route("/api/v1/features/batch", post(batch_features))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct GetParams {
    include_metadata: Option<bool>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BatchRequest {
    keys: Vec<String>,
    #[serde(default)]
    options: BatchOptions,
}

#[derive(Debug, Default, Deserialize)]
struct BatchOptions {
    include_metadata: Option<bool>,
    timeout_ms: Option<u64>,
    user_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    results: Vec<FeatureResult>,
    summary: QuerySummary,
}

#[derive(Debug, Deserialize)]
struct PutRequest {
    value: String,
    ttl: Option<u64>,
    storage_hint: Option<String>,
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
}

fn parse_hint(hint: Option<&str>) -> Result<Option<StorageTier>, Error> {
    match hint {
        None => Ok(None),
        Some("hot") => Ok(Some(StorageTier::Hot)),
        Some("cold") => Ok(Some(StorageTier::Cold)),
        Some(other) => Err(Error::validation(format!(
            "unknown storage_hint: {other} (expected \"hot\" or \"cold\")"
        ))),
    }
}

async fn get_feature(
    State(state): State<Arc<QueryApiState>>,
    Path(key): Path<String>,
    Query(params): Query<GetParams>,
    headers: HeaderMap,
) -> Result<Json<FeatureResult>, ApiError> {
    let opts = QueryOptions {
        include_metadata: params.include_metadata.unwrap_or(false),
        timeout_ms: params.timeout_ms,
        client_ip: client_ip(&headers),
        user_id: None,
    };
    let result = state.router.get(&key, &opts).await?;
    Ok(Json(result))
}

async fn batch_features(
    State(state): State<Arc<QueryApiState>>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<Json<BatchResponse>, ApiError> {
    let opts = QueryOptions {
        include_metadata: request.options.include_metadata.unwrap_or(false),
        timeout_ms: request.options.timeout_ms,
        client_ip: client_ip(&headers),
        user_id: request.options.user_id,
    };
    let (results, summary) = state.router.batch_get(&request.keys, &opts).await?;
    Ok(Json(BatchResponse { results, summary }))
}

async fn put_feature(
    State(state): State<Arc<QueryApiState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
    Json(request): Json<PutRequest>,
) -> Result<Response, ApiError> {
    if let Some(ip) = client_ip(&headers).and_then(|s| s.parse::<IpAddr>().ok()) {
        if let Err(exceeded) = state.limiter.check(ip) {
            let retry_after_secs = exceeded.retry_after.as_secs().max(1);
            warn!(
                "Rate limited write from {}, retry after {}s",
                ip, retry_after_secs
            );
            let body = serde_json::json!({
                "error": "rate limit exceeded",
                "retry_after_ms": exceeded.retry_after.as_millis() as u64,
            });
            return Ok((
                StatusCode::TOO_MANY_REQUESTS,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                Json(body),
            )
                .into_response());
        }
    }

    let hint = parse_hint(request.storage_hint.as_deref())?;
    let outcome = state
        .router
        .put(&key, &request.value, request.ttl, hint)
        .await?;
    Ok(Json(outcome).into_response())
}

async fn health(State(state): State<Arc<QueryApiState>>) -> impl IntoResponse {
    Json(state.router.health().await)
}

async fn metrics(State(state): State<Arc<QueryApiState>>) -> impl IntoResponse {
    Json(state.router.telemetry().await)
}
