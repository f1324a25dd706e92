//! Cleanup HTTP API (default port 8083, base `/data-cleaner`).

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use super::ApiError;
use crate::cleanup::{CleanupEngine, CleanupOutcome};
use crate::error::Error;
use crate::types::{now_ms, CleanupType};

pub struct CleanupApiState {
    pub engine: Arc<CleanupEngine>,
}

pub fn cleanup_router(state: Arc<CleanupApiState>) -> Router {
    Router::new()
        .route("/data-cleaner/trigger", post(trigger))
        .route("/data-cleaner/statistics", get(statistics))
        .route("/data-cleaner/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    cleanup_type: String,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

async fn trigger(
    State(state): State<Arc<CleanupApiState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<CleanupOutcome>, ApiError> {
    let cleanup_type = CleanupType::parse(&request.cleanup_type).ok_or_else(|| {
        ApiError(Error::validation(format!(
            "unknown cleanup_type: {}",
            request.cleanup_type
        )))
    })?;

    let outcome = match request.keys {
        Some(keys) if !keys.is_empty() => state.engine.trigger(cleanup_type, &keys).await,
        _ => {
            let dry_run = state.engine.config().dry_run;
            let swept = match cleanup_type {
                CleanupType::Expired => state.engine.run_expired_sweep(dry_run).await,
                CleanupType::Orphan => state.engine.run_orphan_sweep(dry_run).await,
            };
            swept.ok_or_else(|| {
                ApiError(Error::Conflict(
                    "sweep already running or disabled".to_string(),
                ))
            })?
        }
    };
    Ok(Json(outcome))
}

async fn statistics(State(state): State<Arc<CleanupApiState>>) -> impl IntoResponse {
    Json(state.engine.statistics().await)
}

async fn health(State(_state): State<Arc<CleanupApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": now_ms(),
    }))
}
