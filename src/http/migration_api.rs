//! Migration HTTP API (default port 8082, base `/api/migration`).

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;

use super::ApiError;
use crate::error::Error;
use crate::migration::{MigrationEngine, MigrationTask};
use crate::types::{now_ms, MigrationRecord, MigrationType, TaskStatus};

pub struct MigrationApiState {
    pub engine: Arc<MigrationEngine>,
}

pub fn migration_router(state: Arc<MigrationApiState>) -> Router {
    Router::new()
        .route("/api/migration/trigger", post(trigger))
        .route("/api/migration/records", get(records))
        .route("/api/migration/statistics", get(statistics))
        .route("/api/migration/config", get(config))
        .route("/api/migration/pause", post(pause))
        .route("/api/migration/resume", post(resume))
        .route("/api/migration/estimate", post(estimate))
        .route("/api/migration/health", get(health))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    task_type: String,
    #[serde(default)]
    keys: Option<Vec<String>>,
    #[serde(default, rename = "async")]
    run_async: Option<bool>,
}

async fn trigger(
    State(state): State<Arc<MigrationApiState>>,
    Json(request): Json<TriggerRequest>,
) -> Result<Json<MigrationRecord>, ApiError> {
    let task_type = MigrationType::parse(&request.task_type).ok_or_else(|| {
        ApiError(Error::validation(format!(
            "unknown task_type: {}",
            request.task_type
        )))
    })?;

    // With explicit keys the trigger bypasses candidate selection; without
    // them it runs a full selection sweep on demand.
    let record = match request.keys {
        Some(keys) if !keys.is_empty() => {
            let task = MigrationTask { task_type, keys };
            if request.run_async.unwrap_or(false) {
                state.engine.trigger_async(task)
            } else {
                state.engine.trigger(task).await
            }
        }
        _ => {
            let swept = match task_type {
                MigrationType::HotToCold => state.engine.run_hot_to_cold_sweep().await,
                MigrationType::ColdToHot => state.engine.run_cold_to_hot_sweep().await,
            };
            swept.ok_or_else(|| {
                ApiError(Error::Conflict(
                    "sweep already running or engine paused".to_string(),
                ))
            })?
        }
    };
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct RecordsParams {
    limit: Option<usize>,
    status: Option<String>,
}

async fn records(
    State(state): State<Arc<MigrationApiState>>,
    Query(params): Query<RecordsParams>,
) -> Result<Json<Vec<MigrationRecord>>, ApiError> {
    let status = match params.status.as_deref() {
        None => None,
        Some("RUNNING") => Some(TaskStatus::Running),
        Some("COMPLETED") => Some(TaskStatus::Completed),
        Some("FAILED") => Some(TaskStatus::Failed),
        Some(other) => {
            return Err(ApiError(Error::validation(format!(
                "unknown status filter: {other}"
            ))))
        }
    };

    let mut records = state.engine.records().await;
    if let Some(status) = status {
        records.retain(|r| r.status == status);
    }
    let limit = params.limit.unwrap_or(50);
    if records.len() > limit {
        let skip = records.len() - limit;
        records.drain(0..skip);
    }
    Ok(Json(records))
}

async fn health(State(state): State<Arc<MigrationApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "paused": state.engine.is_paused(),
        "timestamp": now_ms(),
    }))
}

async fn statistics(State(state): State<Arc<MigrationApiState>>) -> impl IntoResponse {
    Json(state.engine.statistics().await)
}

async fn config(State(state): State<Arc<MigrationApiState>>) -> impl IntoResponse {
    Json(state.engine.config().clone())
}

async fn pause(State(state): State<Arc<MigrationApiState>>) -> impl IntoResponse {
    state.engine.pause();
    Json(serde_json::json!({ "paused": true }))
}

async fn resume(State(state): State<Arc<MigrationApiState>>) -> impl IntoResponse {
    state.engine.resume();
    Json(serde_json::json!({ "paused": false }))
}

async fn estimate(
    State(state): State<Arc<MigrationApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let estimate = state.engine.estimate().await?;
    Ok(Json(estimate))
}
