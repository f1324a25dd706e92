//! Metadata HTTP API (default port 8081, base `/api/v1/metadata`).

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::ApiError;
use crate::error::Error;
use crate::metadata::MetadataService;
use crate::types::{now_ms, FeatureMetadata, MigrationStatus, StorageTier};

pub struct MetadataApiState {
    pub metadata: Arc<MetadataService>,
}

pub fn metadata_router(state: Arc<MetadataApiState>) -> Router {
    Router::new()
        .route("/api/v1/metadata/{key}", get(get_metadata))
        .route("/api/v1/metadata/{key}", post(upsert_metadata))
        .route("/api/v1/metadata/{key}", put(update_metadata))
        .route("/api/v1/metadata/{key}", delete(delete_metadata))
        .route("/api/v1/metadata/batch", post(batch_get_metadata))
        .route("/api/v1/metadata/batch", put(batch_update_metadata))
        .route("/api/v1/metadata/stats", get(stats))
        .route("/api/v1/metadata/cleanup", post(cleanup_expired))
        .route(
            "/api/v1/metadata/reset-access-counts",
            post(reset_access_counts),
        )
        .route("/health", get(health))
        .with_state(state)
}

/// Writable fields of a metadata row; timestamps are managed server-side.
#[derive(Debug, Deserialize)]
struct MetadataBody {
    storage_tier: StorageTier,
    #[serde(default)]
    access_count: Option<i64>,
    #[serde(default)]
    last_access_time: Option<i64>,
    #[serde(default)]
    expire_time: Option<i64>,
    #[serde(default)]
    data_size: Option<i64>,
    #[serde(default)]
    business_tag: Option<String>,
    #[serde(default)]
    migration_status: Option<MigrationStatus>,
}

impl MetadataBody {
    fn into_record(self, key: String) -> FeatureMetadata {
        let mut meta = FeatureMetadata::new(key, self.storage_tier);
        if let Some(v) = self.access_count {
            meta.access_count = v;
        }
        if let Some(v) = self.last_access_time {
            meta.last_access_time = v;
        }
        meta.expire_time = self.expire_time;
        if let Some(v) = self.data_size {
            meta.data_size = v;
        }
        meta.business_tag = self.business_tag;
        if let Some(v) = self.migration_status {
            meta.migration_status = v;
        }
        meta.update_time = now_ms();
        meta
    }
}

#[derive(Debug, Deserialize)]
struct BatchKeys {
    keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    storage_type: Option<String>,
    business_tag: Option<String>,
}

async fn get_metadata(
    State(state): State<Arc<MetadataApiState>>,
    Path(key): Path<String>,
) -> Result<Json<FeatureMetadata>, ApiError> {
    match state.metadata.get(&key).await? {
        Some(meta) => Ok(Json(meta)),
        None => Err(ApiError(Error::NotFound(key))),
    }
}

async fn upsert_metadata(
    State(state): State<Arc<MetadataApiState>>,
    Path(key): Path<String>,
    Json(body): Json<MetadataBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = body.into_record(key);
    let outcome = state.metadata.upsert(&record).await?;
    Ok(Json(serde_json::json!({
        "key": record.key_name,
        "created": outcome.created,
    })))
}

async fn update_metadata(
    State(state): State<Arc<MetadataApiState>>,
    Path(key): Path<String>,
    Json(body): Json<MetadataBody>,
) -> Result<impl IntoResponse, ApiError> {
    let record = body.into_record(key);
    let updated = state.metadata.update(&record).await?;
    Ok(Json(serde_json::json!({
        "key": record.key_name,
        "updated": updated,
    })))
}

async fn delete_metadata(
    State(state): State<Arc<MetadataApiState>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.metadata.delete(&key).await?;
    Ok(Json(serde_json::json!({
        "key": key,
        "deleted": deleted,
    })))
}

async fn batch_get_metadata(
    State(state): State<Arc<MetadataApiState>>,
    Json(body): Json<BatchKeys>,
) -> Result<Json<HashMap<String, FeatureMetadata>>, ApiError> {
    let resolved = state.metadata.batch_get(&body.keys).await?;
    Ok(Json(resolved))
}

async fn batch_update_metadata(
    State(state): State<Arc<MetadataApiState>>,
    Json(records): Json<Vec<FeatureMetadata>>,
) -> Result<Json<HashMap<String, bool>>, ApiError> {
    let results = state.metadata.batch_update(&records).await?;
    Ok(Json(results))
}

async fn stats(
    State(state): State<Arc<MetadataApiState>>,
    Query(params): Query<StatsParams>,
) -> Result<impl IntoResponse, ApiError> {
    let tier = match params.storage_type.as_deref() {
        None => None,
        Some(s) => Some(
            StorageTier::parse(s)
                .ok_or_else(|| ApiError(Error::validation(format!("unknown storage_type: {s}"))))?,
        ),
    };
    let stats = state
        .metadata
        .stats(tier, params.business_tag.as_deref())
        .await?;
    Ok(Json(stats))
}

async fn cleanup_expired(
    State(state): State<Arc<MetadataApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let cleaned = state.metadata.cleanup_expired(now_ms(), 1_000).await?;
    Ok(Json(serde_json::json!({ "cleaned": cleaned })))
}

async fn reset_access_counts(
    State(state): State<Arc<MetadataApiState>>,
) -> Result<impl IntoResponse, ApiError> {
    let reset = state.metadata.reset_access_counts().await?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

async fn health(State(state): State<Arc<MetadataApiState>>) -> impl IntoResponse {
    let healthy = state.metadata.ping().await.is_ok();
    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "timestamp": now_ms(),
    }))
}
