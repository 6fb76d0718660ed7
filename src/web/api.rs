//! REST API handlers

use super::AppState;
use crate::content::EntityKind;
use crate::error::SyncError;
use crate::index::{ReindexOptions, ReindexReport};
use crate::registry::{DispatchReport, IndexFilter, IndexSummary, SearchSync, StatsSnapshot};
use crate::watcher::ContentEvent;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::{RwLockReadGuard, RwLockWriteGuard};
use tracing::info;

type ApiError = (StatusCode, String);

#[derive(Debug, Deserialize)]
pub struct IndicesQuery {
    enabled: Option<bool>,
    /// "posts", "terms" or "users"
    contains: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReindexQuery {
    max_pages: Option<usize>,
    page_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateIndexRequest {
    enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct IndicesResponse {
    pub indices: Vec<IndexSummary>,
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counters: StatsSnapshot,
    pub indices: usize,
    pub enabled_indices: usize,
    pub watchers: usize,
    pub sync_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

fn read(state: &AppState) -> Result<RwLockReadGuard<'_, SearchSync>, ApiError> {
    state.read().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to acquire sync lock: {}", e),
        )
    })
}

fn write(state: &AppState) -> Result<RwLockWriteGuard<'_, SearchSync>, ApiError> {
    state.write().map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to acquire sync lock: {}", e),
        )
    })
}

fn error_response(e: SyncError) -> ApiError {
    let status = match &e {
        e if e.is_remote() => StatusCode::BAD_GATEWAY,
        SyncError::Configuration(_) => StatusCode::BAD_REQUEST,
        SyncError::DriftDetected { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, e.to_string())
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Background task failed: {}", e),
    )
}

pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn stats_handler(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let sync = read(&state)?;
    let all = sync.get_indices(&IndexFilter::default());
    Ok(Json(StatsResponse {
        counters: sync.stats().snapshot(),
        indices: all.len(),
        enabled_indices: all.iter().filter(|i| i.is_enabled()).count(),
        watchers: sync.watcher_ids().len(),
        sync_enabled: sync.is_sync_enabled(),
    }))
}

pub async fn indices_handler(
    State(state): State<AppState>,
    Query(params): Query<IndicesQuery>,
) -> Result<Json<IndicesResponse>, ApiError> {
    let contains = params
        .contains
        .as_deref()
        .map(|s| s.parse::<EntityKind>())
        .transpose()
        .map_err(error_response)?;
    let filter = IndexFilter {
        enabled: params.enabled,
        contains,
    };

    let sync = read(&state)?;
    let indices: Vec<IndexSummary> = sync
        .get_indices(&filter)
        .iter()
        .map(|i| sync.summary(i))
        .collect();
    let total = indices.len();
    Ok(Json(IndicesResponse { indices, total }))
}

pub async fn index_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<IndexSummary>, ApiError> {
    let sync = read(&state)?;
    match sync.get_index(&id) {
        Some(index) => Ok(Json(sync.summary(&index))),
        None => Err((StatusCode::NOT_FOUND, format!("Unknown index: {}", id))),
    }
}

/// Enable or disable an index, attaching or detaching its watcher
pub async fn update_index_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateIndexRequest>,
) -> Result<Json<IndexSummary>, ApiError> {
    let mut sync = write(&state)?;
    let Some(index) = sync.get_index(&id) else {
        return Err((StatusCode::NOT_FOUND, format!("Unknown index: {}", id)));
    };
    sync.set_index_enabled(&id, request.enabled)
        .map_err(error_response)?;
    info!(index = %id, enabled = request.enabled, "Index updated over HTTP");
    Ok(Json(sync.summary(&index)))
}

pub async fn reindex_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReindexQuery>,
) -> Result<Json<ReindexReport>, ApiError> {
    if read(&state)?.get_index(&id).is_none() {
        return Err((StatusCode::NOT_FOUND, format!("Unknown index: {}", id)));
    }

    let mut options = ReindexOptions {
        max_pages: params.max_pages,
        ..Default::default()
    };
    if let Some(page_size) = params.page_size {
        options.page_size = page_size.clamp(1, 1000);
    }

    info!(index = %id, "Reindex requested over HTTP");
    let report = tokio::task::spawn_blocking(move || {
        let sync = read(&state)?;
        sync.reindex(&id, &options, |_| {}).map_err(error_response)
    })
    .await
    .map_err(join_error)??;

    Ok(Json(report))
}

pub async fn events_handler(
    State(state): State<AppState>,
    Json(events): Json<Vec<ContentEvent>>,
) -> Result<Json<DispatchReport>, ApiError> {
    let report = tokio::task::spawn_blocking(move || {
        let sync = read(&state)?;
        Ok::<_, ApiError>(sync.dispatch_burst(&events))
    })
    .await
    .map_err(join_error)??;

    Ok(Json(report))
}
