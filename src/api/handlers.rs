use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::server::AppState;
use crate::scheduler::{get_metrics, QueueMetrics};
use crate::types::{Checkpoint, PdcaTask};

const DEFAULT_LOOKBACK_MINUTES: u32 = 15;
const DEFAULT_RUNNABLE_LIMIT: usize = 20;
const MAX_RUNNABLE_LIMIT: usize = 500;

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub lookback_minutes: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct RunnableQuery {
    pub limit: Option<usize>,
}

pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_queue_metrics(
    State(state): State<AppState>,
    Query(query): Query<MetricsQuery>,
) -> Result<Json<QueueMetrics>, ApiError> {
    let lookback = query.lookback_minutes.unwrap_or(DEFAULT_LOOKBACK_MINUTES);
    let metrics = get_metrics(state.store.as_ref(), Utc::now(), lookback).await?;
    Ok(Json(metrics))
}

pub async fn list_runnable(
    State(state): State<AppState>,
    Query(query): Query<RunnableQuery>,
) -> Result<Json<Vec<PdcaTask>>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUNNABLE_LIMIT)
        .min(MAX_RUNNABLE_LIMIT);
    let tasks = state.store.list_runnable(Utc::now(), limit).await?;
    Ok(Json(tasks))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<PdcaTask>, ApiError> {
    state
        .store
        .get_task(&task_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("task not found: {}", task_id)))
}

pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<Checkpoint>, ApiError> {
    state
        .store
        .get_checkpoint(&task_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no checkpoint for task: {}", task_id)))
}
