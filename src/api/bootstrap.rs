use axum::{extract::State, Json};
use serde::Serialize;
use tracing::info;

use crate::core::{AppState, JobRecord, JobStatus};
use crate::models::{
    manager::{self, BootstrapPlan, BootstrapReport},
    snapshot::{self, SnapshotPlan, SnapshotReport},
};

use super::error::ApiError;

pub const CORE_BOOTSTRAP_JOB: &str = "core_bootstrap";

pub async fn plan(State(state): State<AppState>) -> Json<BootstrapPlan> {
    Json(manager::plan(&state.config))
}

/// Runs the whole core bootstrap inside the request.
pub async fn download(State(state): State<AppState>) -> Result<Json<BootstrapReport>, ApiError> {
    let report = tokio::task::spawn_blocking(move || {
        let registry = (state.registry)(state.config.as_ref())?;
        manager::ensure_core_models(&state.config, registry.artifacts())
    })
    .await??;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct JobStarted {
    pub ok: bool,
    pub job: &'static str,
    pub status: JobStatus,
}

pub async fn download_async(State(state): State<AppState>) -> Json<JobStarted> {
    let config = state.config.clone();
    let registry = state.registry.clone();
    let record = state.jobs.start(CORE_BOOTSTRAP_JOB, move || {
        let registry = registry(config.as_ref())?;
        let report = manager::ensure_core_models(&config, registry.artifacts())?;
        Ok(serde_json::to_value(report)?)
    });
    info!("{CORE_BOOTSTRAP_JOB} requested: {:?}", record.status);
    Json(JobStarted {
        ok: true,
        job: CORE_BOOTSTRAP_JOB,
        status: record.status,
    })
}

pub async fn status(State(state): State<AppState>) -> Json<JobRecord> {
    Json(state.jobs.status(CORE_BOOTSTRAP_JOB))
}

pub async fn qwen_plan(State(state): State<AppState>) -> Json<SnapshotPlan> {
    Json(snapshot::plan_qwen(&state.config))
}

pub async fn qwen_download(
    State(state): State<AppState>,
) -> Result<Json<SnapshotReport>, ApiError> {
    let report = tokio::task::spawn_blocking(move || {
        let registry = (state.registry)(state.config.as_ref())?;
        snapshot::ensure_qwen(&state.config, registry.snapshots())
    })
    .await??;
    Ok(Json(report))
}
