use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use backup_engine::models::{ClusterRef, ScheduleSpec, ScheduleState, StorageTarget};
use backup_engine::retention::RetentionPolicy;
use serde::Serialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_schedules))
        .route("/{name}", get(get_schedule))
        .route("/{name}/suspend", post(suspend_schedule))
        .route("/{name}/resume", post(resume_schedule))
}

/// A configured schedule together with its last persisted state.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleView {
    pub name: String,
    pub cluster: ClusterRef,
    pub schedule: String,
    pub storage: StorageTarget,
    pub collections: Vec<String>,
    pub retention: RetentionPolicy,
    pub suspend: bool,
    pub status: ScheduleState,
}

fn spec<'a>(state: &'a AppState, name: &str) -> Result<&'a ScheduleSpec, AppError> {
    state
        .config
        .schedules
        .iter()
        .find(|s| s.name == name)
        .ok_or_else(|| AppError::NotFound("Schedule not found".into()))
}

fn view(spec: &ScheduleSpec, status: ScheduleState) -> ScheduleView {
    ScheduleView {
        name: spec.name.clone(),
        cluster: spec.cluster.clone(),
        schedule: spec.schedule.expression().to_string(),
        storage: spec.storage.clone(),
        collections: spec.collections.clone(),
        retention: spec.retention.clone(),
        suspend: spec.suspend || status.suspended,
        status,
    }
}

async fn list_schedules(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ScheduleView>>, AppError> {
    let mut views = Vec::with_capacity(state.config.schedules.len());
    for spec in &state.config.schedules {
        views.push(view(spec, state.coordinator.state(spec).await?));
    }
    Ok(Json(views))
}

async fn get_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ScheduleView>, AppError> {
    let spec = spec(&state, &name)?;
    Ok(Json(view(spec, state.coordinator.state(spec).await?)))
}

/// Stop firing and pruning until resumed. Survives restarts.
async fn suspend_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ScheduleView>, AppError> {
    let spec = spec(&state, &name)?;
    let status = state.coordinator.set_suspended(spec, true).await?;
    Ok(Json(view(spec, status)))
}

async fn resume_schedule(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<ScheduleView>, AppError> {
    let spec = spec(&state, &name)?;
    let status = state.coordinator.set_suspended(spec, false).await?;
    Ok(Json(view(spec, status)))
}
