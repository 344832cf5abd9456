use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::models::{ClusterRef, CollectionMapping, RestoreRecord, RestoreRequest, RestoreSource};
use backup_engine::EngineError;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_restores).post(create_restore))
        .route("/{name}", get(get_restore))
}

async fn list_restores(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RestoreRecord>>, AppError> {
    Ok(Json(state.records.restores().await?))
}

async fn get_restore(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<RestoreRecord>, AppError> {
    match state.records.restore(&name).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound("Restore not found".into())),
    }
}

fn default_wait_for_indexing() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRestoreRequest {
    /// Generated when omitted
    #[serde(default)]
    pub name: Option<String>,
    pub target: ClusterRef,
    pub source: RestoreSource,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub mapping: CollectionMapping,
    #[serde(default = "default_wait_for_indexing")]
    pub wait_for_indexing: bool,
}

/// Record the restore as in progress and run it in the background.
async fn create_restore(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRestoreRequest>,
) -> Result<(StatusCode, Json<RestoreRecord>), AppError> {
    body.mapping.validate()?;
    body.mapping.check_targets(body.collections.as_slice())?;
    if state.config.cluster(&body.target).is_none() {
        return Err(AppError::NotFound(format!("Cluster {} is not configured", body.target)));
    }
    if state.shutdown.is_cancelled() {
        return Err(AppError::ServiceUnavailable("operator is shutting down".into()));
    }

    let name = body
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| format!("restore-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]));
    let request = RestoreRequest {
        name,
        target: body.target,
        source: body.source,
        collections: body.collections,
        mapping: body.mapping,
        wait_for_indexing: body.wait_for_indexing,
    };

    let pending = RestoreRecord::start(&request, Utc::now());
    if !state.records.create_restore(&pending).await? {
        return Err(AppError::Conflict(format!("Restore {} already exists", request.name)));
    }

    let restores = state.restores.clone();
    let records = state.records.clone();
    let cancel = state.shutdown.clone();
    let started_at = pending.started_at;
    let mut fallback = pending.clone();
    state.tasks.spawn(async move {
        let name = request.name.clone();
        let finished = match restores.execute(request, &cancel).await {
            Ok(mut record) => {
                record.started_at = started_at;
                tracing::info!(restore = %name, phase = ?record.phase, "Restore finished");
                record
            }
            Err(e) => {
                let reason = match e {
                    EngineError::Cancelled => "restore interrupted by shutdown".to_string(),
                    other => other.to_string(),
                };
                tracing::error!(restore = %name, error = %reason, "Restore did not finish");
                fallback.fail(reason, Utc::now());
                fallback
            }
        };
        if let Err(e) = records.save_restore(&finished).await {
            tracing::error!(restore = %name, error = %e, "Failed to save restore record");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(pending)))
}
