use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use backup_engine::models::{BackupId, BackupRecord, BackupRequest, ClusterRef, StorageTarget};
use backup_engine::ports::RecordStore;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router(_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups).post(create_backup))
        .route("/{namespace}/{cluster}/{timestamp}", get(get_backup))
}

#[derive(Deserialize)]
pub struct ListBackupsQuery {
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub schedule: Option<String>,
}

/// Newest first.
async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListBackupsQuery>,
) -> Result<Json<Vec<BackupRecord>>, AppError> {
    let cluster = query
        .cluster
        .map(|name| ClusterRef::new(query.namespace.as_deref().unwrap_or("default"), name));
    let mut records = state.records.backups_of(cluster, query.schedule).await?;
    records.reverse();
    Ok(Json(records))
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path((namespace, cluster, timestamp)): Path<(String, String, String)>,
) -> Result<Json<BackupRecord>, AppError> {
    let created_at = BackupId::parse_stamp(&timestamp)
        .ok_or_else(|| AppError::BadRequest(format!("invalid timestamp {timestamp}, expected e.g. 20240101T020000Z")))?;
    let id = BackupId::new(ClusterRef::new(namespace, cluster), created_at);
    match state.records.get(&id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(AppError::NotFound("Backup not found".into())),
    }
}

#[derive(Deserialize)]
pub struct CreateBackupRequest {
    pub cluster: ClusterRef,
    #[serde(default)]
    pub collections: Vec<String>,
    /// Defaults to the configured bucket and prefix
    #[serde(default)]
    pub storage: Option<StorageTarget>,
}

/// Start a backup in the background. Returns where its record can be polled.
async fn create_backup(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateBackupRequest>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if state.config.cluster(&body.cluster).is_none() {
        return Err(AppError::NotFound(format!("Cluster {} is not configured", body.cluster)));
    }
    if body.collections.iter().any(|c| c.trim().is_empty()) {
        return Err(AppError::BadRequest("collection names must not be empty".into()));
    }
    if state.shutdown.is_cancelled() {
        return Err(AppError::ServiceUnavailable("operator is shutting down".into()));
    }

    let storage = body.storage.unwrap_or_else(|| state.config.default_storage());
    let request = BackupRequest::new(body.cluster, Utc::now(), storage).with_collections(body.collections);
    let location = format!(
        "/api/backups/{}/{}/{}",
        request.id.cluster.namespace,
        request.id.cluster.name,
        request.id.stamp()
    );
    let response = json!({
        "name": request.name,
        "cluster": request.id.cluster,
        "createdAt": request.id.created_at,
        "location": location,
    });

    let backups = state.backups.clone();
    let cancel = state.shutdown.clone();
    state.tasks.spawn(async move {
        let name = request.name.clone();
        match backups.execute(request, &cancel).await {
            Ok(record) => tracing::info!(backup = %name, phase = %record.phase, "Manual backup finished"),
            Err(e) => tracing::error!(backup = %name, error = %e, "Manual backup did not finish"),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(response)))
}
