use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::db::SqliteRecordStore;
use backup_engine::ports::{BlobStore, ClusterControlPlane, CredentialResolver, SnapshotProvider};
use backup_engine::{BackupOrchestrator, Collaborators, RestoreOrchestrator, ScheduleCoordinator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub records: Arc<SqliteRecordStore>,
    pub backups: Arc<BackupOrchestrator>,
    pub restores: Arc<RestoreOrchestrator>,
    pub coordinator: ScheduleCoordinator,
    /// Backups and restores started by the API or the ticker
    pub tasks: TaskTracker,
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: AppConfig,
        control: Arc<dyn ClusterControlPlane>,
        snapshots: Arc<dyn SnapshotProvider>,
        blobs: Arc<dyn BlobStore>,
        credentials: Arc<dyn CredentialResolver>,
    ) -> Self {
        let records = Arc::new(SqliteRecordStore::new(db.clone()));
        let collaborators = Collaborators {
            control,
            snapshots,
            blobs: blobs.clone(),
            credentials,
            records: records.clone(),
        };
        let backups = Arc::new(BackupOrchestrator::new(&collaborators, &config.engine));
        let restores = Arc::new(RestoreOrchestrator::new(&collaborators, &config.engine));
        let coordinator = ScheduleCoordinator::new(backups.clone(), records.clone(), blobs, records.clone());

        Self {
            db,
            config,
            records,
            backups,
            restores,
            coordinator,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }
}
