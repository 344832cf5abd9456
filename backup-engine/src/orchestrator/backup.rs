use super::{dedup, fan_out, resolve_connection, Collaborators};
use crate::config::EngineConfig;
use crate::models::{BackupId, BackupRecord, BackupRequest, CollectionOutcome};
use crate::ports::{Admission, BlobStore, ClusterControlPlane, CredentialResolver, RecordFilter, RecordStore};
use crate::transfer::{RetryPolicy, SnapshotTransferWorker, TransferTarget};
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use futures_util::TryStreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How far a backup's creation time may move to get past identities taken by
/// other backups of the same cluster.
const MAX_IDENTITY_SHIFT_SECS: u32 = 60;

enum Admitted {
    /// Newly recorded, possibly under a later identity than requested
    Started(BackupRequest, BackupRecord),
    /// This backup was recorded before
    Known(BackupRecord),
}

pub struct BackupOrchestrator {
    control: Arc<dyn ClusterControlPlane>,
    credentials: Arc<dyn CredentialResolver>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    worker: SnapshotTransferWorker,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl BackupOrchestrator {
    pub fn new(collaborators: &Collaborators, config: &EngineConfig) -> Self {
        let retry = RetryPolicy::from_config(config);
        Self {
            control: collaborators.control.clone(),
            credentials: collaborators.credentials.clone(),
            records: collaborators.records.clone(),
            blobs: collaborators.blobs.clone(),
            worker: SnapshotTransferWorker::new(
                collaborators.snapshots.clone(),
                collaborators.blobs.clone(),
                retry.clone(),
            ),
            retry,
            max_concurrency: config.max_concurrency,
        }
    }

    /// Run the backup identified by `request.id` unless it already exists.
    ///
    /// A record of the same name that is already present, finished or not,
    /// is returned as stored without touching the cluster. A record of another
    /// name holding the identity (two schedules of one cluster firing in the
    /// same second) moves this backup one second later. If `cancel` fires,
    /// transfers already running are allowed to finish, their uploads are
    /// removed, the record is marked `Failed` and `Cancelled` is returned.
    pub async fn execute(&self, request: BackupRequest, cancel: &CancellationToken) -> Result<BackupRecord> {
        let (request, mut record) = match self.admit(request).await? {
            Admitted::Started(request, record) => (request, record),
            Admitted::Known(record) => {
                if record.phase.is_terminal() {
                    info!("Backup {} already finished as {}", record.id, record.phase);
                } else {
                    info!("Backup {} is already in progress", record.id);
                }
                return Ok(record);
            }
        };
        let running = record.clone();

        info!(backup = %record.id, name = %record.name, "Starting backup");

        match self.prepare(&request, &record).await {
            Ok((_, collections)) if collections.is_empty() => {
                warn!("Backup {} found no collections", record.id);
                record.fail("no collections to back up", Utc::now());
            }
            Ok((target, collections)) => {
                info!("Backing up {} collections of {}", collections.len(), record.id.cluster);
                let (target, worker) = (&target, &self.worker);
                let outcomes = fan_out(collections, self.max_concurrency, move |collection: String| async move {
                    if cancel.is_cancelled() {
                        return CollectionOutcome::failed(&collection, &EngineError::Cancelled);
                    }
                    worker.transfer(target, &collection).await
                })
                .await;
                record.finish(outcomes, Utc::now());
            }
            Err(e) => {
                error!(backup = %record.id, error = %e, "Backup could not start");
                record.fail(format!("failed to prepare backup: {e}"), Utc::now());
            }
        }

        if cancel.is_cancelled() {
            warn!("Backup {} cancelled; result discarded", record.id);
            if let Err(e) = self.abandon(running, "backup cancelled before it finished").await {
                error!(backup = %record.id, error = %e, "Failed to record cancelled backup");
            }
            return Err(EngineError::Cancelled);
        }

        self.records.save(&record).await?;
        match &record.error {
            None => info!(backup = %record.id, size = %record.total_size(), "Backup completed"),
            Some(e) => warn!(backup = %record.id, phase = %record.phase, "Backup finished with errors: {}", e),
        }
        Ok(record)
    }

    /// Fail every backup still recorded as running and remove what it uploaded.
    ///
    /// Only safe before this process dispatches any backup: a record left
    /// `InProgress` then belongs to a run that can no longer finish.
    pub async fn fail_interrupted(&self) -> Result<Vec<BackupId>> {
        let running: Vec<BackupRecord> = self
            .records
            .list(&RecordFilter::all())
            .await?
            .into_iter()
            .filter(|r| !r.phase.is_terminal())
            .collect();

        let mut failed = Vec::with_capacity(running.len());
        for record in running {
            let id = record.id.clone();
            match self.abandon(record, "backup interrupted by an operator restart").await {
                Ok(_) => failed.push(id),
                Err(e) => warn!(backup = %id, error = %e, "Could not fail interrupted backup"),
            }
        }
        Ok(failed)
    }

    /// Create the record for `request`, moving its creation time forward
    /// while the identity belongs to a differently named backup.
    async fn admit(&self, mut request: BackupRequest) -> Result<Admitted> {
        for _ in 0..=MAX_IDENTITY_SHIFT_SECS {
            match self.records.create_if_absent(BackupRecord::start(&request, Utc::now())).await? {
                Admission::Created(record) => return Ok(Admitted::Started(request, record)),
                Admission::Existing(record) if record.name == request.name => return Ok(Admitted::Known(record)),
                Admission::Existing(other) => {
                    debug!("Backup identity {} is held by {}; {} moves one second later", other.id, other.name, request.name);
                    request.id = request.id.next_second();
                }
            }
        }
        Err(EngineError::Store(format!(
            "no free backup identity for {} within {MAX_IDENTITY_SHIFT_SECS}s",
            request.name
        )))
    }

    /// Delete the blobs under `record`'s location and store it as `Failed`.
    async fn abandon(&self, mut record: BackupRecord, reason: &str) -> Result<BackupRecord> {
        let bucket = record.storage.bucket.clone();
        match self.blobs.list(&bucket, &record.location).try_collect::<Vec<String>>().await {
            Ok(keys) => {
                for key in keys {
                    match self.blobs.delete(&bucket, &key).await {
                        Ok(()) | Err(EngineError::NotFound(_)) => {}
                        Err(e) => warn!(backup = %record.id, key = %key, error = %e, "Could not remove partial upload"),
                    }
                }
            }
            Err(e) => warn!(backup = %record.id, error = %e, "Could not list partial uploads"),
        }
        record.fail(reason, Utc::now());
        self.records.save(&record).await?;
        info!(backup = %record.id, "{}", reason);
        Ok(record)
    }

    async fn prepare(&self, request: &BackupRequest, record: &BackupRecord) -> Result<(TransferTarget, Vec<String>)> {
        let (endpoint, credential) = resolve_connection(
            self.control.as_ref(),
            self.credentials.as_ref(),
            &self.retry,
            &request.id.cluster,
        )
        .await?;

        let collections = if request.collections.is_empty() {
            let listed = self
                .retry
                .call("list collections", || {
                    self.control.list_collections(&endpoint, credential.as_ref())
                })
                .await?;
            dedup(listed)
        } else {
            dedup(request.collections.clone())
        };

        let target = TransferTarget {
            endpoint,
            credential,
            bucket: record.storage.bucket.clone(),
            location: record.location.clone(),
        };
        Ok((target, collections))
    }
}
