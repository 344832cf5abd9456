use super::{dedup, fan_out, resolve_connection, Collaborators};
use crate::config::EngineConfig;
use crate::models::{BackupPhase, RestoreRecord, RestoreRequest, RestoreSource, RestoredCollection};
use crate::ports::{BlobStore, ClusterControlPlane, ClusterEndpoint, Credential, CredentialResolver, RecordStore, SnapshotProvider};
use crate::transfer::RetryPolicy;
use crate::utils::errors::{EngineError, Result};
use chrono::Utc;
use futures_util::TryStreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SNAPSHOT_SUFFIX: &str = ".snapshot";

/// Snapshots available to a restore, keyed by source collection name.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SourceSnapshots {
    bucket: String,
    keys: BTreeMap<String, String>,
}

pub struct RestoreOrchestrator {
    control: Arc<dyn ClusterControlPlane>,
    credentials: Arc<dyn CredentialResolver>,
    snapshots: Arc<dyn SnapshotProvider>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    max_concurrency: usize,
}

impl RestoreOrchestrator {
    pub fn new(collaborators: &Collaborators, config: &EngineConfig) -> Self {
        Self {
            control: collaborators.control.clone(),
            credentials: collaborators.credentials.clone(),
            snapshots: collaborators.snapshots.clone(),
            blobs: collaborators.blobs.clone(),
            records: collaborators.records.clone(),
            retry: RetryPolicy::from_config(config),
            max_concurrency: config.max_concurrency,
        }
    }

    /// Restore the selected collections into the target cluster.
    ///
    /// An invalid mapping is rejected up front. Problems locating the source
    /// or the target produce a `Failed` record rather than an error.
    pub async fn execute(&self, request: RestoreRequest, cancel: &CancellationToken) -> Result<RestoreRecord> {
        request.mapping.validate()?;
        let mut record = RestoreRecord::start(&request, Utc::now());
        info!(restore = %request.name, source = %record.source, target = %request.target, "Starting restore");

        let source = match self.locate(&request.source).await {
            Ok(source) => source,
            Err(e) => {
                error!(restore = %request.name, error = %e, "Restore source unavailable");
                record.fail(format!("failed to read restore source: {e}"), Utc::now());
                return Ok(record);
            }
        };

        let selection = if request.collections.is_empty() {
            source.keys.keys().cloned().collect()
        } else {
            dedup(request.collections.clone())
        };
        if selection.is_empty() {
            record.fail("no collections to restore", Utc::now());
            return Ok(record);
        }
        if let Err(e) = request.mapping.check_targets(selection.as_slice()) {
            error!(restore = %request.name, error = %e, "Restore mapping collides");
            record.fail(e.to_string(), Utc::now());
            return Ok(record);
        }

        let (endpoint, credential) = match resolve_connection(
            self.control.as_ref(),
            self.credentials.as_ref(),
            &self.retry,
            &request.target,
        )
        .await
        {
            Ok(connection) => connection,
            Err(e) => {
                error!(restore = %request.name, error = %e, "Restore target unavailable");
                record.fail(format!("failed to resolve target cluster: {e}"), Utc::now());
                return Ok(record);
            }
        };

        let (source, request_ref, endpoint, credential) = (&source, &request, &endpoint, credential.as_ref());
        let restored = fan_out(selection, self.max_concurrency, move |name: String| async move {
            let entry = RestoredCollection::new(&name, request_ref.mapping.target_for(&name));
            if cancel.is_cancelled() {
                return entry.with_error(&EngineError::Cancelled);
            }
            match source.keys.get(&name) {
                Some(key) => {
                    self.restore_one(entry, endpoint, credential, &source.bucket, key, request_ref.wait_for_indexing)
                        .await
                }
                None => entry.with_error(&EngineError::NotFound(format!(
                    "collection {name} is not present in the restore source"
                ))),
            }
        })
        .await;

        if cancel.is_cancelled() {
            warn!("Restore {} cancelled; result discarded", request.name);
            return Err(EngineError::Cancelled);
        }

        record.finish(restored, Utc::now());
        match &record.error {
            None => info!(restore = %record.name, "Restore completed"),
            Some(e) => warn!(restore = %record.name, phase = ?record.phase, "Restore finished with errors: {}", e),
        }
        Ok(record)
    }

    async fn restore_one(
        &self,
        mut entry: RestoredCollection,
        endpoint: &ClusterEndpoint,
        credential: Option<&Credential>,
        bucket: &str,
        key: &str,
        wait_for_indexing: bool,
    ) -> RestoredCollection {
        entry.snapshot_key = Some(key.to_string());
        let target = entry.name.clone();

        let data = match self.retry.call("download backup", || self.blobs.get(bucket, key)).await {
            Ok(data) => data,
            Err(e) => {
                warn!(collection = %target, key, error = %e, "Backup download failed");
                return entry.with_error(&e);
            }
        };

        let locator = format!("{bucket}/{key}");
        if let Err(e) = self
            .retry
            .call("recover collection", || {
                self.snapshots.recover(endpoint, &target, &locator, data.clone(), credential)
            })
            .await
        {
            warn!(collection = %target, error = %e, "Collection recovery failed");
            return entry.with_error(&e);
        }
        info!("Restored collection {} from {}", target, locator);

        if wait_for_indexing {
            match self
                .retry
                .call("collection info", || self.snapshots.collection_info(endpoint, &target, credential))
                .await
            {
                Ok(info) => entry.points_count = info.points_count,
                Err(e) => warn!("Could not read back collection {}: {}", target, e),
            }
        }
        entry
    }

    async fn locate(&self, source: &RestoreSource) -> Result<SourceSnapshots> {
        match source {
            RestoreSource::Backup { backup } => {
                let record = self
                    .records
                    .get(backup)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("backup {backup}")))?;
                if record.phase == BackupPhase::InProgress {
                    return Err(EngineError::Config(format!("backup {backup} has not finished")));
                }
                let keys = record
                    .successful_collections()
                    .filter_map(|o| o.snapshot_key.clone().map(|key| (o.name.clone(), key)))
                    .collect();
                Ok(SourceSnapshots {
                    bucket: record.storage.bucket,
                    keys,
                })
            }
            RestoreSource::Location { storage, path } => {
                let prefix = storage.key(&[path]);
                let listed: Vec<String> = self.blobs.list(&storage.bucket, &prefix).try_collect().await?;
                Ok(SourceSnapshots {
                    bucket: storage.bucket.clone(),
                    keys: snapshots_by_collection(listed),
                })
            }
        }
    }
}

/// Group `…/{collection}/{name}.snapshot` keys by collection, taking the
/// first key in sort order for each.
fn snapshots_by_collection(mut keys: Vec<String>) -> BTreeMap<String, String> {
    keys.sort();
    let mut found = BTreeMap::new();
    for key in keys {
        if !key.ends_with(SNAPSHOT_SUFFIX) {
            continue;
        }
        let mut parts = key.rsplit('/');
        let (Some(_file), Some(collection)) = (parts.next(), parts.next()) else {
            continue;
        };
        if collection.is_empty() {
            continue;
        }
        found.entry(collection.to_string()).or_insert(key.clone());
    }
    found
}
