//! Per-collection snapshot transfer.
//!
//! One transfer is: create a snapshot on the cluster, download it, upload it
//! under the backup's deterministic key, then delete the snapshot from the
//! cluster. Each step retries transient failures on its own. Failures end up
//! in the returned [`CollectionOutcome`], never as an error.

pub mod retry;

use crate::models::{CollectionOutcome, Snapshot};
use crate::ports::{BlobStore, ClusterEndpoint, Credential, SnapshotProvider};
use crate::utils::errors::Result;
use crate::utils::format_size;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{info, warn};

pub use retry::RetryPolicy;

/// Everything a worker needs to know about where a backup goes.
#[derive(Debug, Clone)]
pub struct TransferTarget {
    pub endpoint: ClusterEndpoint,
    pub credential: Option<Credential>,
    pub bucket: String,
    /// Key prefix of the backup; snapshots land at `{location}/{collection}/{snapshot}`.
    pub location: String,
}

impl TransferTarget {
    pub fn key_for(&self, collection: &str, snapshot_name: &str) -> String {
        format!("{}/{}/{}", self.location, collection, snapshot_name)
    }
}

pub struct SnapshotTransferWorker {
    snapshots: Arc<dyn SnapshotProvider>,
    blobs: Arc<dyn BlobStore>,
    retry: RetryPolicy,
}

impl SnapshotTransferWorker {
    pub fn new(snapshots: Arc<dyn SnapshotProvider>, blobs: Arc<dyn BlobStore>, retry: RetryPolicy) -> Self {
        Self { snapshots, blobs, retry }
    }

    pub async fn transfer(&self, target: &TransferTarget, collection: &str) -> CollectionOutcome {
        let credential = target.credential.as_ref();
        let snapshot = match self
            .retry
            .call("create snapshot", || {
                self.snapshots.create_snapshot(&target.endpoint, collection, credential)
            })
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(collection, error = %e, "Snapshot creation failed");
                return CollectionOutcome::failed(collection, &e);
            }
        };

        let stored = self.store(target, collection, &snapshot).await;
        self.cleanup(target, &snapshot).await;

        match stored {
            Ok((key, size)) => {
                info!(collection, key = %key, "Stored snapshot ({})", format_size(size));
                CollectionOutcome::succeeded(collection, &snapshot.name, key, size)
            }
            Err(e) => {
                warn!(collection, snapshot = %snapshot.name, error = %e, "Snapshot transfer failed");
                CollectionOutcome::failed(collection, &e)
            }
        }
    }

    async fn store(&self, target: &TransferTarget, collection: &str, snapshot: &Snapshot) -> Result<(String, u64)> {
        let credential = target.credential.as_ref();
        let data: Bytes = self
            .retry
            .call("download snapshot", || {
                self.snapshots.download_snapshot(&target.endpoint, snapshot, credential)
            })
            .await?;

        let key = target.key_for(collection, &snapshot.name);
        let size = data.len() as u64;
        self.retry
            .call("upload snapshot", || self.blobs.put(&target.bucket, &key, data.clone()))
            .await?;
        Ok((key, size))
    }

    /// Always attempted once a snapshot exists; a failure here only leaks a
    /// snapshot on the cluster.
    async fn cleanup(&self, target: &TransferTarget, snapshot: &Snapshot) {
        let credential = target.credential.as_ref();
        if let Err(e) = self
            .retry
            .call("delete snapshot", || {
                self.snapshots.delete_snapshot(&target.endpoint, snapshot, credential)
            })
            .await
        {
            warn!(
                "Failed to delete snapshot {} of {} from cluster: {}",
                snapshot.name, snapshot.collection, e
            );
        }
    }
}
