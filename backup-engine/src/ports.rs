//! Collaborator interfaces.
//!
//! The engine never talks to a cluster, a bucket or a secret store directly;
//! it is handed one implementation of each trait at construction time.

use crate::models::backup::default_namespace;
use crate::models::{BackupId, BackupRecord, ClusterRef, ScheduleState, Snapshot};
use crate::utils::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to one key of a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

/// Secret value. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Where a cluster's snapshot API is reachable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
    pub address: String,
    pub api_key: Option<SecretRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    #[serde(default)]
    pub points_count: Option<u64>,
    #[serde(default)]
    pub status: String,
}

#[async_trait]
pub trait ClusterControlPlane: Send + Sync {
    async fn resolve_endpoint(&self, cluster: &ClusterRef) -> Result<ClusterEndpoint>;

    async fn list_collections(
        &self,
        endpoint: &ClusterEndpoint,
        credential: Option<&Credential>,
    ) -> Result<Vec<String>>;
}

#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    async fn create_snapshot(
        &self,
        endpoint: &ClusterEndpoint,
        collection: &str,
        credential: Option<&Credential>,
    ) -> Result<Snapshot>;

    async fn download_snapshot(
        &self,
        endpoint: &ClusterEndpoint,
        snapshot: &Snapshot,
        credential: Option<&Credential>,
    ) -> Result<Bytes>;

    async fn delete_snapshot(
        &self,
        endpoint: &ClusterEndpoint,
        snapshot: &Snapshot,
        credential: Option<&Credential>,
    ) -> Result<()>;

    /// Recreate `collection` on the endpoint from snapshot bytes. `locator`
    /// names where the bytes came from, for logs and providers that can pull
    /// the blob themselves.
    async fn recover(
        &self,
        endpoint: &ClusterEndpoint,
        collection: &str,
        locator: &str,
        data: Bytes,
        credential: Option<&Credential>,
    ) -> Result<()>;

    async fn collection_info(
        &self,
        endpoint: &ClusterEndpoint,
        collection: &str,
        credential: Option<&Credential>,
    ) -> Result<CollectionInfo>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `bucket`/`key`, replacing any previous object.
    /// Returns a locator for the stored object.
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<String>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes>;

    /// Missing objects yield `NotFound`.
    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Keys under `prefix`, sorted. Every call starts a fresh listing.
    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>>;
}

#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, secret: &SecretRef) -> Result<Credential>;
}

/// Result of [`RecordStore::create_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// No record existed; the given one was stored.
    Created(BackupRecord),
    /// A record with the same identity was already present.
    Existing(BackupRecord),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub cluster: Option<ClusterRef>,
    pub schedule: Option<String>,
}

impl RecordFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_schedule(name: impl Into<String>) -> Self {
        Self {
            cluster: None,
            schedule: Some(name.into()),
        }
    }

    pub fn for_cluster(cluster: ClusterRef) -> Self {
        Self {
            cluster: Some(cluster),
            schedule: None,
        }
    }

    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.cluster.as_ref().map_or(true, |c| *c == record.id.cluster)
            && self
                .schedule
                .as_deref()
                .map_or(true, |s| record.schedule.as_deref() == Some(s))
    }
}

/// Persistence for backup records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Atomically insert `record` unless one with the same identity exists.
    async fn create_if_absent(&self, record: BackupRecord) -> Result<Admission>;

    async fn get(&self, id: &BackupId) -> Result<Option<BackupRecord>>;

    /// Overwrite an existing record. Phase regressions and changes to a
    /// terminal record are rejected with `Store`.
    async fn save(&self, record: &BackupRecord) -> Result<()>;

    /// Matching records, oldest first.
    async fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>>;

    /// Removing an absent record is not an error.
    async fn remove(&self, id: &BackupId) -> Result<()>;
}

/// Persistence for each schedule's state, keyed by schedule name.
#[async_trait]
pub trait ScheduleStateStore: Send + Sync {
    async fn load(&self, schedule: &str) -> Result<Option<ScheduleState>>;

    async fn store(&self, schedule: &str, state: &ScheduleState) -> Result<()>;
}
