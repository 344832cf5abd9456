//! Scriptable fakes shared by the engine's unit tests.

use crate::config::{EngineConfig, RetryConfig};
use crate::models::{ClusterRef, Snapshot};
use crate::orchestrator::Collaborators;
use crate::ports::{
    ClusterControlPlane, ClusterEndpoint, CollectionInfo, Credential, CredentialResolver, SecretRef,
    SnapshotProvider,
};
use crate::store::memory::{MemoryBlobStore, MemoryRecordStore, MemoryScheduleStates};
use crate::transfer::RetryPolicy;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Resolve,
    List,
    Create,
    Download,
    Delete,
    Recover,
    Info,
}

/// A cluster whose calls succeed unless a failure was scripted for them.
#[derive(Default)]
pub struct FakeCluster {
    collections: Mutex<Vec<String>>,
    failures: Mutex<HashMap<(Step, String), VecDeque<EngineError>>>,
    calls: Mutex<Vec<(Step, String)>>,
    live: Mutex<BTreeSet<String>>,
    recovered: Mutex<BTreeMap<String, Bytes>>,
    delay: Mutex<Option<Duration>>,
    counter: AtomicU64,
}

impl FakeCluster {
    pub fn new(collections: &[&str]) -> Arc<Self> {
        let cluster = Self::default();
        *cluster.collections.lock().unwrap() = collections.iter().map(|c| c.to_string()).collect();
        Arc::new(cluster)
    }

    pub fn endpoint() -> ClusterEndpoint {
        ClusterEndpoint {
            address: "http://fake:6333".into(),
            api_key: Some(SecretRef {
                name: "fake".into(),
                key: "api-key".into(),
                namespace: "default".into(),
            }),
        }
    }

    /// Fail the next `times` calls of `step` for `collection` with `error`.
    /// Cluster-wide steps use an empty collection name.
    pub fn fail(&self, step: Step, collection: &str, error: EngineError, times: usize) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry((step, collection.to_string())).or_default();
        queue.extend(std::iter::repeat(error).take(times));
    }

    /// Make every snapshot creation take `delay`.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self, step: Step) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == step)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn live_snapshots(&self) -> Vec<String> {
        self.live.lock().unwrap().iter().cloned().collect()
    }

    pub fn recovered(&self) -> BTreeMap<String, Bytes> {
        self.recovered.lock().unwrap().clone()
    }

    fn record(&self, step: Step, collection: &str) -> Result<()> {
        self.calls.lock().unwrap().push((step, collection.to_string()));
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(step, collection.to_string())).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterControlPlane for FakeCluster {
    async fn resolve_endpoint(&self, _cluster: &ClusterRef) -> Result<ClusterEndpoint> {
        self.record(Step::Resolve, "")?;
        Ok(Self::endpoint())
    }

    async fn list_collections(&self, _endpoint: &ClusterEndpoint, _credential: Option<&Credential>) -> Result<Vec<String>> {
        self.record(Step::List, "")?;
        Ok(self.collections.lock().unwrap().clone())
    }
}

#[async_trait]
impl SnapshotProvider for FakeCluster {
    async fn create_snapshot(
        &self,
        _endpoint: &ClusterEndpoint,
        collection: &str,
        _credential: Option<&Credential>,
    ) -> Result<Snapshot> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Step::Create, collection)?;
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{collection}-{n}.snapshot");
        self.live.lock().unwrap().insert(name.clone());
        Ok(Snapshot {
            name,
            collection: collection.to_string(),
            size_bytes: 0,
            created_at: Utc::now(),
        })
    }

    async fn download_snapshot(
        &self,
        _endpoint: &ClusterEndpoint,
        snapshot: &Snapshot,
        _credential: Option<&Credential>,
    ) -> Result<Bytes> {
        self.record(Step::Download, &snapshot.collection)?;
        Ok(Bytes::from(format!("data:{}", snapshot.collection)))
    }

    async fn delete_snapshot(
        &self,
        _endpoint: &ClusterEndpoint,
        snapshot: &Snapshot,
        _credential: Option<&Credential>,
    ) -> Result<()> {
        self.record(Step::Delete, &snapshot.collection)?;
        self.live.lock().unwrap().remove(&snapshot.name);
        Ok(())
    }

    async fn recover(
        &self,
        _endpoint: &ClusterEndpoint,
        collection: &str,
        _locator: &str,
        data: Bytes,
        _credential: Option<&Credential>,
    ) -> Result<()> {
        self.record(Step::Recover, collection)?;
        self.recovered.lock().unwrap().insert(collection.to_string(), data);
        Ok(())
    }

    async fn collection_info(
        &self,
        _endpoint: &ClusterEndpoint,
        collection: &str,
        _credential: Option<&Credential>,
    ) -> Result<CollectionInfo> {
        self.record(Step::Info, collection)?;
        Ok(CollectionInfo {
            points_count: Some(42),
            status: "green".into(),
        })
    }
}

pub struct StaticCredentials;

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, _secret: &SecretRef) -> Result<Credential> {
        Ok(Credential::new("test-key"))
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::from_config(&fast_config())
}

pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_concurrency: 8,
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        },
        call_timeout_secs: 5,
    }
}

pub struct Harness {
    pub cluster: Arc<FakeCluster>,
    pub records: Arc<MemoryRecordStore>,
    pub blobs: Arc<MemoryBlobStore>,
    pub states: Arc<MemoryScheduleStates>,
}

impl Harness {
    pub fn new(collections: &[&str]) -> Self {
        Self {
            cluster: FakeCluster::new(collections),
            records: Arc::new(MemoryRecordStore::new()),
            blobs: Arc::new(MemoryBlobStore::new()),
            states: Arc::new(MemoryScheduleStates::new()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            control: self.cluster.clone(),
            snapshots: self.cluster.clone(),
            blobs: self.blobs.clone(),
            credentials: Arc::new(StaticCredentials),
            records: self.records.clone(),
        }
    }
}
