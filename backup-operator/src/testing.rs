//! In-process collaborators for route and ticker tests.

use crate::adapters::SecretFileResolver;
use crate::config::{AppConfig, ClusterConfig};
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::routes::create_router;
use crate::state::AppState;
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use backup_engine::models::{ClusterRef, Snapshot, StorageTarget};
use backup_engine::ports::{ClusterControlPlane, ClusterEndpoint, CollectionInfo, Credential, SnapshotProvider};
use backup_engine::store::memory::MemoryBlobStore;
use backup_engine::{EngineError, Result};
use bytes::Bytes;
use chrono::Utc;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

/// A cluster that always succeeds, except for collections named `broken`.
pub struct StubCluster {
    collections: Vec<String>,
    recovered: Mutex<Vec<String>>,
}

impl StubCluster {
    pub fn new(collections: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            collections: collections.iter().map(|c| c.to_string()).collect(),
            recovered: Mutex::new(Vec::new()),
        })
    }

    pub fn recovered(&self) -> Vec<String> {
        self.recovered.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ClusterControlPlane for StubCluster {
    async fn resolve_endpoint(&self, cluster: &ClusterRef) -> Result<ClusterEndpoint> {
        Ok(ClusterEndpoint {
            address: format!("http://{}.{}", cluster.name, cluster.namespace),
            api_key: None,
        })
    }

    async fn list_collections(&self, _: &ClusterEndpoint, _: Option<&Credential>) -> Result<Vec<String>> {
        Ok(self.collections.clone())
    }
}

#[async_trait]
impl SnapshotProvider for StubCluster {
    async fn create_snapshot(&self, _: &ClusterEndpoint, collection: &str, _: Option<&Credential>) -> Result<Snapshot> {
        if collection == "broken" {
            return Err(EngineError::Permanent("snapshot quota exceeded".into()));
        }
        Ok(Snapshot {
            name: format!("{collection}-1.snapshot"),
            collection: collection.to_string(),
            size_bytes: 4,
            created_at: Utc::now(),
        })
    }

    async fn download_snapshot(&self, _: &ClusterEndpoint, snapshot: &Snapshot, _: Option<&Credential>) -> Result<Bytes> {
        Ok(Bytes::from(format!("data:{}", snapshot.collection)))
    }

    async fn delete_snapshot(&self, _: &ClusterEndpoint, _: &Snapshot, _: Option<&Credential>) -> Result<()> {
        Ok(())
    }

    async fn recover(
        &self,
        _: &ClusterEndpoint,
        collection: &str,
        _: &str,
        _: Bytes,
        _: Option<&Credential>,
    ) -> Result<()> {
        if let Ok(mut recovered) = self.recovered.lock() {
            recovered.push(collection.to_string());
        }
        Ok(())
    }

    async fn collection_info(&self, _: &ClusterEndpoint, _: &str, _: Option<&Credential>) -> Result<CollectionInfo> {
        Ok(CollectionInfo {
            points_count: Some(10),
            status: "green".into(),
        })
    }
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.clusters.push(ClusterConfig {
        name: "vectors".into(),
        namespace: "default".into(),
        url: "http://vectors:6333".into(),
        api_key: None,
    });
    config.engine.retry.initial_backoff_ms = 1;
    config.engine.retry.max_backoff_ms = 2;
    config
}

pub fn storage() -> StorageTarget {
    StorageTarget::new("backups", "")
}

pub struct TestApp {
    pub state: Arc<AppState>,
    pub cluster: Arc<StubCluster>,
    pub blobs: Arc<MemoryBlobStore>,
    _dir: TempDir,
}

impl TestApp {
    pub fn new(config: AppConfig, collections: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let pool = create_pool(dir.path().join("operator.db").to_str().unwrap()).unwrap();
        migrate(&pool).unwrap();

        let cluster = StubCluster::new(collections);
        let blobs = Arc::new(MemoryBlobStore::new());
        let secrets = Arc::new(SecretFileResolver::new(dir.path().join("secrets")));
        let state = Arc::new(AppState::new(pool, config, cluster.clone(), cluster.clone(), blobs.clone(), secrets));

        Self {
            state,
            cluster,
            blobs,
            _dir: dir,
        }
    }

    /// Wait for every backup and restore started so far.
    pub async fn settle(&self) {
        self.state.tasks.close();
        self.state.tasks.wait().await;
        self.state.tasks.reopen();
    }
}

pub async fn call(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = create_router(app.state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

pub fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}
