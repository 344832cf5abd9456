//! HTTP client for the Qdrant snapshot API.
//!
//! One client serves every configured cluster; endpoints come from the
//! operator configuration. HTTP statuses are mapped onto the engine's error
//! taxonomy so the retry layer can tell transient failures from permanent ones.

use crate::config::ClusterConfig;
use async_trait::async_trait;
use backup_engine::models::{ClusterRef, Snapshot};
use backup_engine::ports::{ClusterControlPlane, ClusterEndpoint, CollectionInfo, Credential, SnapshotProvider};
use backup_engine::{EngineError, Result};
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

const API_KEY_HEADER: &str = "api-key";

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct CollectionList {
    collections: Vec<CollectionName>,
}

#[derive(Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Deserialize)]
struct SnapshotDescription {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    creation_time: Option<String>,
}

#[derive(Deserialize)]
struct CollectionDescription {
    #[serde(default)]
    status: String,
    #[serde(default)]
    points_count: Option<u64>,
}

/// Map a non-success HTTP status to an engine error.
pub fn status_error(status: StatusCode, context: &str, body: &str) -> EngineError {
    let detail = if body.is_empty() {
        format!("{context}: HTTP {status}")
    } else {
        format!("{context}: HTTP {status}: {}", body.trim())
    };
    match status {
        StatusCode::NOT_FOUND => EngineError::NotFound(detail),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => EngineError::Transient(detail),
        s if s.is_server_error() => EngineError::Transient(detail),
        _ => EngineError::Permanent(detail),
    }
}

fn transport_error(context: &str, e: reqwest::Error) -> EngineError {
    if e.is_decode() {
        EngineError::Permanent(format!("{context}: unexpected response: {e}"))
    } else {
        EngineError::Transient(format!("{context}: {e}"))
    }
}

/// Qdrant returns naive timestamps, sometimes with fractional seconds.
fn parse_creation_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let value = value?;
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

pub struct QdrantClient {
    http: reqwest::Client,
    clusters: HashMap<ClusterRef, ClusterEndpoint>,
}

impl QdrantClient {
    pub fn new(clusters: &[ClusterConfig]) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let clusters = clusters
            .iter()
            .map(|c| {
                let endpoint = ClusterEndpoint {
                    address: c.url.trim_end_matches('/').to_string(),
                    api_key: c.api_key.clone(),
                };
                (c.cluster_ref(), endpoint)
            })
            .collect();
        Ok(Self { http, clusters })
    }

    fn authorized(&self, request: RequestBuilder, credential: Option<&Credential>) -> RequestBuilder {
        match credential {
            Some(key) => request.header(API_KEY_HEADER, key.expose()),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, context: &str) -> Result<Response> {
        let response = request.send().await.map_err(|e| transport_error(context, e))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(status, context, &body))
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder, context: &str) -> Result<T> {
        let response = self.send(request, context).await?;
        let envelope: Envelope<T> = response.json().await.map_err(|e| transport_error(context, e))?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl ClusterControlPlane for QdrantClient {
    async fn resolve_endpoint(&self, cluster: &ClusterRef) -> Result<ClusterEndpoint> {
        self.clusters
            .get(cluster)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("cluster {cluster} is not configured")))
    }

    async fn list_collections(&self, endpoint: &ClusterEndpoint, credential: Option<&Credential>) -> Result<Vec<String>> {
        let url = format!("{}/collections", endpoint.address);
        let request = self.authorized(self.http.get(&url), credential);
        let list: CollectionList = self.send_json(request, "list collections").await?;
        Ok(list.collections.into_iter().map(|c| c.name).collect())
    }
}

#[async_trait]
impl SnapshotProvider for QdrantClient {
    async fn create_snapshot(
        &self,
        endpoint: &ClusterEndpoint,
        collection: &str,
        credential: Option<&Credential>,
    ) -> Result<Snapshot> {
        let url = format!("{}/collections/{}/snapshots?wait=true", endpoint.address, collection);
        let request = self.authorized(self.http.post(&url), credential);
        let context = format!("create snapshot of {collection}");
        let description: SnapshotDescription = self.send_json(request, &context).await?;
        debug!(collection, snapshot = %description.name, size = description.size, "Snapshot created");

        Ok(Snapshot {
            name: description.name,
            collection: collection.to_string(),
            size_bytes: description.size,
            created_at: parse_creation_time(description.creation_time.as_deref()).unwrap_or_else(Utc::now),
        })
    }

    async fn download_snapshot(
        &self,
        endpoint: &ClusterEndpoint,
        snapshot: &Snapshot,
        credential: Option<&Credential>,
    ) -> Result<Bytes> {
        let url = format!(
            "{}/collections/{}/snapshots/{}",
            endpoint.address, snapshot.collection, snapshot.name
        );
        let context = format!("download snapshot {}", snapshot.name);
        let request = self.authorized(self.http.get(&url), credential);
        let response = self.send(request, &context).await?;
        response.bytes().await.map_err(|e| transport_error(&context, e))
    }

    async fn delete_snapshot(
        &self,
        endpoint: &ClusterEndpoint,
        snapshot: &Snapshot,
        credential: Option<&Credential>,
    ) -> Result<()> {
        let url = format!(
            "{}/collections/{}/snapshots/{}",
            endpoint.address, snapshot.collection, snapshot.name
        );
        let request = self.authorized(self.http.delete(&url), credential);
        self.send(request, &format!("delete snapshot {}", snapshot.name)).await?;
        Ok(())
    }

    async fn recover(
        &self,
        endpoint: &ClusterEndpoint,
        collection: &str,
        locator: &str,
        data: Bytes,
        credential: Option<&Credential>,
    ) -> Result<()> {
        let url = format!(
            "{}/collections/{}/snapshots/upload?wait=true&priority=snapshot",
            endpoint.address, collection
        );
        let file_name = locator.rsplit('/').next().unwrap_or(locator).to_string();
        let part = reqwest::multipart::Part::stream(data)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| EngineError::Permanent(format!("recover {collection}: {e}")))?;
        let form = reqwest::multipart::Form::new().part("snapshot", part);

        let request = self.authorized(self.http.post(&url), credential).multipart(form);
        self.send(request, &format!("recover {collection} from {locator}")).await?;
        Ok(())
    }

    async fn collection_info(
        &self,
        endpoint: &ClusterEndpoint,
        collection: &str,
        credential: Option<&Credential>,
    ) -> Result<CollectionInfo> {
        let url = format!("{}/collections/{}", endpoint.address, collection);
        let request = self.authorized(self.http.get(&url), credential);
        let description: CollectionDescription = self.send_json(request, &format!("describe {collection}")).await?;
        Ok(CollectionInfo {
            points_count: description.points_count,
            status: description.status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use chrono::TimeZone;
    use serde_json::json;

    fn cluster(url: &str) -> ClusterConfig {
        ClusterConfig {
            name: "vectors".into(),
            namespace: "default".into(),
            url: url.into(),
            api_key: None,
        }
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) == Some("secret")
    }

    async fn serve_fake() -> String {
        let app = Router::new()
            .route(
                "/collections",
                get(|headers: HeaderMap| async move {
                    if !authorized(&headers) {
                        return (AxumStatus::FORBIDDEN, Json(json!({ "status": { "error": "forbidden" } })));
                    }
                    (
                        AxumStatus::OK,
                        Json(json!({ "result": { "collections": [{ "name": "docs" }, { "name": "images" }] } })),
                    )
                }),
            )
            .route(
                "/collections/{collection}",
                get(|Path(collection): Path<String>| async move {
                    if collection == "missing" {
                        return (AxumStatus::NOT_FOUND, Json(json!({ "status": { "error": "not found" } })));
                    }
                    (AxumStatus::OK, Json(json!({ "result": { "status": "green", "points_count": 1200 } })))
                }),
            )
            .route(
                "/collections/{collection}/snapshots",
                post(|Path(collection): Path<String>| async move {
                    if collection == "flaky" {
                        return (AxumStatus::SERVICE_UNAVAILABLE, Json(json!({})));
                    }
                    (
                        AxumStatus::OK,
                        Json(json!({ "result": {
                            "name": format!("{collection}-1.snapshot"),
                            "size": 7,
                            "creation_time": "2024-01-01T02:00:00.123"
                        } })),
                    )
                }),
            )
            .route(
                "/collections/{collection}/snapshots/{snapshot}",
                get(|Path((_, snapshot)): Path<(String, String)>| async move { format!("bytes:{snapshot}") })
                    .delete(|| async { Json(json!({ "result": true })) }),
            )
            .route(
                "/collections/{collection}/snapshots/upload",
                post(|headers: HeaderMap, body: Bytes| async move {
                    let multipart = headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .is_some_and(|v| v.starts_with("multipart/form-data"));
                    let has_part = String::from_utf8_lossy(&body).contains("name=\"snapshot\"");
                    if multipart && has_part {
                        (AxumStatus::OK, Json(json!({ "result": true })))
                    } else {
                        (AxumStatus::BAD_REQUEST, Json(json!({})))
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[test]
    fn test_status_mapping() {
        let err = |s| status_error(s, "call", "");
        assert!(matches!(err(StatusCode::NOT_FOUND), EngineError::NotFound(_)));
        assert!(matches!(err(StatusCode::UNAUTHORIZED), EngineError::Permanent(_)));
        assert!(matches!(err(StatusCode::FORBIDDEN), EngineError::Permanent(_)));
        assert!(matches!(err(StatusCode::BAD_REQUEST), EngineError::Permanent(_)));
        assert!(matches!(err(StatusCode::TOO_MANY_REQUESTS), EngineError::Transient(_)));
        assert!(matches!(err(StatusCode::BAD_GATEWAY), EngineError::Transient(_)));
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, "list", " denied\n").to_string(),
            "Permanent error: list: HTTP 403 Forbidden: denied"
        );
    }

    #[test]
    fn test_parse_creation_time() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();
        assert_eq!(parse_creation_time(Some("2024-01-01T02:00:00")), Some(expected));
        assert_eq!(parse_creation_time(Some("2024-01-01T02:00:00Z")), Some(expected));
        assert!(parse_creation_time(Some("yesterday")).is_none());
        assert!(parse_creation_time(None).is_none());
    }

    #[tokio::test]
    async fn test_resolve_configured_clusters_only() {
        let client = QdrantClient::new(&[cluster("http://vectors:6333/")]).unwrap();
        let endpoint = client
            .resolve_endpoint(&ClusterRef::new("default", "vectors"))
            .await
            .unwrap();
        assert_eq!(endpoint.address, "http://vectors:6333");

        let missing = client.resolve_endpoint(&ClusterRef::new("default", "other")).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle_against_fake_server() {
        let url = serve_fake().await;
        let client = QdrantClient::new(&[cluster(&url)]).unwrap();
        let endpoint = client
            .resolve_endpoint(&ClusterRef::new("default", "vectors"))
            .await
            .unwrap();
        let key = Credential::new("secret");

        let collections = client.list_collections(&endpoint, Some(&key)).await.unwrap();
        assert_eq!(collections, vec!["docs", "images"]);

        let snapshot = client.create_snapshot(&endpoint, "docs", Some(&key)).await.unwrap();
        assert_eq!(snapshot.name, "docs-1.snapshot");
        assert_eq!(snapshot.size_bytes, 7);

        let data = client.download_snapshot(&endpoint, &snapshot, Some(&key)).await.unwrap();
        assert_eq!(&data[..], b"bytes:docs-1.snapshot");

        client.delete_snapshot(&endpoint, &snapshot, Some(&key)).await.unwrap();
        client
            .recover(&endpoint, "docs-restored", "backups/p/docs/docs-1.snapshot", data, Some(&key))
            .await
            .unwrap();

        let info = client.collection_info(&endpoint, "docs", Some(&key)).await.unwrap();
        assert_eq!(info.points_count, Some(1200));
        assert_eq!(info.status, "green");
    }

    #[tokio::test]
    async fn test_error_statuses_against_fake_server() {
        let url = serve_fake().await;
        let client = QdrantClient::new(&[cluster(&url)]).unwrap();
        let endpoint = client
            .resolve_endpoint(&ClusterRef::new("default", "vectors"))
            .await
            .unwrap();

        let denied = client.list_collections(&endpoint, None).await;
        assert!(matches!(denied, Err(EngineError::Permanent(_))));

        let flaky = client.create_snapshot(&endpoint, "flaky", None).await;
        assert!(matches!(flaky, Err(e) if e.is_retryable()));

        let missing = client.collection_info(&endpoint, "missing", None).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
    }
}
