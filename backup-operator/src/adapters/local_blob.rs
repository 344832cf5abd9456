//! Filesystem blob store: one directory per bucket, keys as relative paths.

use async_trait::async_trait;
use backup_engine::ports::BlobStore;
use backup_engine::store::key_in_prefix;
use backup_engine::{EngineError, Result};
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

const PARTIAL_SUFFIX: &str = ".partial";

fn io_error(context: &str, e: io::Error) -> EngineError {
    match e.kind() {
        io::ErrorKind::NotFound => EngineError::NotFound(context.to_string()),
        io::ErrorKind::PermissionDenied => EngineError::Permanent(format!("{context}: {e}")),
        _ => EngineError::Transient(format!("{context}: {e}")),
    }
}

/// Reject keys that would escape the bucket directory.
fn checked(segment: &str, what: &str) -> Result<()> {
    let path = Path::new(segment);
    let clean = !segment.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(())
    } else {
        Err(EngineError::Config(format!("invalid {what} {segment:?}")))
    }
}

/// Sorted keys of every object below `dir`, relative to `dir`. Symlinks are
/// not followed, so a link cycle cannot repeat keys.
fn walk(dir: &Path) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            // Missing bucket, or an object deleted while we walk
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => continue,
            Err(e) => {
                let context = e.path().unwrap_or(dir).display().to_string();
                return Err(io_error(&context, io::Error::from(e)));
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        if let Ok(relative) = path.strip_prefix(dir) {
            let key: Vec<_> = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect();
            keys.push(key.join("/"));
        }
    }
    keys.sort();
    Ok(keys)
}

pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_of(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        checked(bucket, "bucket")?;
        checked(key, "key")?;
        Ok(self.root.join(bucket).join(key))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, bucket: &str, key: &str, data: Bytes) -> Result<String> {
        let path = self.path_of(bucket, key)?;
        let context = format!("write {bucket}/{key}");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(&context, e))?;
        }

        // Readers never see a half-written object.
        let partial = PathBuf::from(format!("{}.{}{}", path.display(), uuid::Uuid::new_v4(), PARTIAL_SUFFIX));
        if let Err(e) = tokio::fs::write(&partial, &data).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(io_error(&context, e));
        }
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| io_error(&context, e))?;

        Ok(format!("file://{}", path.display()))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let path = self.path_of(bucket, key)?;
        tokio::fs::read(&path)
            .await
            .map(Bytes::from)
            .map_err(|e| io_error(&format!("{bucket}/{key}"), e))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        let path = self.path_of(bucket, key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(&format!("{bucket}/{key}"), e))
    }

    fn list(&self, bucket: &str, prefix: &str) -> BoxStream<'static, Result<String>> {
        if let Err(e) = checked(bucket, "bucket") {
            return stream::once(async move { Err(e) }).boxed();
        }
        let dir = self.root.join(bucket);
        let prefix = prefix.to_string();

        stream::once(async move {
            let listing = tokio::task::spawn_blocking(move || walk(&dir))
                .await
                .map_err(|e| EngineError::Transient(format!("listing task failed: {e}")))
                .and_then(|keys| keys);
            match listing {
                Ok(keys) => keys
                    .into_iter()
                    .filter(|k| key_in_prefix(k, &prefix))
                    .map(Ok)
                    .collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}
