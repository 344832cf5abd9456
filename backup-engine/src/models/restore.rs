use super::backup::{BackupId, ClusterRef, CollectionError, StorageTarget, Tally};
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Source collection name → target collection name. Unmapped names restore as-is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionMapping(BTreeMap<String, String>);

impl CollectionMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mapping = Self(pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        mapping.validate()?;
        Ok(mapping)
    }

    pub fn target_for<'a>(&'a self, source: &'a str) -> &'a str {
        self.0.get(source).map(String::as_str).unwrap_or(source)
    }

    /// Two sources restoring into the same target would overwrite each other.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (source, target) in &self.0 {
            if target.is_empty() {
                return Err(EngineError::Config(format!(
                    "collection mapping for {source} has an empty target"
                )));
            }
            if !seen.insert(target.as_str()) {
                return Err(EngineError::Config(format!(
                    "collection mapping sends more than one collection to {target}"
                )));
            }
        }
        Ok(())
    }

    /// Check the targets `selection` actually resolves to, unmapped names
    /// included: `{"a": "b"}` with both `a` and `b` selected sends two
    /// collections to `b`.
    pub fn check_targets<S: AsRef<str>>(&self, selection: &[S]) -> Result<()> {
        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();
        for source in selection.iter().map(AsRef::as_ref) {
            let target = self.target_for(source);
            if let Some(other) = claimed.insert(target, source) {
                if other != source {
                    return Err(EngineError::Config(format!(
                        "collections {other} and {source} would both be restored into {target}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where the snapshots to restore come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RestoreSource {
    /// A backup recorded by this operator; its successful outcomes name the snapshots.
    Backup { backup: BackupId },
    /// A raw blob location laid out as `{path}/{collection}/{snapshot}.snapshot`.
    Location { storage: StorageTarget, path: String },
}

impl fmt::Display for RestoreSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSource::Backup { backup } => write!(f, "backup {}", backup),
            RestoreSource::Location { storage, path } => {
                write!(f, "{}/{}", storage.bucket, storage.key(&[path]))
            }
        }
    }
}

fn default_wait_for_indexing() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub name: String,
    pub target: ClusterRef,
    pub source: RestoreSource,
    /// Empty means every collection present in the source.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub mapping: CollectionMapping,
    #[serde(default = "default_wait_for_indexing")]
    pub wait_for_indexing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestorePhase {
    InProgress,
    Completed,
    PartiallyFailed,
    Failed,
}

impl RestorePhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RestorePhase::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredCollection {
    /// Name on the target cluster
    pub name: String,
    /// Source name, set only when the mapping renamed the collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CollectionError>,
}

impl RestoredCollection {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            name: target.to_string(),
            original_name: (source != target).then(|| source.to_string()),
            snapshot_key: None,
            points_count: None,
            error: None,
        }
    }

    pub fn with_error(mut self, error: &EngineError) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn source_name(&self) -> &str {
        self.original_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreProgress {
    pub collections_total: usize,
    pub collections_completed: usize,
    pub collections_failed: usize,
    pub percentage: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRecord {
    pub name: String,
    pub target: ClusterRef,
    /// Human-readable description of the source
    pub source: String,
    pub phase: RestorePhase,
    #[serde(default)]
    pub collections: Vec<RestoredCollection>,
    #[serde(default)]
    pub progress: RestoreProgress,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RestoreRecord {
    pub fn start(request: &RestoreRequest, now: DateTime<Utc>) -> Self {
        Self {
            name: request.name.clone(),
            target: request.target.clone(),
            source: request.source.to_string(),
            phase: RestorePhase::InProgress,
            collections: Vec::new(),
            progress: RestoreProgress::default(),
            started_at: now,
            completed_at: None,
            error: None,
        }
    }

    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.phase.is_terminal() {
            return;
        }
        self.phase = RestorePhase::Failed;
        self.error = Some(reason.into());
        self.completed_at = Some(now);
    }

    pub fn finish(&mut self, collections: Vec<RestoredCollection>, now: DateTime<Utc>) {
        if self.phase.is_terminal() {
            return;
        }
        let total = collections.len();
        let failed: Vec<&RestoredCollection> = collections.iter().filter(|c| !c.is_success()).collect();
        let completed = total - failed.len();

        self.phase = match Tally::of(completed, failed.len()) {
            Tally::AllSucceeded => RestorePhase::Completed,
            Tally::Mixed => RestorePhase::PartiallyFailed,
            Tally::AllFailed => RestorePhase::Failed,
        };
        self.error = failed.first().map(|first| {
            let detail = first
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            format!("{}/{} collections failed: {}: {}", failed.len(), total, first.source_name(), detail)
        });
        self.progress = RestoreProgress {
            collections_total: total,
            collections_completed: completed,
            collections_failed: failed.len(),
            percentage: 100,
        };
        self.collections = collections;
        self.completed_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_defaults_to_identity() {
        let mapping = CollectionMapping::from_pairs([("old", "new")]).unwrap();
        assert_eq!(mapping.target_for("old"), "new");
        assert_eq!(mapping.target_for("other"), "other");
    }

    #[test]
    fn test_mapping_rejects_colliding_targets() {
        let err = CollectionMapping::from_pairs([("a", "same"), ("b", "same")]).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_unmapped_collection_collides_with_mapped_target() {
        let mapping = CollectionMapping::from_pairs([("a", "b")]).unwrap();
        assert!(mapping.check_targets(&["a", "c"]).is_ok());
        assert!(mapping.check_targets(&["a"]).is_ok());

        let err = mapping.check_targets(&["a", "b"]).unwrap_err();
        assert_eq!(
            err,
            EngineError::Config("collections a and b would both be restored into b".into())
        );

        let swap = CollectionMapping::from_pairs([("a", "b"), ("b", "a")]).unwrap();
        assert!(swap.check_targets(&["a", "b"]).is_ok());
    }

    #[test]
    fn test_restored_collection_tracks_rename() {
        assert_eq!(RestoredCollection::new("old", "new").original_name.as_deref(), Some("old"));
        assert_eq!(RestoredCollection::new("same", "same").original_name, None);
    }

    #[test]
    fn test_source_deserializes_from_tagged_json() {
        let json = r#"{"type":"location","storage":{"bucket":"b","prefix":"p"},"path":"nightly"}"#;
        let source: RestoreSource = serde_json::from_str(json).unwrap();
        assert_eq!(source.to_string(), "b/p/nightly");
    }
}
