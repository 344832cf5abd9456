use crate::utils::errors::{EngineError, ErrorKind};
use crate::utils::format_size;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub(crate) fn default_namespace() -> String {
    "default".to_string()
}

/// Reference to a database cluster by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterRef {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl ClusterRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for ClusterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Identity of one backup: source cluster plus creation time (whole seconds).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackupId {
    pub cluster: ClusterRef,
    pub created_at: DateTime<Utc>,
}

impl BackupId {
    pub fn new(cluster: ClusterRef, created_at: DateTime<Utc>) -> Self {
        let created_at = created_at.with_nanosecond(0).unwrap_or(created_at);
        Self { cluster, created_at }
    }

    /// Compact creation timestamp, e.g. `20240101T020000Z`.
    pub fn stamp(&self) -> String {
        self.created_at.format(STAMP_FORMAT).to_string()
    }

    /// Same cluster, one second later.
    pub fn next_second(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            created_at: self.created_at + chrono::Duration::seconds(1),
        }
    }

    pub fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.cluster, self.stamp())
    }
}

impl Ord for BackupId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.to_string().cmp(&other.to_string()))
    }
}

impl PartialOrd for BackupId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupPhase {
    InProgress,
    Completed,
    PartiallyFailed,
    Failed,
}

impl BackupPhase {
    pub fn is_terminal(self) -> bool {
        match self {
            BackupPhase::InProgress => false,
            BackupPhase::Completed | BackupPhase::PartiallyFailed | BackupPhase::Failed => true,
        }
    }

    /// Phases only move forward: `InProgress` to a terminal phase, never back.
    pub fn can_transition_to(self, next: BackupPhase) -> bool {
        match self {
            BackupPhase::InProgress => true,
            BackupPhase::Completed | BackupPhase::PartiallyFailed | BackupPhase::Failed => {
                self == next
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackupPhase::InProgress => "InProgress",
            BackupPhase::Completed => "Completed",
            BackupPhase::PartiallyFailed => "PartiallyFailed",
            BackupPhase::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "InProgress" => Some(BackupPhase::InProgress),
            "Completed" => Some(BackupPhase::Completed),
            "PartiallyFailed" => Some(BackupPhase::PartiallyFailed),
            "Failed" => Some(BackupPhase::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error detail attached to a single collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&EngineError> for CollectionError {
    fn from(e: &EngineError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Point-in-time export of one collection, produced by the source cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub collection: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOutcome {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_key: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CollectionError>,
}

impl CollectionOutcome {
    pub fn succeeded(name: &str, snapshot_name: &str, snapshot_key: String, size_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            snapshot_name: Some(snapshot_name.to_string()),
            snapshot_key: Some(snapshot_key),
            size_bytes,
            error: None,
        }
    }

    pub fn failed(name: &str, error: &EngineError) -> Self {
        Self {
            name: name.to_string(),
            snapshot_name: None,
            snapshot_key: None,
            size_bytes: 0,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Blob storage location for a backup: a bucket and a key prefix inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageTarget {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
}

impl StorageTarget {
    pub fn new(bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Join `parts` under the prefix, skipping empty segments and stray slashes.
    pub fn key(&self, parts: &[&str]) -> String {
        std::iter::once(self.prefix.as_str())
            .chain(parts.iter().copied())
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Request to back up collections of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub id: BackupId,
    /// Resource name; also the directory the snapshots are stored under.
    pub name: String,
    pub storage: StorageTarget,
    /// Empty means every collection present on the cluster when the run starts.
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
}

impl BackupRequest {
    pub fn new(cluster: ClusterRef, created_at: DateTime<Utc>, storage: StorageTarget) -> Self {
        let id = BackupId::new(cluster, created_at);
        let name = format!("{}-{}", id.cluster.name, id.created_at.format("%Y%m%d-%H%M%S"));
        Self {
            id,
            name,
            storage,
            collections: Vec::new(),
            schedule: None,
        }
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }
}

/// Kubernetes-style status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub id: BackupId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    pub storage: StorageTarget,
    /// Key prefix holding this backup's snapshots: `{prefix}/{namespace}/{name}`.
    pub location: String,
    pub phase: BackupPhase,
    #[serde(default)]
    pub collections: Vec<CollectionOutcome>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl BackupRecord {
    pub fn start(request: &BackupRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            schedule: request.schedule.clone(),
            storage: request.storage.clone(),
            location: request.storage.key(&[&request.id.cluster.namespace, &request.name]),
            phase: BackupPhase::InProgress,
            collections: Vec::new(),
            started_at: now,
            completed_at: None,
            total_size_bytes: 0,
            error: None,
            conditions: Vec::new(),
        }
    }

    /// Deterministic blob key for one collection's snapshot.
    pub fn key_for(&self, collection: &str, snapshot_name: &str) -> String {
        format!("{}/{}/{}", self.location, collection, snapshot_name)
    }

    /// Terminate without per-collection detail (resolution failed, nothing to do).
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        if self.phase.is_terminal() {
            return;
        }
        let reason = reason.into();
        self.phase = BackupPhase::Failed;
        self.completed_at = Some(now);
        self.conditions.push(Condition {
            type_: "Complete".into(),
            status: "False".into(),
            reason: "BackupFailed".into(),
            message: reason.clone(),
            last_transition_time: now,
        });
        self.error = Some(reason);
    }

    /// Record the per-collection outcomes and derive the terminal phase.
    pub fn finish(&mut self, outcomes: Vec<CollectionOutcome>, now: DateTime<Utc>) {
        if self.phase.is_terminal() {
            return;
        }
        let total = outcomes.len();
        let failed: Vec<&CollectionOutcome> = outcomes.iter().filter(|o| !o.is_success()).collect();
        let succeeded = total - failed.len();

        let (phase, reason) = match Tally::of(succeeded, failed.len()) {
            Tally::AllSucceeded => (BackupPhase::Completed, "BackupCompleted"),
            Tally::Mixed => (BackupPhase::PartiallyFailed, "BackupPartiallyFailed"),
            Tally::AllFailed => (BackupPhase::Failed, "BackupFailed"),
        };

        self.error = failed.first().map(|first| {
            let detail = first
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("unknown error");
            format!("{}/{} collections failed: {}: {}", failed.len(), total, first.name, detail)
        });
        self.total_size_bytes = outcomes.iter().map(|o| o.size_bytes).sum();
        self.conditions.push(Condition {
            type_: "Complete".into(),
            status: if phase == BackupPhase::Completed { "True" } else { "False" }.into(),
            reason: reason.into(),
            message: format!("Backed up {}/{} collections", succeeded, total),
            last_transition_time: now,
        });
        self.collections = outcomes;
        self.phase = phase;
        self.completed_at = Some(now);
    }

    pub fn successful_collections(&self) -> impl Iterator<Item = &CollectionOutcome> {
        self.collections.iter().filter(|o| o.is_success())
    }

    pub fn total_size(&self) -> String {
        format_size(self.total_size_bytes)
    }
}

/// Success/failure split shared by backup and restore aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tally {
    AllSucceeded,
    Mixed,
    AllFailed,
}

impl Tally {
    /// An empty set counts as failed: nothing was transferred.
    pub(crate) fn of(succeeded: usize, failed: usize) -> Self {
        match (succeeded, failed) {
            (s, 0) if s > 0 => Tally::AllSucceeded,
            (0, _) => Tally::AllFailed,
            _ => Tally::Mixed,
        }
    }
}
