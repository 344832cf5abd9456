use super::backup::{BackupPhase, BackupRecord, ClusterRef, StorageTarget};
use crate::retention::RetentionPolicy;
use crate::schedule::CronSchedule;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many recent backups a schedule reports in its status.
pub const RECENT_BACKUPS_LIMIT: usize = 5;

/// A periodic backup definition. The cron expression is validated when the
/// schedule is built or deserialized, never at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSpec {
    pub name: String,
    pub cluster: ClusterRef,
    pub schedule: CronSchedule,
    pub storage: StorageTarget,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulePhase {
    Active,
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentBackup {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub phase: BackupPhase,
    pub size: String,
}

impl From<&BackupRecord> for RecentBackup {
    fn from(record: &BackupRecord) -> Self {
        Self {
            name: record.name.clone(),
            created_at: record.id.created_at,
            completed_at: record.completed_at,
            phase: record.phase,
            size: record.total_size(),
        }
    }
}

/// Status of one schedule. Only the coordinator advances it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    pub phase: SchedulePhase,
    /// Suspended at runtime, on top of the configured `suspend` flag.
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub last_fired: Option<DateTime<Utc>>,
    /// Derived from the cron expression and `last_fired`; informational only.
    #[serde(default)]
    pub next_due: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_backup_name: Option<String>,
    #[serde(default)]
    pub last_backup_phase: Option<BackupPhase>,
    #[serde(default)]
    pub active_backup: Option<String>,
    #[serde(default)]
    pub recent_backups: Vec<RecentBackup>,
}

impl Default for ScheduleState {
    fn default() -> Self {
        Self {
            phase: SchedulePhase::Active,
            suspended: false,
            last_fired: None,
            next_due: None,
            last_backup_name: None,
            last_backup_phase: None,
            active_backup: None,
            recent_backups: Vec::new(),
        }
    }
}
