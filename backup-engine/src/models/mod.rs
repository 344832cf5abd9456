//! Data model: backup and restore records, requests and schedule state.

pub mod backup;
pub mod restore;
pub mod schedule;

pub use backup::{
    BackupId, BackupPhase, BackupRecord, BackupRequest, ClusterRef, CollectionError,
    CollectionOutcome, Condition, Snapshot, StorageTarget,
};
pub use restore::{
    CollectionMapping, RestorePhase, RestoreProgress, RestoreRecord, RestoreRequest,
    RestoreSource, RestoredCollection,
};
pub use schedule::{RecentBackup, SchedulePhase, ScheduleSpec, ScheduleState};
