//! Per-tick schedule evaluation.
//!
//! [`evaluate`] is pure: given a schedule, its last state, its backup history
//! and the current time it returns the next state plus the commands to run.
//! [`ScheduleCoordinator::tick`] stores that state, then executes the
//! commands. Ticks are driven from outside; nothing here owns a timer.

use crate::models::schedule::RECENT_BACKUPS_LIMIT;
use crate::models::{
    BackupId, BackupPhase, BackupRecord, BackupRequest, RecentBackup, SchedulePhase, ScheduleSpec, ScheduleState,
};
use crate::orchestrator::BackupOrchestrator;
use crate::ports::{BlobStore, RecordFilter, RecordStore, ScheduleStateStore};
use crate::retention::classify;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleCommand {
    StartBackup(BackupRequest),
    /// Delete these backups' blobs, then their records.
    Prune(Vec<BackupId>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub state: ScheduleState,
    pub commands: Vec<ScheduleCommand>,
}

pub fn evaluate(spec: &ScheduleSpec, state: &ScheduleState, history: &[BackupRecord], now: DateTime<Utc>) -> Evaluation {
    let mut owned: Vec<&BackupRecord> = history
        .iter()
        .filter(|r| r.schedule.as_deref() == Some(spec.name.as_str()))
        .collect();
    owned.sort_by(|a, b| b.id.cmp(&a.id));

    let mut next = state.clone();
    summarize(&mut next, &owned);

    if spec.suspend || state.suspended {
        next.phase = SchedulePhase::Suspended;
        next.next_due = None;
        return Evaluation {
            state: next,
            commands: Vec::new(),
        };
    }

    next.phase = SchedulePhase::Active;
    let mut commands = Vec::new();

    if spec.schedule.is_due(state.last_fired, now) {
        let request = scheduled_request(spec, now);
        debug!(schedule = %spec.name, backup = %request.name, "Schedule is due");
        next.last_fired = Some(now);
        next.last_backup_name = Some(request.name.clone());
        next.last_backup_phase = Some(BackupPhase::InProgress);
        next.active_backup = Some(request.name.clone());
        commands.push(ScheduleCommand::StartBackup(request));
    }

    let classification = classify(owned.iter().copied(), &spec.retention, now);
    if !classification.delete.is_empty() {
        commands.push(ScheduleCommand::Prune(classification.delete.into_iter().collect()));
    }

    next.next_due = next.last_fired.and_then(|last| spec.schedule.next_due(last));
    Evaluation { state: next, commands }
}

/// Request for the backup a schedule fires at `now`, named `{schedule}-{YYYYmmdd-HHMMSS}`.
pub fn scheduled_request(spec: &ScheduleSpec, now: DateTime<Utc>) -> BackupRequest {
    let mut request = BackupRequest::new(spec.cluster.clone(), now, spec.storage.clone())
        .with_collections(spec.collections.iter().cloned());
    request.name = format!("{}-{}", spec.name, request.id.created_at.format("%Y%m%d-%H%M%S"));
    request.schedule = Some(spec.name.clone());
    request
}

/// Status fields derived from history, newest first.
fn summarize(state: &mut ScheduleState, newest_first: &[&BackupRecord]) {
    if let Some(latest) = newest_first.first() {
        state.last_backup_name = Some(latest.name.clone());
        state.last_backup_phase = Some(latest.phase);
    }
    state.active_backup = newest_first
        .iter()
        .find(|r| !r.phase.is_terminal())
        .map(|r| r.name.clone());
    state.recent_backups = newest_first
        .iter()
        .take(RECENT_BACKUPS_LIMIT)
        .map(|r| RecentBackup::from(*r))
        .collect();
}

/// What one tick did.
#[derive(Debug)]
pub struct TickReport {
    pub state: ScheduleState,
    /// The backup started by this tick, if it fired
    pub dispatched: Option<JoinHandle<Result<BackupRecord>>>,
    /// Backups whose blobs and record are gone
    pub pruned: Vec<BackupId>,
}

pub struct ScheduleCoordinator {
    backups: Arc<BackupOrchestrator>,
    records: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    states: Arc<dyn ScheduleStateStore>,
}

impl ScheduleCoordinator {
    pub fn new(
        backups: Arc<BackupOrchestrator>,
        records: Arc<dyn RecordStore>,
        blobs: Arc<dyn BlobStore>,
        states: Arc<dyn ScheduleStateStore>,
    ) -> Self {
        Self {
            backups,
            records,
            blobs,
            states,
        }
    }

    /// Last stored state of `spec`, or a fresh one.
    pub async fn state(&self, spec: &ScheduleSpec) -> Result<ScheduleState> {
        Ok(self.states.load(&spec.name).await?.unwrap_or_default())
    }

    /// Suspend or resume `spec` until toggled again. A spec suspended in its
    /// definition stays suspended either way.
    pub async fn set_suspended(&self, spec: &ScheduleSpec, suspended: bool) -> Result<ScheduleState> {
        let mut state = self.state(spec).await?;
        state.suspended = suspended;
        if spec.suspend || suspended {
            state.phase = SchedulePhase::Suspended;
            state.next_due = None;
        } else {
            state.phase = SchedulePhase::Active;
            state.next_due = state.last_fired.and_then(|last| spec.schedule.next_due(last));
        }
        self.states.store(&spec.name, &state).await?;
        info!(schedule = %spec.name, suspended, "Schedule toggled");
        Ok(state)
    }

    /// Evaluate `spec` once. The advanced state is stored before any backup
    /// is dispatched; if that fails nothing is started, so a lost `last_fired`
    /// can never fire the same occurrence twice.
    pub async fn tick(&self, spec: &ScheduleSpec, now: DateTime<Utc>, cancel: &CancellationToken) -> Result<TickReport> {
        let current = self.state(spec).await?;
        let history = self.records.list(&RecordFilter::for_schedule(&spec.name)).await?;
        let Evaluation { state, commands } = evaluate(spec, &current, &history, now);
        if state != current {
            self.states.store(&spec.name, &state).await?;
        }

        let mut dispatched = None;
        let mut pruned = Vec::new();
        for command in commands {
            match command {
                ScheduleCommand::StartBackup(request) => {
                    info!("Schedule {} starting backup {}", spec.name, request.name);
                    let backups = self.backups.clone();
                    let cancel = cancel.clone();
                    dispatched = Some(tokio::spawn(async move { backups.execute(request, &cancel).await }));
                }
                ScheduleCommand::Prune(ids) => {
                    for id in ids {
                        let Some(record) = history.iter().find(|r| r.id == id) else {
                            continue;
                        };
                        match self.prune(record).await {
                            Ok(()) => {
                                info!("Schedule {} pruned backup {}", spec.name, record.name);
                                pruned.push(id);
                            }
                            Err(e) => warn!("Failed to prune backup {}: {}", record.name, e),
                        }
                    }
                }
            }
        }

        Ok(TickReport {
            state,
            dispatched,
            pruned,
        })
    }

    /// Delete every stored snapshot of `record`, then the record itself. The
    /// record stays if any blob survives so the next tick retries.
    async fn prune(&self, record: &BackupRecord) -> Result<()> {
        let mut failed = 0;
        for key in record.collections.iter().filter_map(|o| o.snapshot_key.as_deref()) {
            match self.blobs.delete(&record.storage.bucket, key).await {
                Ok(()) | Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    warn!(backup = %record.id, key, error = %e, "Blob delete failed");
                    failed += 1;
                }
            }
        }
        if failed > 0 {
            return Err(EngineError::Transient(format!(
                "{failed} snapshot(s) of {} could not be deleted",
                record.name
            )));
        }
        self.records.remove(&record.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClusterRef, CollectionOutcome, StorageTarget};
    use crate::retention::RetentionPolicy;
    use crate::schedule::CronSchedule;
    use crate::testing::{fast_config, Harness};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::TimeZone;
    use futures_util::stream::{BoxStream, StreamExt};

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, d, h, 0, 0).unwrap()
    }

    fn spec(retention: RetentionPolicy) -> ScheduleSpec {
        ScheduleSpec {
            name: "nightly".into(),
            cluster: ClusterRef::new("default", "vectors"),
            schedule: CronSchedule::parse("0 2 * * *").unwrap(),
            storage: StorageTarget::new("backups", "prod"),
            collections: Vec::new(),
            retention,
            suspend: false,
        }
    }

    fn finished(spec: &ScheduleSpec, when: DateTime<Utc>) -> BackupRecord {
        let mut record = BackupRecord::start(&scheduled_request(spec, when), when);
        let key = record.key_for("docs", "docs.snapshot");
        record.finish(vec![CollectionOutcome::succeeded("docs", "docs.snapshot", key, 3)], when);
        record
    }

    #[test]
    fn test_first_evaluation_fires() {
        let spec = spec(RetentionPolicy::default());
        let eval = evaluate(&spec, &ScheduleState::default(), &[], at(1, 0));

        assert_eq!(eval.commands.len(), 1);
        let ScheduleCommand::StartBackup(request) = &eval.commands[0] else {
            panic!("expected a backup");
        };
        assert_eq!(request.name, "nightly-20240101-000000");
        assert_eq!(request.schedule.as_deref(), Some("nightly"));
        assert_eq!(eval.state.last_fired, Some(at(1, 0)));
        assert_eq!(eval.state.next_due, Some(at(1, 2)));
        assert_eq!(eval.state.active_backup.as_deref(), Some("nightly-20240101-000000"));
    }

    #[test]
    fn test_not_due_until_next_occurrence() {
        let spec = spec(RetentionPolicy::default());
        let state = ScheduleState {
            last_fired: Some(at(1, 2)),
            ..Default::default()
        };

        let early = evaluate(&spec, &state, &[], at(1, 23));
        assert!(early.commands.is_empty());
        assert_eq!(early.state.last_fired, Some(at(1, 2)));
        assert_eq!(early.state.next_due, Some(at(2, 2)));

        let due = evaluate(&spec, &state, &[], at(2, 2) + chrono::Duration::seconds(1));
        assert!(matches!(due.commands.as_slice(), [ScheduleCommand::StartBackup(_)]));
    }

    #[test]
    fn test_suspended_schedule_does_nothing() {
        let mut spec = spec(RetentionPolicy::default());
        spec.suspend = true;
        let history = vec![finished(&spec, at(1, 2)), finished(&spec, at(2, 2))];

        let eval = evaluate(&spec, &ScheduleState::default(), &history, at(5, 0));

        assert!(eval.commands.is_empty());
        assert_eq!(eval.state.phase, SchedulePhase::Suspended);
        assert_eq!(eval.state.next_due, None);
        assert_eq!(eval.state.last_fired, None);
    }

    #[test]
    fn test_retention_only_sees_own_history() {
        let spec = spec(RetentionPolicy {
            keep_last: 1,
            ..Default::default()
        });
        let mut other = spec.clone();
        other.name = "hourly".into();
        let history = vec![
            finished(&spec, at(1, 2)),
            finished(&spec, at(2, 2)),
            finished(&other, at(1, 3)),
        ];
        let state = ScheduleState {
            last_fired: Some(at(2, 2)),
            ..Default::default()
        };

        let eval = evaluate(&spec, &state, &history, at(2, 3));

        assert_eq!(eval.commands, vec![ScheduleCommand::Prune(vec![history[0].id.clone()])]);
        assert_eq!(eval.state.last_backup_name.as_deref(), Some("nightly-20240102-020000"));
        assert_eq!(eval.state.last_backup_phase, Some(BackupPhase::Completed));
        assert_eq!(eval.state.recent_backups.len(), 2);
        assert_eq!(eval.state.active_backup, None);
    }

    #[test]
    fn test_recent_backups_are_bounded() {
        let spec = spec(RetentionPolicy {
            keep_last: 100,
            ..Default::default()
        });
        let history: Vec<_> = (1..=8).map(|d| finished(&spec, at(d, 2))).collect();
        let state = ScheduleState {
            last_fired: Some(at(8, 2)),
            ..Default::default()
        };

        let eval = evaluate(&spec, &state, &history, at(8, 3));

        assert_eq!(eval.state.recent_backups.len(), RECENT_BACKUPS_LIMIT);
        assert_eq!(eval.state.recent_backups[0].name, "nightly-20240108-020000");
    }

    #[test]
    fn test_runtime_suspension_overrides_active_spec() {
        let spec = spec(RetentionPolicy::default());
        let state = ScheduleState {
            suspended: true,
            ..Default::default()
        };

        let eval = evaluate(&spec, &state, &[], at(5, 3));

        assert!(eval.commands.is_empty());
        assert_eq!(eval.state.phase, SchedulePhase::Suspended);
        assert!(eval.state.suspended);
    }

    fn coordinator(harness: &Harness) -> ScheduleCoordinator {
        let collaborators = harness.collaborators();
        let backups = Arc::new(BackupOrchestrator::new(&collaborators, &fast_config()));
        ScheduleCoordinator::new(backups, collaborators.records, collaborators.blobs, harness.states.clone())
    }

    async fn fired_at(harness: &Harness, spec: &ScheduleSpec, when: DateTime<Utc>) {
        let state = ScheduleState {
            last_fired: Some(when),
            ..Default::default()
        };
        harness.states.store(&spec.name, &state).await.unwrap();
    }

    #[tokio::test]
    async fn test_tick_dispatches_and_prunes() {
        let harness = Harness::new(&["docs"]);
        let spec = spec(RetentionPolicy {
            keep_last: 1,
            ..Default::default()
        });
        let coordinator = coordinator(&harness);
        let cancel = CancellationToken::new();

        let first = coordinator.tick(&spec, at(1, 2), &cancel).await.unwrap();
        let record = first.dispatched.unwrap().await.unwrap().unwrap();
        assert_eq!(record.phase, BackupPhase::Completed);
        assert!(first.pruned.is_empty());
        assert_eq!(coordinator.state(&spec).await.unwrap(), first.state);

        let second = coordinator.tick(&spec, at(2, 2), &cancel).await.unwrap();
        second.dispatched.unwrap().await.unwrap().unwrap();

        // Retention runs against the history seen at tick start.
        let third = coordinator.tick(&spec, at(2, 3), &cancel).await.unwrap();
        assert!(third.dispatched.is_none());
        assert_eq!(third.pruned, vec![record.id.clone()]);
        assert!(harness.records.get(&record.id).await.unwrap().is_none());
        assert_eq!(harness.blobs.len(), 1);
    }

    /// State store that can read but never write.
    struct ReadOnlyStates;

    #[async_trait]
    impl ScheduleStateStore for ReadOnlyStates {
        async fn load(&self, _: &str) -> Result<Option<ScheduleState>> {
            Ok(None)
        }
        async fn store(&self, _: &str, _: &ScheduleState) -> Result<()> {
            Err(EngineError::Store("database is locked".into()))
        }
    }

    #[tokio::test]
    async fn test_nothing_fires_when_state_cannot_be_stored() {
        let harness = Harness::new(&["docs"]);
        let collaborators = harness.collaborators();
        let backups = Arc::new(BackupOrchestrator::new(&collaborators, &fast_config()));
        let coordinator =
            ScheduleCoordinator::new(backups, collaborators.records, collaborators.blobs, Arc::new(ReadOnlyStates));
        let spec = spec(RetentionPolicy::default());

        let result = coordinator.tick(&spec, at(1, 2), &CancellationToken::new()).await;

        assert!(matches!(result, Err(EngineError::Store(_))));
        assert!(harness.records.is_empty());
        assert_eq!(harness.cluster.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_suspend_and_resume_at_runtime() {
        let harness = Harness::new(&["docs"]);
        let coordinator = coordinator(&harness);
        let spec = spec(RetentionPolicy::default());
        let cancel = CancellationToken::new();
        fired_at(&harness, &spec, at(1, 2)).await;

        let paused = coordinator.set_suspended(&spec, true).await.unwrap();
        assert_eq!(paused.phase, SchedulePhase::Suspended);
        assert_eq!(paused.next_due, None);

        let report = coordinator.tick(&spec, at(3, 3), &cancel).await.unwrap();
        assert!(report.dispatched.is_none());
        assert_eq!(report.state.phase, SchedulePhase::Suspended);

        let resumed = coordinator.set_suspended(&spec, false).await.unwrap();
        assert_eq!(resumed.phase, SchedulePhase::Active);
        assert_eq!(resumed.next_due, Some(at(2, 2)));

        // Missed nights coalesce into one backup.
        let report = coordinator.tick(&spec, at(3, 3), &cancel).await.unwrap();
        report.dispatched.unwrap().await.unwrap().unwrap();
        assert_eq!(report.state.last_fired, Some(at(3, 3)));
        assert_eq!(harness.records.len(), 1);
    }

    #[tokio::test]
    async fn test_suspended_spec_stays_suspended_on_resume() {
        let harness = Harness::new(&["docs"]);
        let mut spec = spec(RetentionPolicy::default());
        spec.suspend = true;

        let state = coordinator(&harness).set_suspended(&spec, false).await.unwrap();
        assert_eq!(state.phase, SchedulePhase::Suspended);
        assert!(!state.suspended);
    }

    /// Blob store whose deletes always fail.
    struct StuckBlobs;

    #[async_trait]
    impl BlobStore for StuckBlobs {
        async fn put(&self, _: &str, _: &str, _: Bytes) -> Result<String> {
            Ok(String::new())
        }
        async fn get(&self, bucket: &str, key: &str) -> Result<Bytes> {
            Err(EngineError::NotFound(format!("{bucket}/{key}")))
        }
        async fn delete(&self, _: &str, _: &str) -> Result<()> {
            Err(EngineError::Transient("bucket unavailable".into()))
        }
        fn list(&self, _: &str, _: &str) -> BoxStream<'static, Result<String>> {
            futures_util::stream::empty().boxed()
        }
    }

    #[tokio::test]
    async fn test_record_survives_failed_blob_delete() {
        let harness = Harness::new(&["docs"]);
        let spec = spec(RetentionPolicy::default());
        let old = finished(&spec, at(1, 2));
        harness.records.create_if_absent(old.clone()).await.unwrap();
        fired_at(&harness, &spec, at(1, 2)).await;

        let collaborators = harness.collaborators();
        let backups = Arc::new(BackupOrchestrator::new(&collaborators, &fast_config()));
        let coordinator =
            ScheduleCoordinator::new(backups, collaborators.records, Arc::new(StuckBlobs), harness.states.clone());

        let report = coordinator.tick(&spec, at(1, 3), &CancellationToken::new()).await.unwrap();

        assert!(report.pruned.is_empty());
        assert!(harness.records.get(&old.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_blobs_count_as_deleted() {
        let harness = Harness::new(&["docs"]);
        let spec = spec(RetentionPolicy::default());
        let old = finished(&spec, at(1, 2));
        harness.records.create_if_absent(old.clone()).await.unwrap();
        fired_at(&harness, &spec, at(1, 2)).await;

        let report = coordinator(&harness)
            .tick(&spec, at(1, 3), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.pruned, vec![old.id.clone()]);
        assert!(harness.records.is_empty());
    }
}
