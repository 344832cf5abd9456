//! Periodic schedule evaluation.
//!
//! Every tick lets the coordinator evaluate each schedule: it stores the
//! advanced state, then fires and prunes. Backups it starts run on the shared
//! task tracker so shutdown can wait for them.

use crate::state::AppState;
use backup_engine::models::ScheduleSpec;
use backup_engine::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

pub fn start_schedule_ticker(state: Arc<AppState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = Duration::from_secs(state.config.server.tick_interval_secs);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(schedules = state.config.schedules.len(), every = ?period, "Schedule ticker started");

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = interval.tick() => run_tick(&state, Utc::now()).await,
            }
        }
        info!("Schedule ticker stopped");
    })
}

/// Evaluate every configured schedule once. A failing schedule does not stop the others.
pub async fn run_tick(state: &Arc<AppState>, now: DateTime<Utc>) {
    for spec in &state.config.schedules {
        if let Err(e) = tick_schedule(state, spec, now).await {
            warn!(schedule = %spec.name, error = %e, "Schedule tick failed");
        }
    }
}

async fn tick_schedule(state: &Arc<AppState>, spec: &ScheduleSpec, now: DateTime<Utc>) -> Result<()> {
    let report = state.coordinator.tick(spec, now, &state.shutdown).await?;

    if !report.pruned.is_empty() {
        info!(schedule = %spec.name, pruned = report.pruned.len(), "Retention applied");
    }

    if let Some(handle) = report.dispatched {
        let schedule = spec.name.clone();
        state.tasks.spawn(async move {
            match handle.await {
                Ok(Ok(record)) => info!(%schedule, backup = %record.name, phase = %record.phase, "Scheduled backup finished"),
                Ok(Err(e)) => warn!(%schedule, error = %e, "Scheduled backup did not finish"),
                Err(e) => error!(%schedule, error = %e, "Scheduled backup task panicked"),
            }
        });
    }
    Ok(())
}
