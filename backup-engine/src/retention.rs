//! Multi-tier retention.
//!
//! Eligible backups are sorted newest first. `keep_last` keeps the newest N;
//! each calendar tier (day, ISO week, month) keeps the newest backup of each of
//! its N most recent buckets. Tiers select independently, so one backup may
//! represent several tiers. Whatever no tier selected is deleted.

use crate::models::{BackupId, BackupPhase, BackupRecord};
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Per-tier retention budget. All tiers at zero delete every eligible backup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_last: u32,
    #[serde(default)]
    pub keep_daily: u32,
    #[serde(default)]
    pub keep_weekly: u32,
    #[serde(default)]
    pub keep_monthly: u32,
    /// Allow `PartiallyFailed` backups to be pruned. Off by default: such a
    /// backup may hold the only copy of the collections that did succeed.
    #[serde(default)]
    pub prune_partially_failed: bool,
}

impl RetentionPolicy {
    /// Whether `record` takes part in retention at all. Unfinished, failed and
    /// future-dated backups are never classified.
    pub fn is_eligible(&self, record: &BackupRecord, now: DateTime<Utc>) -> bool {
        if record.id.created_at > now {
            return false;
        }
        match record.phase {
            BackupPhase::Completed => true,
            BackupPhase::PartiallyFailed => self.prune_partially_failed,
            BackupPhase::InProgress | BackupPhase::Failed => false,
        }
    }
}

/// Partition of the eligible backups. Ineligible ones appear in neither set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub keep: BTreeSet<BackupId>,
    pub delete: BTreeSet<BackupId>,
}

/// Classify with calendar buckets in UTC.
pub fn classify<'a, I>(records: I, policy: &RetentionPolicy, now: DateTime<Utc>) -> Classification
where
    I: IntoIterator<Item = &'a BackupRecord>,
{
    classify_in(records, policy, now, &Utc)
}

/// Classify with calendar buckets in the given time zone.
pub fn classify_in<'a, I, Tz>(records: I, policy: &RetentionPolicy, now: DateTime<Utc>, tz: &Tz) -> Classification
where
    I: IntoIterator<Item = &'a BackupRecord>,
    Tz: TimeZone,
{
    let mut eligible: Vec<&BackupRecord> = records
        .into_iter()
        .filter(|r| policy.is_eligible(r, now))
        .collect();
    // Newest first; equal timestamps fall back to the identity string.
    eligible.sort_by(|a, b| {
        b.id.created_at
            .cmp(&a.id.created_at)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
    eligible.dedup_by(|a, b| a.id == b.id);

    let local_date = |r: &BackupRecord| -> NaiveDate { r.id.created_at.with_timezone(tz).date_naive() };

    let mut keep: BTreeSet<BackupId> = eligible
        .iter()
        .take(policy.keep_last as usize)
        .map(|r| r.id.clone())
        .collect();

    keep_per_bucket(&eligible, policy.keep_daily, |r| local_date(r), &mut keep);
    keep_per_bucket(
        &eligible,
        policy.keep_weekly,
        |r| {
            let week = local_date(r).iso_week();
            (week.year(), week.week())
        },
        &mut keep,
    );
    keep_per_bucket(
        &eligible,
        policy.keep_monthly,
        |r| {
            let date = local_date(r);
            (date.year(), date.month())
        },
        &mut keep,
    );

    let delete = eligible
        .iter()
        .map(|r| r.id.clone())
        .filter(|id| !keep.contains(id))
        .collect();

    Classification { keep, delete }
}

/// Keep the first (newest) record of each of the first `budget` buckets.
/// `sorted` is newest first, so every bucket occupies a contiguous run.
fn keep_per_bucket<K, F>(sorted: &[&BackupRecord], budget: u32, bucket_of: F, keep: &mut BTreeSet<BackupId>)
where
    K: PartialEq,
    F: Fn(&BackupRecord) -> K,
{
    let mut current: Option<K> = None;
    let mut used = 0u32;
    for record in sorted {
        let bucket = bucket_of(*record);
        if current.as_ref() == Some(&bucket) {
            continue;
        }
        if used == budget {
            break;
        }
        used += 1;
        keep.insert(record.id.clone());
        current = Some(bucket);
    }
}
