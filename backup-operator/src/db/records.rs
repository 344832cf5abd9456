//! SQLite persistence for backup records, restore records and schedule state.
//!
//! Records are stored whole as JSON; the indexed columns only serve lookups.

use crate::db::connection::DbPool;
use async_trait::async_trait;
use backup_engine::models::{BackupId, BackupRecord, ClusterRef, RestorePhase, RestoreRecord, ScheduleState};
use backup_engine::ports::{Admission, RecordFilter, RecordStore, ScheduleStateStore};
use backup_engine::store::check_update;
use backup_engine::{EngineError, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

fn store_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Store(e.to_string())
}

fn row_to_backup(row: &Row) -> rusqlite::Result<String> {
    row.get("body")
}

fn decode<T: serde::de::DeserializeOwned>(body: String) -> Result<T> {
    Ok(serde_json::from_str(&body)?)
}

// ── Backup records ──

pub fn find_backup(conn: &Connection, id: &BackupId) -> Result<Option<BackupRecord>> {
    conn.query_row(
        "SELECT body FROM backup_records WHERE cluster_namespace = ?1 AND cluster_name = ?2 AND created_at = ?3",
        params![id.cluster.namespace, id.cluster.name, id.stamp()],
        row_to_backup,
    )
    .optional()
    .map_err(store_err)?
    .map(decode)
    .transpose()
}

pub fn insert_backup_if_absent(conn: &Connection, record: &BackupRecord) -> Result<Admission> {
    let inserted = conn
        .execute(
            "INSERT INTO backup_records (cluster_namespace, cluster_name, created_at, name, schedule, phase, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT DO NOTHING",
            params![
                record.id.cluster.namespace,
                record.id.cluster.name,
                record.id.stamp(),
                record.name,
                record.schedule,
                record.phase.as_str(),
                serde_json::to_string(record)?,
            ],
        )
        .map_err(store_err)?;

    if inserted == 1 {
        return Ok(Admission::Created(record.clone()));
    }
    find_backup(conn, &record.id)?
        .map(Admission::Existing)
        .ok_or_else(|| EngineError::Store(format!("backup {} vanished during insert", record.id)))
}

pub fn update_backup(conn: &mut Connection, record: &BackupRecord) -> Result<()> {
    let tx = conn.transaction().map_err(store_err)?;
    let current = find_backup(&tx, &record.id)?
        .ok_or_else(|| EngineError::NotFound(format!("backup {}", record.id)))?;
    check_update(&current, record)?;
    tx.execute(
        "UPDATE backup_records SET phase = ?4, body = ?5, updated_at = datetime('now')
         WHERE cluster_namespace = ?1 AND cluster_name = ?2 AND created_at = ?3",
        params![
            record.id.cluster.namespace,
            record.id.cluster.name,
            record.id.stamp(),
            record.phase.as_str(),
            serde_json::to_string(record)?,
        ],
    )
    .map_err(store_err)?;
    tx.commit().map_err(store_err)
}

pub fn list_backups(conn: &Connection, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
    let (namespace, name) = match &filter.cluster {
        Some(c) => (Some(c.namespace.as_str()), Some(c.name.as_str())),
        None => (None, None),
    };
    let mut stmt = conn
        .prepare(
            "SELECT body FROM backup_records
             WHERE (?1 IS NULL OR cluster_namespace = ?1)
               AND (?2 IS NULL OR cluster_name = ?2)
               AND (?3 IS NULL OR schedule = ?3)
             ORDER BY created_at ASC, cluster_namespace ASC, cluster_name ASC",
        )
        .map_err(store_err)?;
    let bodies = stmt
        .query_map(params![namespace, name, filter.schedule], row_to_backup)
        .map_err(store_err)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(store_err)?;
    bodies.into_iter().map(decode).collect()
}

pub fn delete_backup(conn: &Connection, id: &BackupId) -> Result<()> {
    conn.execute(
        "DELETE FROM backup_records WHERE cluster_namespace = ?1 AND cluster_name = ?2 AND created_at = ?3",
        params![id.cluster.namespace, id.cluster.name, id.stamp()],
    )
    .map_err(store_err)?;
    Ok(())
}

// ── Restore records ──

fn phase_str(phase: RestorePhase) -> &'static str {
    match phase {
        RestorePhase::InProgress => "InProgress",
        RestorePhase::Completed => "Completed",
        RestorePhase::PartiallyFailed => "PartiallyFailed",
        RestorePhase::Failed => "Failed",
    }
}

/// Returns false if a restore with this name already exists.
pub fn insert_restore(conn: &Connection, record: &RestoreRecord) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT INTO restore_records (name, phase, body, started_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO NOTHING",
            params![
                record.name,
                phase_str(record.phase),
                serde_json::to_string(record)?,
                record.started_at.to_rfc3339(),
            ],
        )
        .map_err(store_err)?;
    Ok(inserted == 1)
}

/// Overwrite a restore that has not finished yet. Finished restores are left alone.
pub fn update_restore(conn: &Connection, record: &RestoreRecord) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE restore_records SET phase = ?2, body = ?3, updated_at = datetime('now')
             WHERE name = ?1 AND phase = 'InProgress'",
            params![record.name, phase_str(record.phase), serde_json::to_string(record)?],
        )
        .map_err(store_err)?;
    Ok(updated == 1)
}

pub fn find_restore(conn: &Connection, name: &str) -> Result<Option<RestoreRecord>> {
    conn.query_row("SELECT body FROM restore_records WHERE name = ?1", params![name], |row| {
        row.get::<_, String>("body")
    })
    .optional()
    .map_err(store_err)?
    .map(decode)
    .transpose()
}

pub fn list_restores(conn: &Connection) -> Result<Vec<RestoreRecord>> {
    let mut stmt = conn
        .prepare("SELECT body FROM restore_records ORDER BY started_at DESC")
        .map_err(store_err)?;
    let bodies = stmt
        .query_map([], |row| row.get::<_, String>("body"))
        .map_err(store_err)?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(store_err)?;
    bodies.into_iter().map(decode).collect()
}

// ── Schedule state ──

pub fn find_schedule_state(conn: &Connection, name: &str) -> Result<Option<ScheduleState>> {
    conn.query_row("SELECT body FROM schedule_states WHERE name = ?1", params![name], |row| {
        row.get::<_, String>("body")
    })
    .optional()
    .map_err(store_err)?
    .map(decode)
    .transpose()
}

pub fn save_schedule_state(conn: &Connection, name: &str, state: &ScheduleState) -> Result<()> {
    conn.execute(
        "INSERT INTO schedule_states (name, body) VALUES (?1, ?2)
         ON CONFLICT(name) DO UPDATE SET body = excluded.body, updated_at = datetime('now')",
        params![name, serde_json::to_string(state)?],
    )
    .map_err(store_err)?;
    Ok(())
}

/// [`RecordStore`] over the SQLite pool. Every call runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: DbPool,
}

impl SqliteRecordStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(store_err)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| EngineError::Store(format!("database task failed: {e}")))?
    }

    pub async fn create_restore(&self, record: &RestoreRecord) -> Result<bool> {
        let record = record.clone();
        self.blocking(move |conn| insert_restore(conn, &record)).await
    }

    pub async fn save_restore(&self, record: &RestoreRecord) -> Result<bool> {
        let record = record.clone();
        self.blocking(move |conn| update_restore(conn, &record)).await
    }

    pub async fn restore(&self, name: &str) -> Result<Option<RestoreRecord>> {
        let name = name.to_string();
        self.blocking(move |conn| find_restore(conn, &name)).await
    }

    pub async fn restores(&self) -> Result<Vec<RestoreRecord>> {
        self.blocking(|conn| list_restores(conn)).await
    }

    /// Mark every restore still in progress as failed with `reason`.
    pub async fn fail_running_restores(&self, reason: &str) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for mut record in self.restores().await? {
            if record.phase.is_terminal() {
                continue;
            }
            record.fail(reason, chrono::Utc::now());
            if self.save_restore(&record).await? {
                failed.push(record.name);
            }
        }
        Ok(failed)
    }

    pub async fn schedule_state(&self, name: &str) -> Result<Option<ScheduleState>> {
        let name = name.to_string();
        self.blocking(move |conn| find_schedule_state(conn, &name)).await
    }

    pub async fn save_schedule_state(&self, name: &str, state: &ScheduleState) -> Result<()> {
        let (name, state) = (name.to_string(), state.clone());
        self.blocking(move |conn| save_schedule_state(conn, &name, &state)).await
    }

    pub async fn backups_of(&self, cluster: Option<ClusterRef>, schedule: Option<String>) -> Result<Vec<BackupRecord>> {
        self.list(&RecordFilter { cluster, schedule }).await
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn create_if_absent(&self, record: BackupRecord) -> Result<Admission> {
        self.blocking(move |conn| insert_backup_if_absent(conn, &record)).await
    }

    async fn get(&self, id: &BackupId) -> Result<Option<BackupRecord>> {
        let id = id.clone();
        self.blocking(move |conn| find_backup(conn, &id)).await
    }

    async fn save(&self, record: &BackupRecord) -> Result<()> {
        let record = record.clone();
        self.blocking(move |conn| update_backup(conn, &record)).await
    }

    async fn list(&self, filter: &RecordFilter) -> Result<Vec<BackupRecord>> {
        let filter = filter.clone();
        self.blocking(move |conn| list_backups(conn, &filter)).await
    }

    async fn remove(&self, id: &BackupId) -> Result<()> {
        let id = id.clone();
        self.blocking(move |conn| delete_backup(conn, &id)).await
    }
}

#[async_trait]
impl ScheduleStateStore for SqliteRecordStore {
    async fn load(&self, schedule: &str) -> Result<Option<ScheduleState>> {
        self.schedule_state(schedule).await
    }

    async fn store(&self, schedule: &str, state: &ScheduleState) -> Result<()> {
        self.save_schedule_state(schedule, state).await
    }
}
