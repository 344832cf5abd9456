use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS backup_records (
  cluster_namespace TEXT NOT NULL,
  cluster_name TEXT NOT NULL,
  created_at TEXT NOT NULL,
  name TEXT NOT NULL,
  schedule TEXT,
  phase TEXT NOT NULL CHECK(phase IN ('InProgress','Completed','PartiallyFailed','Failed')),
  body TEXT NOT NULL,
  updated_at TEXT NOT NULL DEFAULT (datetime('now')),
  PRIMARY KEY (cluster_namespace, cluster_name, created_at)
);

CREATE TABLE IF NOT EXISTS restore_records (
  name TEXT PRIMARY KEY,
  phase TEXT NOT NULL CHECK(phase IN ('InProgress','Completed','PartiallyFailed','Failed')),
  body TEXT NOT NULL,
  started_at TEXT NOT NULL,
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS schedule_states (
  name TEXT PRIMARY KEY,
  body TEXT NOT NULL,
  updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_backup_records_schedule ON backup_records(schedule);
CREATE INDEX IF NOT EXISTS idx_backup_records_created_at ON backup_records(created_at);
"#;

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
