//! Table definitions for the task store.
//!
//! All stages share one table keyed by `(stage, subject_id)`. Timestamps are
//! stored as Unix milliseconds so due-time comparisons stay integer compares.

use sqlx::SqlitePool;
use tracing::info;

use glimpse_core::{Error, Result};

/// Name of the shared task table.
pub const TASKS_TABLE: &str = "pipeline_tasks";

const STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS pipeline_tasks (
         id          INTEGER PRIMARY KEY AUTOINCREMENT,
         stage       TEXT    NOT NULL,
         subject_id  INTEGER NOT NULL,
         status      TEXT    NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'running', 'succeeded', 'failed', 'failed_permanent')),
         attempts    INTEGER NOT NULL DEFAULT 0,
         next_run_at INTEGER,
         payload     TEXT    NOT NULL,
         last_error  TEXT,
         created_at  INTEGER NOT NULL,
         updated_at  INTEGER NOT NULL,
         UNIQUE (stage, subject_id)
     )",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_tasks_due
         ON pipeline_tasks (stage, status, next_run_at)",
    "CREATE INDEX IF NOT EXISTS idx_pipeline_tasks_running
         ON pipeline_tasks (stage, status, updated_at)",
];

/// Create the task table and its indexes if they are missing.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(Error::Database)?;
    }
    info!(
        subsystem = "database",
        component = "schema",
        op = "migrate",
        table = TASKS_TABLE,
        "Task schema ready"
    );
    Ok(())
}
