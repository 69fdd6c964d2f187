//! SQLite implementation of the stage task state machine.
//!
//! ```text
//! pending/failed --claim--> running --complete--> succeeded
//!                           running --fail, attempts < max--> failed (next_run_at)
//!                           running --fail, attempts >= max--> failed_permanent
//!                           running --stale--> pending
//!                           running --stale, attempts >= max--> failed_permanent
//!                           running --reject--> failed_permanent
//! ```
//!
//! Queued rows that cannot be decoded are moved to `failed_permanent` by the
//! due scan instead of failing it.
//!
//! Each transition is one conditional statement. Concurrent workers (and
//! concurrent processes sharing the file) rely on SQLite's statement
//! atomicity; a transition that affects zero rows lost a race.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, trace, warn};

use glimpse_core::{
    Error, FailureDisposition, QueueStats, Result, RetryPolicy, Stage, StaleRecovery, TaskPayload,
    TaskRow, TaskStatus, TaskStore,
};

const TASK_COLUMNS: &str = "id, stage, subject_id, status, attempts, next_run_at, payload, \
                            last_error, created_at, updated_at";

/// Longest error text kept on a row.
pub const MAX_ERROR_LEN: usize = 2_000;

/// Task store backed by the shared `pipeline_tasks` table.
#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: SqlitePool,
}

impl SqliteTaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Parse a task row.
    fn parse_task_row(row: &SqliteRow) -> Result<TaskRow> {
        let stage: String = row.get("stage");
        let status: String = row.get("status");
        let attempts: i64 = row.get("attempts");
        let payload: String = row.get("payload");
        let next_run_at: Option<i64> = row.get("next_run_at");

        Ok(TaskRow {
            id: row.get("id"),
            stage: Stage::from_str(&stage)?,
            subject_id: row.get("subject_id"),
            status: TaskStatus::from_str(&status)?,
            attempts: u32::try_from(attempts.max(0)).unwrap_or(u32::MAX),
            next_run_at: next_run_at.map(from_millis).transpose()?,
            payload: TaskPayload::decode(&payload)?,
            last_error: row.get("last_error"),
            created_at: from_millis(row.get("created_at"))?,
            updated_at: from_millis(row.get("updated_at"))?,
        })
    }

    /// Parse rows for read-only listings; undecodable rows are logged and left out.
    fn parse_rows(rows: Vec<SqliteRow>) -> Vec<TaskRow> {
        rows.iter()
            .filter_map(|row| match Self::parse_task_row(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    warn!(
                        subsystem = "database",
                        component = "tasks",
                        task_id = row.try_get::<i64, _>("id").ok(),
                        error = %e,
                        "Skipping undecodable task row"
                    );
                    None
                }
            })
            .collect()
    }

    /// Take an undecodable queued row out of circulation.
    async fn quarantine(&self, row: &SqliteRow, error: &Error, now: DateTime<Utc>) -> Result<()> {
        let task_id: i64 = row.try_get("id").map_err(Error::Database)?;
        let message = format!("undecodable task row: {error}");
        sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'failed_permanent', next_run_at = NULL, last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('pending', 'failed')",
        )
        .bind(truncate_error(&message))
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        warn!(
            subsystem = "database",
            component = "tasks",
            op = "scan_due",
            task_id,
            error = %error,
            "Undecodable task moved to failed_permanent"
        );
        Ok(())
    }

    async fn due_rows(
        &self,
        stage: Stage,
        order: &str,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRow>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM pipeline_tasks
             WHERE stage = ?1
               AND status IN ('pending', 'failed')
               AND attempts < ?2
               AND (next_run_at IS NULL OR next_run_at <= ?3)
             ORDER BY id {order}
             LIMIT ?4"
        );
        let rows = sqlx::query(&query)
            .bind(stage.as_str())
            .bind(i64::from(max_attempts))
            .bind(to_millis(now))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            match Self::parse_task_row(row) {
                Ok(task) => tasks.push(task),
                Err(e) => self.quarantine(row, &e, now).await?,
            }
        }
        Ok(tasks)
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::Internal(format!("timestamp out of range: {ms}")))
}

fn truncate_error(error: &str) -> &str {
    if error.len() <= MAX_ERROR_LEN {
        return error;
    }
    let mut end = MAX_ERROR_LEN;
    while !error.is_char_boundary(end) {
        end -= 1;
    }
    &error[..end]
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn enqueue(
        &self,
        stage: Stage,
        subject_id: i64,
        payload: &TaskPayload,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let encoded = payload.encode()?;
        let now_ms = to_millis(now);

        // A running row keeps its payload; the conflict update is skipped and
        // nothing is returned.
        let row = sqlx::query(
            "INSERT INTO pipeline_tasks (stage, subject_id, status, attempts, payload, created_at, updated_at)
             VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?4)
             ON CONFLICT (stage, subject_id) DO UPDATE
                SET status = 'pending', attempts = 0, next_run_at = NULL,
                    payload = excluded.payload, last_error = NULL, updated_at = excluded.updated_at
              WHERE pipeline_tasks.status != 'running'
             RETURNING id",
        )
        .bind(stage.as_str())
        .bind(subject_id)
        .bind(&encoded)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        let id = row.map(|r| r.get::<i64, _>("id"));
        if id.is_none() {
            debug!(
                subsystem = "database",
                component = "tasks",
                op = "enqueue",
                stage = %stage,
                subject_id,
                "Task already running; enqueue skipped"
            );
        }
        Ok(id)
    }

    async fn claim(&self, task_id: i64, max_attempts: u32, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = to_millis(now);
        let result = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'running', attempts = attempts + 1, next_run_at = NULL, updated_at = ?1
             WHERE id = ?2
               AND status IN ('pending', 'failed')
               AND attempts < ?3
               AND (next_run_at IS NULL OR next_run_at <= ?1)",
        )
        .bind(now_ms)
        .bind(task_id)
        .bind(i64::from(max_attempts))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        let claimed = result.rows_affected() == 1;
        if !claimed {
            trace!(
                subsystem = "database",
                component = "tasks",
                op = "claim",
                task_id,
                "Claim lost"
            );
        }
        Ok(claimed)
    }

    async fn complete(&self, task_id: i64, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'succeeded', next_run_at = NULL, last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'running'",
        )
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            if self.get(task_id).await?.is_none() {
                return Err(Error::TaskNotFound(task_id));
            }
            debug!(
                subsystem = "database",
                component = "tasks",
                op = "complete",
                task_id,
                "Task no longer running; completion ignored"
            );
        }
        Ok(())
    }

    async fn fail(
        &self,
        task_id: i64,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition> {
        let current: Option<(i64,)> =
            sqlx::query_as("SELECT attempts FROM pipeline_tasks WHERE id = ?1 AND status = 'running'")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        let Some((attempts,)) = current else {
            return Ok(FailureDisposition::Skipped);
        };
        let attempts_u32 = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);

        let (status, next_run_at, disposition) = if policy.is_exhausted(attempts_u32) {
            ("failed_permanent", None, FailureDisposition::Permanent)
        } else {
            let next = policy.next_run_at(attempts_u32, now);
            (
                "failed",
                Some(to_millis(next)),
                FailureDisposition::Retry { next_run_at: next },
            )
        };

        // Guarded on the attempts just read: a stale recovery plus re-claim
        // in between makes this a no-op instead of clobbering the new run.
        let result = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = ?1, next_run_at = ?2, last_error = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'running' AND attempts = ?6",
        )
        .bind(status)
        .bind(next_run_at)
        .bind(truncate_error(error))
        .bind(to_millis(now))
        .bind(task_id)
        .bind(attempts)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if result.rows_affected() == 0 {
            return Ok(FailureDisposition::Skipped);
        }
        Ok(disposition)
    }

    async fn reject(&self, task_id: i64, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'failed_permanent', next_run_at = NULL, last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status = 'running'",
        )
        .bind(truncate_error(error))
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_stale(
        &self,
        stage: Stage,
        stale_after: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<StaleRecovery> {
        let now_ms = to_millis(now);
        let cutoff = now_ms.saturating_sub(stale_after.as_millis() as i64);

        // Attempts do not change while a row is running, so the two sweeps
        // partition the stale rows.
        let exhausted = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'failed_permanent', next_run_at = NULL,
                 last_error = COALESCE(last_error, 'stale after final attempt'), updated_at = ?1
             WHERE stage = ?2 AND status = 'running' AND updated_at < ?3 AND attempts >= ?4",
        )
        .bind(now_ms)
        .bind(stage.as_str())
        .bind(cutoff)
        .bind(i64::from(max_attempts))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        let requeued = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'pending', next_run_at = NULL, updated_at = ?1
             WHERE stage = ?2 AND status = 'running' AND updated_at < ?3",
        )
        .bind(now_ms)
        .bind(stage.as_str())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        Ok(StaleRecovery {
            requeued,
            exhausted,
        })
    }

    async fn scan_due(
        &self,
        stage: Stage,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRow>> {
        let newest_limit = limit.div_ceil(2);
        let oldest_limit = limit - newest_limit;

        let newest = self
            .due_rows(stage, "DESC", newest_limit, max_attempts, now)
            .await?;
        let oldest = self
            .due_rows(stage, "ASC", oldest_limit, max_attempts, now)
            .await?;

        let merged: BTreeMap<i64, TaskRow> = newest
            .into_iter()
            .chain(oldest)
            .map(|task| (task.id, task))
            .collect();
        Ok(merged.into_values().collect())
    }

    async fn earliest_next_run(
        &self,
        stage: Stage,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>> {
        let (earliest,): (Option<i64>,) = sqlx::query_as(
            "SELECT MIN(COALESCE(next_run_at, ?1)) FROM pipeline_tasks
             WHERE stage = ?2 AND status IN ('pending', 'failed') AND attempts < ?3",
        )
        .bind(to_millis(now))
        .bind(stage.as_str())
        .bind(i64::from(max_attempts))
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        earliest.map(from_millis).transpose()
    }

    async fn get(&self, task_id: i64) -> Result<Option<TaskRow>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM pipeline_tasks WHERE id = ?1");
        let row = sqlx::query(&query)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        row.as_ref().map(Self::parse_task_row).transpose()
    }

    async fn queue_stats(&self, stage: Stage) -> Result<QueueStats> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM pipeline_tasks WHERE stage = ?1 GROUP BY status",
        )
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match TaskStatus::from_str(&status)? {
                TaskStatus::Pending => stats.pending = count,
                TaskStatus::Running => stats.running = count,
                TaskStatus::Succeeded => stats.succeeded = count,
                TaskStatus::Failed => stats.failed = count,
                TaskStatus::FailedPermanent => stats.failed_permanent = count,
            }
        }
        Ok(stats)
    }

    async fn list_failed_permanent(&self, stage: Stage, limit: usize) -> Result<Vec<TaskRow>> {
        let query = format!(
            "SELECT {TASK_COLUMNS} FROM pipeline_tasks
             WHERE stage = ?1 AND status = 'failed_permanent'
             ORDER BY updated_at DESC, id DESC
             LIMIT ?2"
        );
        let rows = sqlx::query(&query)
            .bind(stage.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(Self::parse_rows(rows))
    }

    async fn requeue_permanent(&self, task_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_tasks
             SET status = 'pending', attempts = 0, next_run_at = NULL, updated_at = ?1
             WHERE id = ?2 AND status = 'failed_permanent'",
        )
        .bind(to_millis(now))
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn cleanup_succeeded(&self, stage: Stage, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM pipeline_tasks
             WHERE stage = ?1 AND status = 'succeeded' AND updated_at < ?2",
        )
        .bind(stage.as_str())
        .bind(to_millis(older_than))
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}
