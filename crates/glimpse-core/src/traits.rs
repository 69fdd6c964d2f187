//! Trait seams between the pipeline and its collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::Result;
use crate::events::BreakerTripped;
use crate::models::{
    CaptureStatus, FailureDisposition, QueueStats, Stage, StaleRecovery, TaskRow,
};
use crate::payload::TaskPayload;
use crate::retry::RetryPolicy;

// =============================================================================
// TASK STORE
// =============================================================================

/// Durable per-stage task table.
///
/// Every transition is a single conditional statement so that concurrent
/// workers (and concurrent processes) never double-process a row.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Create the row for `(stage, subject_id)` or reset an existing
    /// non-running row to `pending`. Returns `None` when the row is
    /// currently `running`.
    async fn enqueue(
        &self,
        stage: Stage,
        subject_id: i64,
        payload: &TaskPayload,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// Atomically move a due `pending`/`failed` row to `running`.
    /// `false` means another worker won the race.
    async fn claim(&self, task_id: i64, max_attempts: u32, now: DateTime<Utc>) -> Result<bool>;

    /// Mark a `running` row as `succeeded`.
    async fn complete(&self, task_id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Record a failed attempt and schedule the retry, or mark the row
    /// permanently failed once the attempt budget is spent.
    async fn fail(
        &self,
        task_id: i64,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureDisposition>;

    /// Move a `running` row straight to `failed_permanent`, regardless of
    /// its remaining attempts. Used for rows whose input can never succeed.
    /// `false` when the row was no longer running.
    async fn reject(&self, task_id: i64, error: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Return `running` rows untouched for `stale_after` to the queue.
    /// Rows that already used every attempt go to `failed_permanent`.
    async fn recover_stale(
        &self,
        stage: Stage,
        stale_after: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<StaleRecovery>;

    /// Due rows for a cycle: half newest-first, half oldest-first, merged by id.
    ///
    /// Rows that cannot be decoded are moved to `failed_permanent` and left
    /// out of the result.
    async fn scan_due(
        &self,
        stage: Stage,
        limit: usize,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskRow>>;

    /// Earliest time any retryable row becomes due.
    async fn earliest_next_run(
        &self,
        stage: Stage,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Get a row by id.
    async fn get(&self, task_id: i64) -> Result<Option<TaskRow>>;

    /// Row counts per status for a stage.
    async fn queue_stats(&self, stage: Stage) -> Result<QueueStats>;

    /// Permanently failed rows, most recent first.
    async fn list_failed_permanent(&self, stage: Stage, limit: usize) -> Result<Vec<TaskRow>>;

    /// Give a permanently failed row a fresh attempt budget.
    async fn requeue_permanent(&self, task_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Delete `succeeded` rows last updated before `older_than`.
    async fn cleanup_succeeded(&self, stage: Stage, older_than: DateTime<Utc>) -> Result<u64>;
}

// =============================================================================
// CAPTURE CONTROL
// =============================================================================

/// Callbacks into the screenshot capture subsystem.
#[async_trait]
pub trait CaptureControl: Send + Sync {
    /// Stop capturing.
    async fn stop(&self) -> Result<()>;

    /// Start capturing.
    async fn start(&self) -> Result<()>;

    /// Current capture status.
    fn status(&self) -> CaptureStatus;
}

// =============================================================================
// PROVIDER VALIDATION
// =============================================================================

/// Outcome of validating a saved provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid,
    Invalid { reason: String },
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

/// Checks that saved provider settings are usable (e.g. a test call).
#[async_trait]
pub trait ConfigValidator: Send + Sync {
    async fn validate(&self, config: &ProviderConfig) -> Result<ValidationOutcome>;
}

/// Validator that accepts everything.
pub struct AcceptAllValidator;

#[async_trait]
impl ConfigValidator for AcceptAllValidator {
    async fn validate(&self, _config: &ProviderConfig) -> Result<ValidationOutcome> {
        Ok(ValidationOutcome::Valid)
    }
}

// =============================================================================
// UI NOTIFICATION
// =============================================================================

/// A UI surface that wants to hear about breaker trips.
pub trait BreakerObserver: Send + Sync {
    fn breaker_tripped(&self, notice: &BreakerTripped);
}
