//! Generic stage cycle over the task store.
//!
//! One [`TaskStage`] drives one pipeline step. Each cycle:
//!
//! 1. returns stale `running` rows to the queue,
//! 2. scans due rows (newest half plus oldest half),
//! 3. splits them into realtime and recovery lanes,
//! 4. dispatches them with `min(stage concurrency, governor limit)` workers,
//! 5. per row: claim and validate, call the processor under the governor,
//!    then complete and chain the successor, or fail with backoff,
//! 6. lets the processor finish the cycle; rows whose completion waits on
//!    that step are completed or failed with it.
//!
//! Store errors in steps 1, 2 and 6 are logged and counted in
//! [`CycleReport::errors`]; a cycle always returns its report.
//!
//! What a step actually does lives behind [`StageProcessor`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use glimpse_core::{
    Capability, EventBus, FailureDisposition, PipelineEvent, Result, RetryPolicy, SchedulerLane,
    Stage, StageSettings, TaskPayload, TaskRow, TaskStore,
};
use glimpse_governor::{FailureOptions, RuntimeGovernor};

use crate::lanes::{process_in_lanes, LaneDispatch, Lanes};
use crate::scheduler::SchedulerHooks;

/// Result of processing one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    /// Payload for the successor stage's row. `None` ends the chain here.
    pub downstream: Option<TaskPayload>,
}

impl StageOutput {
    /// Finished; nothing to hand on.
    pub fn done() -> Self {
        Self { downstream: None }
    }

    /// Finished; enqueue the successor with `payload`.
    pub fn chain(payload: TaskPayload) -> Self {
        Self {
            downstream: Some(payload),
        }
    }
}

/// The work one stage performs on a claimed task.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Capability whose governor budget the work runs under. `None` runs
    /// the work directly.
    fn capability(&self) -> Option<Capability> {
        self.stage().capability()
    }

    /// Reject a claimed row whose input can never succeed. Runs before any
    /// governor permit; an error sends the row straight to
    /// `failed_permanent` without counting against the capability.
    fn validate(&self, _task: &TaskRow) -> Result<()> {
        Ok(())
    }

    async fn process(&self, task: &TaskRow) -> Result<StageOutput>;

    /// When true, rows that processed successfully stay `running` until
    /// [`finish_cycle`](Self::finish_cycle) returns, and fail with it.
    fn defers_completion(&self) -> bool {
        false
    }

    /// Called once per cycle after all items finished, with the number of
    /// rows that processed successfully.
    async fn finish_cycle(&self, _succeeded: usize) -> Result<()> {
        Ok(())
    }
}

/// Shared collaborators every stage needs.
#[derive(Clone)]
pub struct StageContext {
    pub store: Arc<dyn TaskStore>,
    pub governor: Arc<RuntimeGovernor>,
    pub events: Arc<EventBus>,
    pub retry: RetryPolicy,
}

/// Counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Stale rows returned to `pending`.
    pub recovered: u64,
    /// Stale rows that had no attempts left.
    pub exhausted: u64,
    pub scanned: usize,
    pub realtime: usize,
    pub recovery: usize,
    /// Rows another worker claimed first.
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Store or finish-step errors, per row or per cycle step.
    pub errors: usize,
}

/// A processed row waiting on the end of the cycle.
struct Deferred {
    task: TaskRow,
    output: StageOutput,
    duration_ms: u64,
}

#[derive(Default)]
struct CycleCounters {
    skipped: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    deferred: Mutex<Vec<Deferred>>,
}

/// Scheduler hooks for one stage.
pub struct TaskStage {
    processor: Arc<dyn StageProcessor>,
    settings: StageSettings,
    ctx: StageContext,
    name: String,
}

impl TaskStage {
    pub fn new(
        processor: Arc<dyn StageProcessor>,
        settings: StageSettings,
        ctx: StageContext,
    ) -> Self {
        let name = format!("stage:{}", processor.stage());
        Self {
            processor,
            settings,
            ctx,
            name,
        }
    }

    pub fn stage(&self) -> Stage {
        self.processor.stage()
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Realtime: first attempt and touched within the realtime window.
    pub fn lane_for(&self, task: &TaskRow, now: DateTime<Utc>) -> SchedulerLane {
        let age = (now - task.updated_at).to_std().unwrap_or(Duration::ZERO);
        if task.attempts == 0 && age <= self.settings.realtime_window {
            SchedulerLane::Realtime
        } else {
            SchedulerLane::Recovery
        }
    }

    fn split_lanes(&self, tasks: Vec<TaskRow>, now: DateTime<Utc>) -> Lanes<TaskRow> {
        let mut lanes = Lanes::new();
        for task in tasks {
            let lane = self.lane_for(&task, now);
            lanes.push(lane, task);
        }
        lanes
    }

    fn concurrency(&self) -> usize {
        let governed = match self.processor.capability() {
            Some(capability) => self
                .settings
                .concurrency
                .min(self.ctx.governor.get_limit(capability)),
            None => self.settings.concurrency,
        };
        governed.max(1)
    }

    /// Run one full cycle and report what happened.
    pub async fn run_once(&self) -> CycleReport {
        let stage = self.stage();
        let started = Instant::now();
        let now = Utc::now();
        let mut report = CycleReport::default();

        match self
            .ctx
            .store
            .recover_stale(
                stage,
                self.settings.stale_after,
                self.ctx.retry.max_attempts,
                now,
            )
            .await
        {
            Ok(recovery) => {
                report.recovered = recovery.requeued;
                report.exhausted = recovery.exhausted;
            }
            Err(e) => {
                report.errors += 1;
                warn!(
                    subsystem = "jobs",
                    component = "stage",
                    op = "recover_stale",
                    stage = %stage,
                    error = %e,
                    "Stale recovery failed"
                );
            }
        }
        if report.recovered > 0 {
            info!(
                subsystem = "jobs",
                component = "stage",
                op = "recover_stale",
                stage = %stage,
                row_count = report.recovered,
                "Recovered stale running tasks"
            );
            self.ctx.events.emit(PipelineEvent::StaleRecovered {
                stage,
                count: report.recovered,
            });
        }
        if report.exhausted > 0 {
            warn!(
                subsystem = "jobs",
                component = "stage",
                op = "recover_stale",
                stage = %stage,
                row_count = report.exhausted,
                max_attempts = self.ctx.retry.max_attempts,
                "Stale tasks out of attempts; failed permanently"
            );
        }

        let due = match self
            .ctx
            .store
            .scan_due(
                stage,
                self.settings.scan_limit,
                self.ctx.retry.max_attempts,
                now,
            )
            .await
        {
            Ok(due) => due,
            Err(e) => {
                report.errors += 1;
                warn!(
                    subsystem = "jobs",
                    component = "stage",
                    op = "scan_due",
                    stage = %stage,
                    error = %e,
                    "Due scan failed; cycle skipped"
                );
                return report;
            }
        };
        report.scanned = due.len();
        if due.is_empty() {
            trace!(subsystem = "jobs", stage = %stage, "No due tasks");
            return report;
        }

        let lanes = self.split_lanes(due, now);
        let dispatch = LaneDispatch::new(self.concurrency()).with_weights(self.settings.lane_weights);
        let counters = CycleCounters::default();
        let lane_report = process_in_lanes(
            lanes,
            &dispatch,
            |task, lane| self.run_task(task, lane, &counters),
            None,
        )
        .await;
        report.realtime = lane_report.realtime;
        report.recovery = lane_report.recovery;
        report.errors += lane_report.failed;

        report.errors += self.finish_cycle(&counters).await;

        report.skipped = counters.skipped.load(Ordering::SeqCst);
        report.succeeded = counters.succeeded.load(Ordering::SeqCst);
        report.failed = counters.failed.load(Ordering::SeqCst);

        info!(
            subsystem = "jobs",
            component = "stage",
            op = "cycle",
            stage = %stage,
            scanned = report.scanned,
            realtime = report.realtime,
            recovery = report.recovery,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            errors = report.errors,
            workers = lane_report.workers,
            duration_ms = started.elapsed().as_millis() as u64,
            "Stage cycle complete"
        );
        report
    }

    /// Run the processor's end-of-cycle step and settle deferred rows on
    /// its outcome. Returns the number of errors.
    async fn finish_cycle(&self, counters: &CycleCounters) -> usize {
        let stage = self.stage();
        let deferred = std::mem::take(
            &mut *counters
                .deferred
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        let processed = counters.succeeded.load(Ordering::SeqCst) + deferred.len();

        let mut errors = 0;
        match self.processor.finish_cycle(processed).await {
            Ok(()) => {
                for row in deferred {
                    if let Err(e) = self
                        .settle_success(&row.task, row.output, row.duration_ms, counters)
                        .await
                    {
                        errors += 1;
                        warn!(
                            subsystem = "jobs",
                            component = "stage",
                            op = "complete",
                            stage = %stage,
                            task_id = row.task.id,
                            error = %e,
                            "Could not complete deferred task"
                        );
                    }
                }
            }
            Err(e) => {
                errors += 1;
                warn!(
                    subsystem = "jobs",
                    component = "stage",
                    op = "finish_cycle",
                    stage = %stage,
                    row_count = deferred.len(),
                    error = %e,
                    "Cycle finish step failed"
                );
                let error = e.to_string();
                for row in deferred {
                    let attempt = row.task.attempts + 1;
                    if let Err(e) = self
                        .settle_failure(row.task.id, attempt, error.clone(), counters)
                        .await
                    {
                        errors += 1;
                        warn!(
                            subsystem = "jobs",
                            component = "stage",
                            op = "fail",
                            stage = %stage,
                            task_id = row.task.id,
                            error = %e,
                            "Could not fail deferred task"
                        );
                    }
                }
            }
        }
        errors
    }

    async fn run_task(
        &self,
        task: TaskRow,
        lane: SchedulerLane,
        counters: &CycleCounters,
    ) -> Result<()> {
        let stage = self.stage();
        let task_id = task.id;

        if !self
            .ctx
            .store
            .claim(task_id, self.ctx.retry.max_attempts, Utc::now())
            .await?
        {
            trace!(subsystem = "jobs", stage = %stage, task_id, "Task claimed elsewhere");
            counters.skipped.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let attempt = task.attempts + 1;
        self.ctx.events.emit(PipelineEvent::TaskStarted {
            stage,
            task_id,
            attempt,
        });

        if let Err(e) = self.processor.validate(&task) {
            return self.reject(task_id, attempt, e.to_string(), counters).await;
        }

        debug!(
            subsystem = "jobs",
            stage = %stage,
            task_id,
            subject_id = task.subject_id,
            lane = %lane,
            attempts = attempt,
            "Processing task"
        );

        let started = Instant::now();
        let result = match self.processor.capability() {
            Some(capability) => {
                let options = FailureOptions {
                    trip_breaker: self.settings.trip_breaker,
                };
                self.ctx
                    .governor
                    .call(capability, options, self.processor.process(&task))
                    .await
            }
            None => self.processor.process(&task).await,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) if self.processor.defers_completion() => {
                trace!(subsystem = "jobs", stage = %stage, task_id, "Completion deferred to cycle end");
                counters
                    .deferred
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(Deferred {
                        task,
                        output,
                        duration_ms,
                    });
                Ok(())
            }
            Ok(output) => self.settle_success(&task, output, duration_ms, counters).await,
            Err(e) => self.settle_failure(task_id, attempt, e.to_string(), counters).await,
        }
    }

    /// Park a claimed row whose input failed validation.
    async fn reject(
        &self,
        task_id: i64,
        attempt: u32,
        error: String,
        counters: &CycleCounters,
    ) -> Result<()> {
        let stage = self.stage();
        if !self.ctx.store.reject(task_id, &error, Utc::now()).await? {
            debug!(
                subsystem = "jobs",
                stage = %stage,
                task_id,
                "Task no longer running; rejection not recorded"
            );
            return Ok(());
        }
        warn!(
            subsystem = "jobs",
            stage = %stage,
            task_id,
            attempts = attempt,
            error = %error,
            "Task input invalid; failed permanently"
        );
        counters.failed.fetch_add(1, Ordering::SeqCst);
        self.ctx.events.emit(PipelineEvent::TaskFailed {
            stage,
            task_id,
            attempts: attempt,
            permanent: true,
            error,
        });
        Ok(())
    }

    async fn settle_success(
        &self,
        task: &TaskRow,
        output: StageOutput,
        duration_ms: u64,
        counters: &CycleCounters,
    ) -> Result<()> {
        let stage = self.stage();
        self.ctx.store.complete(task.id, Utc::now()).await?;
        counters.succeeded.fetch_add(1, Ordering::SeqCst);
        debug!(
            subsystem = "jobs",
            stage = %stage,
            task_id = task.id,
            duration_ms,
            "Task succeeded"
        );
        self.ctx.events.emit(PipelineEvent::TaskSucceeded {
            stage,
            task_id: task.id,
            duration_ms,
        });
        self.chain(task, output).await
    }

    async fn settle_failure(
        &self,
        task_id: i64,
        attempt: u32,
        error: String,
        counters: &CycleCounters,
    ) -> Result<()> {
        let stage = self.stage();
        let disposition = self
            .ctx
            .store
            .fail(task_id, &error, &self.ctx.retry, Utc::now())
            .await?;
        let permanent = match disposition {
            FailureDisposition::Retry { next_run_at } => {
                warn!(
                    subsystem = "jobs",
                    stage = %stage,
                    task_id,
                    attempts = attempt,
                    error = %error,
                    next_run_at = %next_run_at,
                    "Task failed; retry scheduled"
                );
                false
            }
            FailureDisposition::Permanent => {
                warn!(
                    subsystem = "jobs",
                    stage = %stage,
                    task_id,
                    attempts = attempt,
                    error = %error,
                    "Task failed permanently"
                );
                true
            }
            FailureDisposition::Skipped => {
                debug!(
                    subsystem = "jobs",
                    stage = %stage,
                    task_id,
                    "Task no longer running; failure not recorded"
                );
                return Ok(());
            }
        };
        counters.failed.fetch_add(1, Ordering::SeqCst);
        self.ctx.events.emit(PipelineEvent::TaskFailed {
            stage,
            task_id,
            attempts: attempt,
            permanent,
            error,
        });
        Ok(())
    }

    async fn chain(&self, task: &TaskRow, output: StageOutput) -> Result<()> {
        let stage = self.stage();
        let (Some(next), Some(payload)) = (stage.successor(), output.downstream) else {
            return Ok(());
        };
        match self
            .ctx
            .store
            .enqueue(next, task.subject_id, &payload, Utc::now())
            .await?
        {
            Some(next_id) => {
                debug!(
                    subsystem = "jobs",
                    stage = %stage,
                    task_id = task.id,
                    next_stage = %next,
                    next_task_id = next_id,
                    "Chained successor task"
                );
                self.ctx.events.emit(PipelineEvent::StageWake {
                    stage: next,
                    reason: format!("{stage} completed task {}", task.id),
                });
            }
            None => debug!(
                subsystem = "jobs",
                stage = %stage,
                next_stage = %next,
                subject_id = task.subject_id,
                "Successor already running; not re-enqueued"
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl SchedulerHooks for TaskStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_interval(&self) -> Duration {
        self.settings.scan_interval
    }

    fn min_delay(&self) -> Duration {
        self.settings.min_delay
    }

    async fn compute_earliest_next_run(&self) -> Result<Option<DateTime<Utc>>> {
        self.ctx
            .store
            .earliest_next_run(self.stage(), self.ctx.retry.max_attempts, Utc::now())
            .await
    }

    async fn run_cycle(&self) -> Result<()> {
        self.run_once().await;
        Ok(())
    }
}
