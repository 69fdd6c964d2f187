//! Self-pacing timer loop shared by every stage.
//!
//! A [`TaskScheduler`] owns one cancellable timer. When it fires, the
//! scheduler runs one cycle of its [`SchedulerHooks`] and then re-arms itself
//! for the next known due time, clamped to `[min_delay, default_interval]`.
//!
//! ```text
//! start() ──> schedule_soon ──> timer ──> run_cycle ──> compute next delay ──> timer ...
//!                                  ^            |
//!        wake() ───────────────────┘            └── wake() while running: one trailing cycle
//! ```
//!
//! At most one cycle runs at a time. Wakes that arrive during a cycle are
//! coalesced into a single follow-up cycle; wakes that arrive while a sooner
//! timer is already armed are absorbed by it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use glimpse_core::defaults::STAGE_SOON_DELAY_MS;
use glimpse_core::Result;

/// The four hooks a concrete scheduler supplies.
#[async_trait]
pub trait SchedulerHooks: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Delay used when nothing is known to be due sooner.
    fn default_interval(&self) -> Duration;

    /// Shortest delay between the end of one cycle and the next.
    fn min_delay(&self) -> Duration;

    /// Earliest time any work becomes due, if any is pending.
    async fn compute_earliest_next_run(&self) -> Result<Option<DateTime<Utc>>>;

    /// Do one round of work.
    async fn run_cycle(&self) -> Result<()>;
}

/// Clamp the time until `earliest` into `[min_delay, default_interval]`.
///
/// No known due time, or a due time in the past, maps to the bounds.
pub fn next_delay(
    earliest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    min_delay: Duration,
    default_interval: Duration,
) -> Duration {
    let Some(earliest) = earliest else {
        return default_interval.max(min_delay);
    };
    let until = (earliest - now).to_std().unwrap_or(Duration::ZERO);
    until.min(default_interval).max(min_delay)
}

struct TimerState {
    started: bool,
    processing: bool,
    wake_requested: bool,
    /// Bumped whenever the armed timer changes; a firing timer with an older
    /// generation was superseded and does nothing.
    generation: u64,
    timer: Option<JoinHandle<()>>,
    timer_due: Option<Instant>,
    cycles: u64,
}

struct Inner<H> {
    hooks: Arc<H>,
    soon_delay: Duration,
    state: Mutex<TimerState>,
}

/// Timer-driven cycle runner around a set of [`SchedulerHooks`].
pub struct TaskScheduler<H: SchedulerHooks> {
    inner: Arc<Inner<H>>,
}

impl<H: SchedulerHooks> Clone for TaskScheduler<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: SchedulerHooks> TaskScheduler<H> {
    pub fn new(hooks: Arc<H>) -> Self {
        Self::with_soon_delay(hooks, Duration::from_millis(STAGE_SOON_DELAY_MS))
    }

    /// Build with a custom debounce delay for [`schedule_soon`](Self::schedule_soon).
    pub fn with_soon_delay(hooks: Arc<H>, soon_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                hooks,
                soon_delay,
                state: Mutex::new(TimerState {
                    started: false,
                    processing: false,
                    wake_requested: false,
                    generation: 0,
                    timer: None,
                    timer_due: None,
                    cycles: 0,
                }),
            }),
        }
    }

    pub fn hooks(&self) -> &Arc<H> {
        &self.inner.hooks
    }

    pub fn is_started(&self) -> bool {
        self.inner.lock().started
    }

    pub fn is_processing(&self) -> bool {
        self.inner.lock().processing
    }

    /// Completed cycles since construction.
    pub fn cycles(&self) -> u64 {
        self.inner.lock().cycles
    }

    /// Begin scheduling. The first cycle runs after the soon delay.
    pub fn start(&self) {
        let mut state = self.inner.lock();
        if state.started {
            return;
        }
        state.started = true;
        info!(
            subsystem = "scheduler",
            component = self.inner.hooks.name(),
            op = "start",
            "Scheduler started"
        );
        self.inner.schedule_soon_locked(&mut state);
    }

    /// Stop scheduling and cancel the pending timer. A cycle already in
    /// progress runs to completion but is not followed by another.
    pub fn stop(&self) {
        let mut state = self.inner.lock();
        if !state.started {
            return;
        }
        state.started = false;
        state.wake_requested = false;
        self.inner.cancel_timer_locked(&mut state);
        info!(
            subsystem = "scheduler",
            component = self.inner.hooks.name(),
            op = "stop",
            "Scheduler stopped"
        );
    }

    /// Request a cycle soon. Ignored while stopped; coalesced while a cycle
    /// is running.
    pub fn wake(&self, reason: &str) {
        let mut state = self.inner.lock();
        if !state.started {
            trace!(
                subsystem = "scheduler",
                component = self.inner.hooks.name(),
                reason,
                "Wake ignored; scheduler stopped"
            );
            return;
        }
        debug!(
            subsystem = "scheduler",
            component = self.inner.hooks.name(),
            reason,
            processing = state.processing,
            "Wake requested"
        );
        self.inner.schedule_soon_locked(&mut state);
    }

    /// Arm the timer for the soon delay unless a timer already fires sooner.
    pub fn schedule_soon(&self) {
        let mut state = self.inner.lock();
        if state.started {
            self.inner.schedule_soon_locked(&mut state);
        }
    }
}

impl<H: SchedulerHooks> Inner<H> {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn schedule_soon_locked(self: &Arc<Self>, state: &mut TimerState) {
        if state.processing {
            state.wake_requested = true;
            return;
        }
        let due = Instant::now() + self.soon_delay;
        if matches!(state.timer_due, Some(existing) if existing <= due) {
            return;
        }
        self.arm_locked(state, self.soon_delay);
    }

    fn cancel_timer_locked(&self, state: &mut TimerState) {
        state.generation = state.generation.wrapping_add(1);
        state.timer_due = None;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn arm_locked(self: &Arc<Self>, state: &mut TimerState, delay: Duration) {
        self.cancel_timer_locked(state);
        let generation = state.generation;
        let inner = Arc::clone(self);
        state.timer_due = Some(Instant::now() + delay);
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.fire(generation).await;
        }));
    }

    fn fire(self: Arc<Self>, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            {
                let mut state = self.lock();
                if state.generation != generation || !state.started {
                    return;
                }
                // Detach rather than abort: this task is the timer.
                state.timer = None;
                state.timer_due = None;
                state.processing = true;
                state.wake_requested = false;
            }

            self.run_guarded().await;

            let woken = {
                let mut state = self.lock();
                state.cycles += 1;
                std::mem::take(&mut state.wake_requested)
            };
            let delay = if woken {
                self.soon_delay
            } else {
                self.compute_delay().await
            };

            let mut state = self.lock();
            state.processing = false;
            if !state.started {
                return;
            }
            let delay = if std::mem::take(&mut state.wake_requested) {
                self.soon_delay
            } else {
                delay
            };
            let due = Instant::now() + delay;
            if matches!(state.timer_due, Some(existing) if existing <= due) {
                return;
            }
            trace!(
                subsystem = "scheduler",
                component = self.hooks.name(),
                delay_ms = delay.as_millis() as u64,
                "Next cycle scheduled"
            );
            self.arm_locked(&mut state, delay);
        })
    }

    async fn run_guarded(&self) {
        let name = self.hooks.name();
        let started = Instant::now();
        match AssertUnwindSafe(self.hooks.run_cycle()).catch_unwind().await {
            Ok(Ok(())) => trace!(
                subsystem = "scheduler",
                component = name,
                duration_ms = started.elapsed().as_millis() as u64,
                "Cycle finished"
            ),
            Ok(Err(e)) => error!(
                subsystem = "scheduler",
                component = name,
                error = %e,
                duration_ms = started.elapsed().as_millis() as u64,
                "Cycle failed"
            ),
            Err(_) => error!(
                subsystem = "scheduler",
                component = name,
                "Cycle panicked"
            ),
        }
    }

    async fn compute_delay(&self) -> Duration {
        let min_delay = self.hooks.min_delay();
        let default_interval = self.hooks.default_interval();
        match self.hooks.compute_earliest_next_run().await {
            Ok(earliest) => next_delay(earliest, Utc::now(), min_delay, default_interval),
            Err(e) => {
                warn!(
                    subsystem = "scheduler",
                    component = self.hooks.name(),
                    error = %e,
                    "Could not compute next run; using default interval"
                );
                default_interval.max(min_delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_core::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    struct CountingHooks {
        cycles: AtomicUsize,
        cycle_time: Duration,
        fail: bool,
        due_in: Option<chrono::Duration>,
    }

    impl CountingHooks {
        fn new() -> Self {
            Self {
                cycles: AtomicUsize::new(0),
                cycle_time: Duration::ZERO,
                fail: false,
                due_in: None,
            }
        }

        fn count(&self) -> usize {
            self.cycles.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SchedulerHooks for CountingHooks {
        fn name(&self) -> &str {
            "counting"
        }

        fn default_interval(&self) -> Duration {
            Duration::from_secs(60)
        }

        fn min_delay(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn compute_earliest_next_run(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(self.due_in.map(|d| Utc::now() + d))
        }

        async fn run_cycle(&self) -> Result<()> {
            self.cycles.fetch_add(1, Ordering::SeqCst);
            if !self.cycle_time.is_zero() {
                sleep(self.cycle_time).await;
            }
            if self.fail {
                return Err(Error::Internal("cycle blew up".into()));
            }
            Ok(())
        }
    }

    fn scheduler(hooks: CountingHooks) -> (TaskScheduler<CountingHooks>, Arc<CountingHooks>) {
        let hooks = Arc::new(hooks);
        (TaskScheduler::new(hooks.clone()), hooks)
    }

    #[test]
    fn test_next_delay_clamps() {
        let now = Utc::now();
        let min = Duration::from_secs(1);
        let max = Duration::from_secs(60);

        assert_eq!(next_delay(None, now, min, max), max);
        assert_eq!(
            next_delay(Some(now + chrono::Duration::milliseconds(10)), now, min, max),
            min
        );
        assert_eq!(
            next_delay(Some(now - chrono::Duration::seconds(5)), now, min, max),
            min
        );
        assert_eq!(
            next_delay(Some(now + chrono::Duration::seconds(30)), now, min, max),
            Duration::from_secs(30)
        );
        assert_eq!(
            next_delay(Some(now + chrono::Duration::hours(1)), now, min, max),
            max
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_soon_then_on_interval() {
        let (scheduler, hooks) = scheduler(CountingHooks::new());
        scheduler.start();
        assert!(scheduler.is_started());

        sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.count(), 1);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(hooks.count(), 1);

        sleep(Duration::from_secs(31)).await;
        assert_eq!(hooks.count(), 2);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_debounces_into_one_cycle() {
        let (scheduler, hooks) = scheduler(CountingHooks::new());
        scheduler.start();
        sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.count(), 1);

        for i in 0..5 {
            scheduler.wake(&format!("burst {i}"));
        }
        sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.count(), 2);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakes_during_cycle_coalesce() {
        let mut hooks = CountingHooks::new();
        hooks.cycle_time = Duration::from_secs(2);
        let (scheduler, hooks) = scheduler(hooks);
        scheduler.start();

        sleep(Duration::from_millis(500)).await;
        assert!(scheduler.is_processing());
        scheduler.wake("a");
        scheduler.wake("b");
        scheduler.wake("c");

        // First cycle ends at ~2.05s, trailing cycle starts right after.
        sleep(Duration::from_secs(2)).await;
        assert_eq!(hooks.count(), 2);

        // Trailing cycle ends; nothing else queued.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(hooks.count(), 2);
        assert_eq!(scheduler.cycles(), 2);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer_and_ignores_wakes() {
        let (scheduler, hooks) = scheduler(CountingHooks::new());
        scheduler.start();
        scheduler.stop();
        scheduler.wake("after stop");

        sleep(Duration::from_secs(120)).await;
        assert_eq!(hooks.count(), 0);
        assert!(!scheduler.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_cycle_lets_it_finish() {
        let mut hooks = CountingHooks::new();
        hooks.cycle_time = Duration::from_secs(2);
        let (scheduler, hooks) = scheduler(hooks);
        scheduler.start();

        sleep(Duration::from_millis(500)).await;
        assert!(scheduler.is_processing());
        scheduler.stop();
        assert!(!scheduler.is_started());

        sleep(Duration::from_secs(120)).await;
        assert_eq!(hooks.count(), 1);
        assert_eq!(scheduler.cycles(), 1);
        assert!(!scheduler.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_still_reschedules() {
        let mut hooks = CountingHooks::new();
        hooks.fail = true;
        let (scheduler, hooks) = scheduler(hooks);
        scheduler.start();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.count(), 1);
        sleep(Duration::from_secs(61)).await;
        assert_eq!(hooks.count(), 2);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_near_due_work_respects_min_delay() {
        let mut hooks = CountingHooks::new();
        hooks.due_in = Some(chrono::Duration::milliseconds(10));
        let (scheduler, hooks) = scheduler(hooks);
        scheduler.start();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(hooks.count(), 1);
        sleep(Duration::from_millis(500)).await;
        assert_eq!(hooks.count(), 1);
        sleep(Duration::from_millis(600)).await;
        assert_eq!(hooks.count(), 2);
        scheduler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_soon_delay() {
        let hooks = Arc::new(CountingHooks::new());
        let scheduler = TaskScheduler::with_soon_delay(hooks.clone(), Duration::from_millis(500));
        scheduler.start();

        sleep(Duration::from_millis(400)).await;
        assert_eq!(hooks.count(), 0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(hooks.count(), 1);
        scheduler.stop();
    }
}
