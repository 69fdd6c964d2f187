//! Retry policy for failed stage tasks.
//!
//! # Backoff Schedule (defaults)
//!
//! | Attempts so far | Delay (base) | With jitter     |
//! |-----------------|--------------|-----------------|
//! | 1               | 10 s         | 10–15 s         |
//! | 2               | 30 s         | 30–35 s         |
//! | 3               | 2 min        | 2 min – 2 min 5 s |
//! | 4               | 5 min        | 5 min – 5 min 5 s |
//! | 5+              | 10 min       | 10 min – 10 min 5 s |
//!
//! With the default of 5 attempts the fifth failure is terminal, so the last
//! entry only applies when `max_attempts` is raised.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::defaults;
use crate::error::{Error, Result};

/// Attempt budget and backoff schedule for a stage's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before a row becomes `failed_permanent`.
    pub max_attempts: u32,
    /// Delays indexed by `attempts - 1`; the last entry repeats.
    pub backoff_schedule: Vec<Duration>,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::TASK_MAX_ATTEMPTS,
            backoff_schedule: defaults::TASK_BACKOFF_SCHEDULE_MS
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            jitter: Duration::from_millis(defaults::TASK_BACKOFF_JITTER_MS),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.backoff_schedule = schedule;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether a row that has used `attempts` attempts is out of budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Base delay (no jitter) after the given number of attempts.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        if self.backoff_schedule.is_empty() {
            return Duration::ZERO;
        }
        let index = (attempts.max(1) as usize - 1).min(self.backoff_schedule.len() - 1);
        self.backoff_schedule[index]
    }

    /// Base delay plus random jitter in `[0, jitter]`.
    pub fn delay_with<R: Rng + ?Sized>(&self, attempts: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            rng.gen_range(0..=jitter_ms)
        };
        self.base_delay(attempts) + Duration::from_millis(extra)
    }

    /// When a row that just failed its `attempts`-th attempt becomes due again.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.delay_with(attempts, &mut rand::thread_rng());
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
