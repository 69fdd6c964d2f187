//! Adaptive concurrency control (AIMD).
//!
//! Each capability starts at its configured base limit. Failures halve the
//! limit (multiplicative decrease); sustained success adds it back in small
//! steps (additive increase), never above base. A cooldown separates any two
//! adjustments.
//!
//! ```text
//! degrade: consecutive_failures >= failure_threshold
//!          or (samples >= min(5, window) and failure_rate >= rate_threshold)
//!          -> current = max(min, current / 2)
//! recover: current < base and consecutive_successes >= success_threshold
//!          -> current = min(base, current + step)
//! ```
//!
//! The tuner only decides. The governor applies the new limit to the
//! capability's semaphore.

use std::collections::VecDeque;

use tokio::time::Instant;

use glimpse_core::defaults::TUNER_MIN_RATE_SAMPLES;
use glimpse_core::{Capability, PerCapability, TunerConfig};

/// Result of one external call, as seen by the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Direction of an applied adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustmentKind {
    Degrade,
    Recover,
}

/// A limit change the governor must push to the semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Adjustment {
    pub capability: Capability,
    pub kind: AdjustmentKind,
    pub previous: usize,
    pub current: usize,
}

/// Tuner bookkeeping for one capability.
#[derive(Debug, Clone)]
pub struct CapabilityTunerState {
    pub base: usize,
    pub current: usize,
    window: VecDeque<Outcome>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_adjusted_at: Option<Instant>,
}

impl CapabilityTunerState {
    fn new(base: usize) -> Self {
        Self {
            base,
            current: base,
            window: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_adjusted_at: None,
        }
    }

    /// Outcomes currently in the window.
    pub fn samples(&self) -> usize {
        self.window.len()
    }

    /// Failure ratio over the window (0 when empty).
    pub fn failure_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self
            .window
            .iter()
            .filter(|o| **o == Outcome::Failure)
            .count();
        failures as f64 / self.window.len() as f64
    }

    fn reset(&mut self, now: Instant) {
        self.window.clear();
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.last_adjusted_at = Some(now);
    }
}

/// AIMD controller over all capabilities.
#[derive(Debug, Clone)]
pub struct ConcurrencyTuner {
    config: TunerConfig,
    states: PerCapability<CapabilityTunerState>,
}

impl ConcurrencyTuner {
    pub fn new(config: TunerConfig, base: &PerCapability<usize>) -> Self {
        Self {
            states: PerCapability::from_fn(|cap| CapabilityTunerState::new(*base.get(cap))),
            config,
        }
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn state(&self, capability: Capability) -> &CapabilityTunerState {
        self.states.get(capability)
    }

    pub fn current(&self, capability: Capability) -> usize {
        self.states.get(capability).current
    }

    /// Feed one outcome. Returns the adjustment to apply, if any.
    pub fn record(
        &mut self,
        capability: Capability,
        outcome: Outcome,
        now: Instant,
    ) -> Option<Adjustment> {
        let config = &self.config;
        let state = self.states.get_mut(capability);

        state.window.push_back(outcome);
        while state.window.len() > config.window_size {
            state.window.pop_front();
        }
        match outcome {
            Outcome::Success => {
                state.consecutive_successes += 1;
                state.consecutive_failures = 0;
            }
            Outcome::Failure => {
                state.consecutive_failures += 1;
                state.consecutive_successes = 0;
            }
        }

        if let Some(last) = state.last_adjusted_at {
            if now.saturating_duration_since(last) < config.cooldown {
                return None;
            }
        }

        let min_samples = TUNER_MIN_RATE_SAMPLES.min(config.window_size);
        let degrade = state.consecutive_failures >= config.failure_threshold
            || (state.window.len() >= min_samples
                && state.failure_rate() >= config.failure_rate_threshold);

        if degrade {
            let previous = state.current;
            let next = config.min_concurrency.max(previous / 2);
            if next >= previous {
                return None;
            }
            state.current = next;
            state.reset(now);
            return Some(Adjustment {
                capability,
                kind: AdjustmentKind::Degrade,
                previous,
                current: next,
            });
        }

        if state.current < state.base
            && state.consecutive_successes >= config.recovery_success_threshold
        {
            let previous = state.current;
            let next = state.base.min(previous + config.recovery_step);
            state.current = next;
            state.reset(now);
            return Some(Adjustment {
                capability,
                kind: AdjustmentKind::Recover,
                previous,
                current: next,
            });
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tuner(config: TunerConfig, text_base: usize) -> ConcurrencyTuner {
        let base = PerCapability {
            vlm: 2,
            text: text_base,
            embedding: 4,
        };
        ConcurrencyTuner::new(config, &base)
    }

    fn quick_config() -> TunerConfig {
        TunerConfig::default()
            .with_failure_threshold(2)
            .with_recovery(1, 3)
            .with_cooldown(Duration::from_secs(10))
    }

    #[test]
    fn test_starts_at_base() {
        let tuner = tuner(quick_config(), 4);
        assert_eq!(tuner.current(Capability::Text), 4);
        assert_eq!(tuner.current(Capability::Vlm), 2);
        assert!(tuner.state(Capability::Text).last_adjusted_at.is_none());
    }

    #[test]
    fn test_consecutive_failures_halve_limit() {
        let mut tuner = tuner(quick_config(), 4);
        let now = Instant::now();

        assert!(tuner.record(Capability::Text, Outcome::Failure, now).is_none());
        let adjustment = tuner
            .record(Capability::Text, Outcome::Failure, now)
            .expect("second failure degrades");
        assert_eq!(adjustment.kind, AdjustmentKind::Degrade);
        assert_eq!(adjustment.previous, 4);
        assert_eq!(adjustment.current, 2);

        let state = tuner.state(Capability::Text);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.samples(), 0);
        assert_eq!(state.last_adjusted_at, Some(now));
    }

    #[test]
    fn test_capabilities_are_independent() {
        let mut tuner = tuner(quick_config(), 4);
        let now = Instant::now();
        tuner.record(Capability::Text, Outcome::Failure, now);
        tuner.record(Capability::Vlm, Outcome::Failure, now);
        assert_eq!(tuner.current(Capability::Text), 4);
        assert_eq!(tuner.current(Capability::Vlm), 2);
    }

    #[test]
    fn test_cooldown_blocks_second_adjustment() {
        let mut tuner = tuner(quick_config(), 8);
        let start = Instant::now();
        tuner.record(Capability::Text, Outcome::Failure, start);
        tuner.record(Capability::Text, Outcome::Failure, start);
        assert_eq!(tuner.current(Capability::Text), 4);

        let inside = start + Duration::from_secs(5);
        assert!(tuner.record(Capability::Text, Outcome::Failure, inside).is_none());
        assert!(tuner.record(Capability::Text, Outcome::Failure, inside).is_none());
        assert_eq!(tuner.current(Capability::Text), 4);

        // Counters kept accumulating during cooldown; next outcome past it adjusts.
        let after = start + Duration::from_secs(11);
        let adjustment = tuner.record(Capability::Text, Outcome::Failure, after).unwrap();
        assert_eq!(adjustment.current, 2);
    }

    #[test]
    fn test_degrade_floors_at_min_concurrency() {
        let mut tuner = tuner(quick_config().with_cooldown(Duration::ZERO), 3);
        let now = Instant::now();
        tuner.record(Capability::Text, Outcome::Failure, now);
        tuner.record(Capability::Text, Outcome::Failure, now);
        assert_eq!(tuner.current(Capability::Text), 1);

        // Already at the floor: no adjustment reported.
        assert!(tuner.record(Capability::Text, Outcome::Failure, now).is_none());
        assert!(tuner.record(Capability::Text, Outcome::Failure, now).is_none());
        assert_eq!(tuner.current(Capability::Text), 1);
    }

    #[test]
    fn test_failure_rate_triggers_degrade() {
        // Consecutive threshold out of reach; only the rate can fire.
        let config = quick_config()
            .with_failure_threshold(100)
            .with_window(10, 0.5);
        let mut tuner = tuner(config, 4);
        let now = Instant::now();

        let pattern = [
            Outcome::Failure,
            Outcome::Success,
            Outcome::Failure,
            Outcome::Success,
        ];
        for outcome in pattern {
            assert!(tuner.record(Capability::Text, outcome, now).is_none());
        }
        // Fifth sample: 3 failures / 5 = 0.6.
        let adjustment = tuner.record(Capability::Text, Outcome::Failure, now).unwrap();
        assert_eq!(adjustment.kind, AdjustmentKind::Degrade);
        assert_eq!(adjustment.current, 2);
    }

    #[test]
    fn test_window_is_bounded() {
        let config = quick_config()
            .with_failure_threshold(100)
            .with_window(3, 0.9);
        let mut tuner = tuner(config, 4);
        let now = Instant::now();
        for _ in 0..10 {
            tuner.record(Capability::Text, Outcome::Success, now);
        }
        assert_eq!(tuner.state(Capability::Text).samples(), 3);
    }

    #[test]
    fn test_recovery_steps_back_to_base() {
        let mut tuner = tuner(quick_config(), 4);
        let mut now = Instant::now();
        tuner.record(Capability::Text, Outcome::Failure, now);
        tuner.record(Capability::Text, Outcome::Failure, now);
        assert_eq!(tuner.current(Capability::Text), 2);

        for expected in [3, 4] {
            now += Duration::from_secs(11);
            let mut adjustment = None;
            for _ in 0..3 {
                adjustment = tuner.record(Capability::Text, Outcome::Success, now);
            }
            let adjustment = adjustment.expect("third success recovers");
            assert_eq!(adjustment.kind, AdjustmentKind::Recover);
            assert_eq!(adjustment.current, expected);
        }

        // At base: successes never push above it.
        now += Duration::from_secs(11);
        for _ in 0..10 {
            assert!(tuner.record(Capability::Text, Outcome::Success, now).is_none());
        }
        assert_eq!(tuner.current(Capability::Text), 4);
    }

    #[test]
    fn test_recovery_step_caps_at_base() {
        let config = quick_config()
            .with_recovery(10, 1)
            .with_cooldown(Duration::ZERO);
        let mut tuner = tuner(config, 8);
        let now = Instant::now();
        tuner.record(Capability::Text, Outcome::Failure, now);
        tuner.record(Capability::Text, Outcome::Failure, now);
        assert_eq!(tuner.current(Capability::Text), 4);

        let adjustment = tuner.record(Capability::Text, Outcome::Success, now).unwrap();
        assert_eq!(adjustment.current, 8);
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let mut tuner = tuner(quick_config(), 4);
        let now = Instant::now();
        tuner.record(Capability::Text, Outcome::Failure, now);
        tuner.record(Capability::Text, Outcome::Success, now);
        assert!(tuner.record(Capability::Text, Outcome::Failure, now).is_none());
        assert_eq!(tuner.current(Capability::Text), 4);
    }
}
