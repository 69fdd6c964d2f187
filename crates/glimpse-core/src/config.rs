//! Runtime configuration for the governor, retry policy, and stage schedulers.
//!
//! Every value has a default from [`crate::defaults`]; `from_env` layers
//! environment overrides on top and builder methods adjust individual fields.
//! Unparseable environment values fall back to the default.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};
use crate::models::{Capability, Stage};
use crate::retry::RetryPolicy;

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| v != "false" && v != "0")
}

// =============================================================================
// PER-CAPABILITY VALUES
// =============================================================================

/// One value per [`Capability`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCapability<T> {
    pub vlm: T,
    pub text: T,
    pub embedding: T,
}

impl<T> PerCapability<T> {
    pub fn get(&self, capability: Capability) -> &T {
        match capability {
            Capability::Vlm => &self.vlm,
            Capability::Text => &self.text,
            Capability::Embedding => &self.embedding,
        }
    }

    pub fn get_mut(&mut self, capability: Capability) -> &mut T {
        match capability {
            Capability::Vlm => &mut self.vlm,
            Capability::Text => &mut self.text,
            Capability::Embedding => &mut self.embedding,
        }
    }

    /// Build from a function of the capability.
    pub fn from_fn(mut f: impl FnMut(Capability) -> T) -> Self {
        Self {
            vlm: f(Capability::Vlm),
            text: f(Capability::Text),
            embedding: f(Capability::Embedding),
        }
    }
}

// =============================================================================
// GOVERNOR
// =============================================================================

/// Adaptive (AIMD) concurrency settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerConfig {
    pub enabled: bool,
    /// Outcomes kept in the sliding window.
    pub window_size: usize,
    /// Failure ratio in the window that triggers a degrade.
    pub failure_rate_threshold: f64,
    /// Consecutive failures that trigger a degrade.
    pub failure_threshold: u32,
    /// Minimum time between two adjustments.
    pub cooldown: Duration,
    /// Permits restored per recovery.
    pub recovery_step: usize,
    /// Consecutive successes required before a recovery.
    pub recovery_success_threshold: u32,
    /// Floor for the degraded limit.
    pub min_concurrency: usize,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::TUNER_ENABLED,
            window_size: defaults::TUNER_WINDOW_SIZE,
            failure_rate_threshold: defaults::TUNER_FAILURE_RATE_THRESHOLD,
            failure_threshold: defaults::TUNER_FAILURE_THRESHOLD,
            cooldown: Duration::from_millis(defaults::TUNER_COOLDOWN_MS),
            recovery_step: defaults::TUNER_RECOVERY_STEP,
            recovery_success_threshold: defaults::TUNER_RECOVERY_SUCCESS_THRESHOLD,
            min_concurrency: defaults::TUNER_MIN_CONCURRENCY,
        }
    }
}

impl TunerConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_recovery(mut self, step: usize, success_threshold: u32) -> Self {
        self.recovery_step = step;
        self.recovery_success_threshold = success_threshold;
        self
    }

    pub fn with_window(mut self, window_size: usize, failure_rate_threshold: f64) -> Self {
        self.window_size = window_size;
        self.failure_rate_threshold = failure_rate_threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(Error::Config("tuner window_size must be positive".into()));
        }
        if self.min_concurrency == 0 {
            return Err(Error::Config("tuner min_concurrency must be positive".into()));
        }
        if self.recovery_step == 0 {
            return Err(Error::Config("tuner recovery_step must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_threshold) {
            return Err(Error::Config(
                "tuner failure_rate_threshold must be within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Trailing window in which failures are counted.
    pub window: Duration,
    /// Failures within the window that trip the breaker.
    pub threshold: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(defaults::BREAKER_WINDOW_MS),
            threshold: defaults::BREAKER_THRESHOLD,
        }
    }
}

/// Per-capability budgets plus the tuner and breaker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorConfig {
    /// Base (and maximum) concurrent calls per capability.
    pub concurrency: PerCapability<usize>,
    /// Timeout applied to each external call.
    pub call_timeouts: PerCapability<Duration>,
    pub tuner: TunerConfig,
    pub breaker: BreakerConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            concurrency: PerCapability {
                vlm: defaults::VLM_CONCURRENCY,
                text: defaults::TEXT_CONCURRENCY,
                embedding: defaults::EMBEDDING_CONCURRENCY,
            },
            call_timeouts: PerCapability {
                vlm: Duration::from_secs(defaults::VLM_TIMEOUT_SECS),
                text: Duration::from_secs(defaults::TEXT_TIMEOUT_SECS),
                embedding: Duration::from_secs(defaults::EMBEDDING_TIMEOUT_SECS),
            },
            tuner: TunerConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `GOVERNOR_VLM_CONCURRENCY` | `2` | Base vision-model concurrency |
    /// | `GOVERNOR_TEXT_CONCURRENCY` | `4` | Base text-model concurrency |
    /// | `GOVERNOR_EMBEDDING_CONCURRENCY` | `4` | Base embedding concurrency |
    /// | `GOVERNOR_VLM_TIMEOUT_SECS` | `120` | Vision call timeout |
    /// | `GOVERNOR_TEXT_TIMEOUT_SECS` | `60` | Text call timeout |
    /// | `GOVERNOR_EMBEDDING_TIMEOUT_SECS` | `30` | Embedding call timeout |
    /// | `GOVERNOR_ADAPTIVE_ENABLED` | `true` | Enable AIMD tuning |
    /// | `GOVERNOR_TUNER_COOLDOWN_MS` | `30000` | Minimum time between adjustments |
    /// | `GOVERNOR_BREAKER_WINDOW_MS` | `10000` | Breaker failure window |
    /// | `GOVERNOR_BREAKER_THRESHOLD` | `3` | Failures that trip the breaker |
    pub fn from_env() -> Self {
        let mut config = Self::default();

        for capability in Capability::ALL {
            let prefix = format!("GOVERNOR_{}", capability.as_str().to_uppercase());
            if let Some(n) = env_parse::<usize>(&format!("{prefix}_CONCURRENCY")) {
                *config.concurrency.get_mut(capability) = n.max(1);
            }
            if let Some(secs) = env_parse::<u64>(&format!("{prefix}_TIMEOUT_SECS")) {
                *config.call_timeouts.get_mut(capability) = Duration::from_secs(secs.max(1));
            }
        }

        if let Some(enabled) = env_flag("GOVERNOR_ADAPTIVE_ENABLED") {
            config.tuner.enabled = enabled;
        }
        if let Some(ms) = env_parse::<u64>("GOVERNOR_TUNER_COOLDOWN_MS") {
            config.tuner.cooldown = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("GOVERNOR_BREAKER_WINDOW_MS") {
            config.breaker.window = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_parse::<usize>("GOVERNOR_BREAKER_THRESHOLD") {
            config.breaker.threshold = threshold.max(1);
        }

        config
    }

    /// Set the base concurrency for one capability.
    pub fn with_concurrency(mut self, capability: Capability, limit: usize) -> Self {
        *self.concurrency.get_mut(capability) = limit;
        self
    }

    /// Set the call timeout for one capability.
    pub fn with_call_timeout(mut self, capability: Capability, timeout: Duration) -> Self {
        *self.call_timeouts.get_mut(capability) = timeout;
        self
    }

    pub fn with_tuner(mut self, tuner: TunerConfig) -> Self {
        self.tuner = tuner;
        self
    }

    pub fn with_breaker(mut self, window: Duration, threshold: usize) -> Self {
        self.breaker = BreakerConfig { window, threshold };
        self
    }

    pub fn validate(&self) -> Result<()> {
        for capability in Capability::ALL {
            if *self.concurrency.get(capability) == 0 {
                return Err(Error::Config(format!(
                    "{capability} concurrency must be positive"
                )));
            }
            if self.call_timeouts.get(capability).is_zero() {
                return Err(Error::Config(format!(
                    "{capability} call timeout must be positive"
                )));
            }
        }
        if self.breaker.threshold == 0 {
            return Err(Error::Config("breaker threshold must be positive".into()));
        }
        self.tuner.validate()
    }
}

// =============================================================================
// STAGES
// =============================================================================

/// Round-robin weights for the two scheduler lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneWeights {
    pub realtime: u32,
    pub recovery: u32,
}

impl Default for LaneWeights {
    fn default() -> Self {
        Self {
            realtime: defaults::LANE_WEIGHT_REALTIME,
            recovery: defaults::LANE_WEIGHT_RECOVERY,
        }
    }
}

impl LaneWeights {
    /// Equal weights (plain alternation).
    pub fn even() -> Self {
        Self {
            realtime: 1,
            recovery: 1,
        }
    }
}

/// Scheduling knobs for one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSettings {
    /// Polling interval when nothing is due sooner.
    pub scan_interval: Duration,
    /// Shortest delay between two cycles.
    pub min_delay: Duration,
    /// `running` rows untouched for longer are recovered.
    pub stale_after: Duration,
    /// Maximum rows fetched per cycle.
    pub scan_limit: usize,
    /// Concurrent items per cycle (further capped by the governor).
    pub concurrency: usize,
    /// First-attempt rows younger than this go to the realtime lane.
    pub realtime_window: Duration,
    pub lane_weights: LaneWeights,
    /// Whether this stage's failures count toward the circuit breaker.
    pub trip_breaker: bool,
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_millis(defaults::STAGE_SCAN_INTERVAL_MS),
            min_delay: Duration::from_millis(defaults::STAGE_MIN_DELAY_MS),
            stale_after: Duration::from_millis(defaults::STAGE_STALE_AFTER_MS),
            scan_limit: defaults::STAGE_SCAN_LIMIT,
            concurrency: defaults::STAGE_CONCURRENCY,
            realtime_window: Duration::from_millis(defaults::STAGE_REALTIME_WINDOW_MS),
            lane_weights: LaneWeights::default(),
            trip_breaker: true,
        }
    }
}

impl StageSettings {
    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_min_delay(mut self, delay: Duration) -> Self {
        self.min_delay = delay;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        self.scan_limit = limit;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_lane_weights(mut self, weights: LaneWeights) -> Self {
        self.lane_weights = weights;
        self
    }

    pub fn with_trip_breaker(mut self, trip_breaker: bool) -> Self {
        self.trip_breaker = trip_breaker;
        self
    }

    pub fn validate(&self, stage: Stage) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config(format!("{stage} concurrency must be positive")));
        }
        if self.scan_limit == 0 {
            return Err(Error::Config(format!("{stage} scan_limit must be positive")));
        }
        if self.scan_interval.is_zero() {
            return Err(Error::Config(format!(
                "{stage} scan_interval must be positive"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// RUNTIME
// =============================================================================

/// Everything the pipeline needs to run.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub governor: GovernorConfig,
    pub retry: RetryPolicy,
    /// Per-stage overrides; stages without an entry use the defaults.
    pub stages: BTreeMap<Stage, StageSettings>,
}

impl RuntimeConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// Reads everything [`GovernorConfig::from_env`] reads, plus:
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `TASK_MAX_ATTEMPTS` | `5` | Attempts before a task fails permanently |
    /// | `STAGE_SCAN_INTERVAL_MS` | `60000` | Idle polling interval for every stage |
    /// | `STAGE_CONCURRENCY` | `4` | Items dispatched concurrently per cycle |
    /// | `STAGE_STALE_AFTER_MS` | `300000` | Age at which `running` rows are recovered |
    pub fn from_env() -> Self {
        let mut retry = RetryPolicy::default();
        if let Some(max) = env_parse::<u32>("TASK_MAX_ATTEMPTS") {
            retry.max_attempts = max.max(1);
        }

        let mut base = StageSettings::default();
        if let Some(ms) = env_parse::<u64>("STAGE_SCAN_INTERVAL_MS") {
            base.scan_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(n) = env_parse::<usize>("STAGE_CONCURRENCY") {
            base.concurrency = n.max(1);
        }
        if let Some(ms) = env_parse::<u64>("STAGE_STALE_AFTER_MS") {
            base.stale_after = Duration::from_millis(ms);
        }

        Self {
            governor: GovernorConfig::from_env(),
            retry,
            stages: Stage::ALL.iter().map(|s| (*s, base.clone())).collect(),
        }
    }

    pub fn with_governor(mut self, governor: GovernorConfig) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the settings of one stage.
    pub fn with_stage(mut self, stage: Stage, settings: StageSettings) -> Self {
        self.stages.insert(stage, settings);
        self
    }

    /// Apply the same settings to every stage.
    pub fn with_all_stages(mut self, settings: StageSettings) -> Self {
        for stage in Stage::ALL {
            self.stages.insert(stage, settings.clone());
        }
        self
    }

    /// Effective settings for a stage.
    pub fn stage(&self, stage: Stage) -> StageSettings {
        self.stages.get(&stage).cloned().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<()> {
        self.governor.validate()?;
        self.retry.validate()?;
        for stage in Stage::ALL {
            self.stage(stage).validate(stage)?;
        }
        Ok(())
    }
}

// =============================================================================
// MODEL PROVIDERS
// =============================================================================

/// Connection settings for one model provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ProviderEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEndpoint")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Provider settings as saved by the user; handed to the circuit breaker
/// when the configuration changes.
pub type ProviderConfig = PerCapability<ProviderEndpoint>;
