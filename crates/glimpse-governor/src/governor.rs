//! Runtime governor: one entry point for every external model call.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::time::Instant;
use tracing::{debug, info, warn};

use glimpse_core::{
    BreakerObserver, Capability, CaptureControl, ConfigValidator, Error, EventBus, GovernorConfig,
    PerCapability, PipelineEvent, ProviderConfig, Result,
};

use crate::breaker::{CircuitBreaker, ConfigSaveOutcome};
use crate::semaphore::{AdjustableSemaphore, Permit};
use crate::tuner::{ConcurrencyTuner, Outcome};

/// Options for [`RuntimeGovernor::record_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOptions {
    /// Whether the failure counts toward the circuit breaker. Low-stakes
    /// background calls opt out so they cannot halt capture.
    pub trip_breaker: bool,
}

impl Default for FailureOptions {
    fn default() -> Self {
        Self { trip_breaker: true }
    }
}

impl FailureOptions {
    /// Feed the tuner only.
    pub fn no_trip() -> Self {
        Self {
            trip_breaker: false,
        }
    }
}

/// Point-in-time view of one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySnapshot {
    pub capability: Capability,
    pub base: usize,
    pub limit: usize,
    pub in_use: usize,
    pub waiting: usize,
}

/// Per-capability semaphores, adaptive tuner, and the shared breaker.
pub struct RuntimeGovernor {
    config: GovernorConfig,
    semaphores: PerCapability<AdjustableSemaphore>,
    tuner: Option<Mutex<ConcurrencyTuner>>,
    breaker: CircuitBreaker,
    events: Arc<EventBus>,
}

impl RuntimeGovernor {
    /// Build a governor. Fails if the configuration is invalid.
    pub fn new(
        config: GovernorConfig,
        validator: Arc<dyn ConfigValidator>,
        events: Arc<EventBus>,
    ) -> Result<Self> {
        config.validate()?;

        let semaphores = PerCapability::from_fn(|cap| {
            AdjustableSemaphore::new(*config.concurrency.get(cap), cap.as_str())
        });
        let tuner = config
            .tuner
            .enabled
            .then(|| Mutex::new(ConcurrencyTuner::new(config.tuner.clone(), &config.concurrency)));
        let breaker = CircuitBreaker::new(config.breaker.clone(), validator, events.clone());

        info!(
            subsystem = "governor",
            vlm = config.concurrency.vlm,
            text = config.concurrency.text,
            embedding = config.concurrency.embedding,
            adaptive = config.tuner.enabled,
            "Runtime governor initialized"
        );

        Ok(Self {
            config,
            semaphores,
            tuner,
            breaker,
            events,
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Wait for a permit in the capability's pool.
    pub async fn acquire(&self, capability: Capability) -> Permit {
        self.semaphores.get(capability).acquire().await
    }

    /// Take a permit only if one is free.
    pub fn try_acquire(&self, capability: Capability) -> Option<Permit> {
        self.semaphores.get(capability).try_acquire()
    }

    /// Current (possibly degraded) limit.
    pub fn get_limit(&self, capability: Capability) -> usize {
        self.semaphores.get(capability).limit()
    }

    pub fn snapshot(&self, capability: Capability) -> CapabilitySnapshot {
        let state = self.semaphores.get(capability).state();
        CapabilitySnapshot {
            capability,
            base: *self.config.concurrency.get(capability),
            limit: state.limit,
            in_use: state.in_use,
            waiting: state.waiting,
        }
    }

    pub fn record_success(&self, capability: Capability) {
        self.feed_tuner(capability, Outcome::Success);
    }

    /// Report a failed call. Always feeds the tuner; feeds the breaker unless
    /// `options.trip_breaker` is false.
    pub async fn record_failure(
        &self,
        capability: Capability,
        error: &Error,
        options: FailureOptions,
    ) {
        self.feed_tuner(capability, Outcome::Failure);
        if options.trip_breaker {
            self.breaker
                .record_failure(capability, &error.to_string())
                .await;
        } else {
            debug!(
                subsystem = "governor",
                %capability,
                error = %error,
                "Failure excluded from circuit breaker"
            );
        }
    }

    /// Run one external call under the capability's budget: wait for a
    /// permit, bound the call by the capability timeout, and record the
    /// outcome. A timeout counts as a failure.
    pub async fn call<T, F>(&self, capability: Capability, options: FailureOptions, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.acquire(capability).await;
        let timeout = *self.config.call_timeouts.get(capability);
        let started = Instant::now();

        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                capability,
                after_ms: timeout.as_millis() as u64,
            }),
        };
        drop(permit);

        match &result {
            Ok(_) => {
                debug!(
                    subsystem = "governor",
                    %capability,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "External call succeeded"
                );
                self.record_success(capability);
            }
            Err(e) => {
                debug!(
                    subsystem = "governor",
                    %capability,
                    duration_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "External call failed"
                );
                self.record_failure(capability, e, options).await;
            }
        }
        result
    }

    fn feed_tuner(&self, capability: Capability, outcome: Outcome) {
        let Some(tuner) = &self.tuner else {
            return;
        };
        let adjustment = tuner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .record(capability, outcome, Instant::now());

        if let Some(adjustment) = adjustment {
            if let Err(e) = self.semaphores.get(capability).set_limit(adjustment.current) {
                warn!(subsystem = "governor", %capability, error = %e, "Rejected limit change");
                return;
            }
            info!(
                subsystem = "governor",
                component = "tuner",
                %capability,
                kind = ?adjustment.kind,
                previous = adjustment.previous,
                limit = adjustment.current,
                "Concurrency adjusted"
            );
            self.events.emit(PipelineEvent::ConcurrencyAdjusted {
                capability,
                previous: adjustment.previous,
                current: adjustment.current,
            });
        }
    }

    pub fn register_capture_control(&self, control: Arc<dyn CaptureControl>) {
        self.breaker.register_capture_control(control);
    }

    pub fn register_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.breaker.register_observer(observer);
    }

    pub async fn handle_config_saved(&self, config: &ProviderConfig) -> ConfigSaveOutcome {
        self.breaker.handle_config_saved(config).await
    }

    pub fn is_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn reset_breaker(&self) {
        self.breaker.reset();
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
