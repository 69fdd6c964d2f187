//! Failure circuit breaker that halts capture when providers keep failing.
//!
//! # State Machine
//!
//! ```text
//! Closed --[threshold failures within window]--> Tripped
//! Tripped --[handle_config_saved + validation passes]--> Closed (capture restarted if it was active)
//! Tripped --[reset()]--> Closed
//! ```
//!
//! Failures from any capability count toward the same window. There is no
//! half-open probing: once tripped, only a saved-and-validated provider
//! configuration or a manual reset closes the breaker.
//!
//! Whether capture comes back is decided when the breaker trips, from the
//! capture status at that moment.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tokio::time::Instant;
use tracing::{error, info, warn};

use glimpse_core::{
    BreakerConfig, BreakerObserver, BreakerTripped, Capability, CaptureControl, ConfigValidator,
    EventBus, PipelineEvent, ProviderConfig, TripCause, ValidationOutcome,
};

/// One failure counted toward the window.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub at: Instant,
    pub capability: Capability,
    pub message: String,
}

#[derive(Debug, Default)]
struct BreakerState {
    tripped: bool,
    events: VecDeque<FailureEvent>,
    should_auto_resume: bool,
}

/// What [`CircuitBreaker::handle_config_saved`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSaveOutcome {
    /// Breaker was closed; nothing to do.
    NotTripped,
    /// Validation passed and the breaker was reset.
    Reset { capture_restarted: bool },
    /// Validation failed or errored; the breaker stays tripped.
    StillTripped { reason: String },
}

/// Time-window failure breaker.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
    capture: RwLock<Option<Arc<dyn CaptureControl>>>,
    observers: RwLock<Vec<Arc<dyn BreakerObserver>>>,
    validator: Arc<dyn ConfigValidator>,
    events: Arc<EventBus>,
}

impl CircuitBreaker {
    pub fn new(
        config: BreakerConfig,
        validator: Arc<dyn ConfigValidator>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
            capture: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            validator,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn capture(&self) -> Option<Arc<dyn CaptureControl>> {
        self.capture
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Register the capture subsystem's stop/start/status callbacks.
    pub fn register_capture_control(&self, control: Arc<dyn CaptureControl>) {
        *self
            .capture
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(control);
    }

    /// Register a UI surface to notify on trips.
    pub fn register_observer(&self, observer: Arc<dyn BreakerObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(observer);
    }

    pub fn is_tripped(&self) -> bool {
        self.lock().tripped
    }

    /// Failures currently inside the window (as of the last insert).
    pub fn failure_count(&self) -> usize {
        self.lock().events.len()
    }

    /// Auto-resume decision captured at the last trip.
    pub fn should_auto_resume(&self) -> bool {
        self.lock().should_auto_resume
    }

    /// Count a failure. Returns `true` if this call tripped the breaker.
    pub async fn record_failure(&self, capability: Capability, message: &str) -> bool {
        let now = Instant::now();
        let notice = {
            let mut state = self.lock();
            state.events.push_back(FailureEvent {
                at: now,
                capability,
                message: message.to_string(),
            });
            let window = self.config.window;
            state
                .events
                .retain(|event| now.saturating_duration_since(event.at) <= window);

            if state.tripped || state.events.len() < self.config.threshold {
                None
            } else {
                state.tripped = true;
                state.should_auto_resume = self
                    .capture()
                    .map(|control| control.status().allows_auto_resume())
                    .unwrap_or(false);
                Some(BreakerTripped {
                    window_ms: window.as_millis() as u64,
                    threshold: self.config.threshold,
                    count: state.events.len(),
                    last: TripCause {
                        capability,
                        message: message.to_string(),
                    },
                })
            }
        };

        match notice {
            Some(notice) => {
                self.trip(notice).await;
                true
            }
            None => false,
        }
    }

    async fn trip(&self, notice: BreakerTripped) {
        error!(
            subsystem = "governor",
            component = "breaker",
            capability = %notice.last.capability,
            count = notice.count,
            threshold = notice.threshold,
            window_ms = notice.window_ms,
            error = %notice.last.message,
            "Circuit breaker tripped; stopping capture"
        );

        if let Some(control) = self.capture() {
            if let Err(e) = control.stop().await {
                warn!(
                    subsystem = "governor",
                    component = "breaker",
                    error = %e,
                    "Failed to stop capture after breaker trip"
                );
            }
        }

        let observers = self
            .observers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for observer in observers {
            observer.breaker_tripped(&notice);
        }
        self.events.emit(PipelineEvent::BreakerTripped(notice));
    }

    /// React to a saved provider configuration.
    ///
    /// When tripped, validates the configuration; if it passes, restarts
    /// capture (only if capture was active at trip time) and resets.
    pub async fn handle_config_saved(&self, config: &ProviderConfig) -> ConfigSaveOutcome {
        if !self.is_tripped() {
            return ConfigSaveOutcome::NotTripped;
        }

        let reason = match self.validator.validate(config).await {
            Ok(ValidationOutcome::Valid) => None,
            Ok(ValidationOutcome::Invalid { reason }) => Some(reason),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = reason {
            warn!(
                subsystem = "governor",
                component = "breaker",
                reason = %reason,
                "Saved provider configuration failed validation; breaker stays tripped"
            );
            return ConfigSaveOutcome::StillTripped { reason };
        }

        let mut capture_restarted = false;
        if self.should_auto_resume() {
            if let Some(control) = self.capture() {
                match control.start().await {
                    Ok(()) => capture_restarted = true,
                    Err(e) => warn!(
                        subsystem = "governor",
                        component = "breaker",
                        error = %e,
                        "Failed to restart capture after configuration fix"
                    ),
                }
            }
        }

        self.clear(capture_restarted);
        ConfigSaveOutcome::Reset { capture_restarted }
    }

    /// Manual recovery. Does not restart capture.
    pub fn reset(&self) {
        self.clear(false);
    }

    fn clear(&self, resumed_capture: bool) {
        let was_tripped = {
            let mut state = self.lock();
            let was_tripped = state.tripped;
            *state = BreakerState::default();
            was_tripped
        };
        if was_tripped {
            info!(
                subsystem = "governor",
                component = "breaker",
                resumed_capture,
                "Circuit breaker reset"
            );
            self.events
                .emit(PipelineEvent::BreakerReset { resumed_capture });
        }
    }
}
