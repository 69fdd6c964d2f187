//! # glimpse-governor
//!
//! Keeps external model calls within what providers can take.
//!
//! Each [`Capability`](glimpse_core::Capability) gets an
//! [`AdjustableSemaphore`]; a [`ConcurrencyTuner`] shrinks and regrows those
//! limits from observed outcomes; a [`CircuitBreaker`] stops capture when
//! failures pile up. [`RuntimeGovernor`] ties the three together.
//!
//! ```ignore
//! let governor = RuntimeGovernor::new(config, validator, events)?;
//! let summary = governor
//!     .call(Capability::Vlm, FailureOptions::default(), analyzer.analyze(batch))
//!     .await?;
//! ```

pub mod breaker;
pub mod governor;
pub mod semaphore;
pub mod tuner;

pub use breaker::{CircuitBreaker, ConfigSaveOutcome, FailureEvent};
pub use governor::{CapabilitySnapshot, FailureOptions, RuntimeGovernor};
pub use semaphore::{AdjustableSemaphore, Permit, SemaphoreState};
pub use tuner::{Adjustment, AdjustmentKind, CapabilityTunerState, ConcurrencyTuner, Outcome};
