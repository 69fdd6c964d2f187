//! # glimpse-core
//!
//! Core types, traits, and abstractions for the glimpse capture pipeline.
//!
//! This crate provides the shared data structures (capabilities, stages,
//! task rows, the versioned payload codec), configuration, the retry policy,
//! the event bus, and the trait seams that the governor, storage, and
//! scheduler crates build on.

pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod payload;
pub mod retry;
pub mod traits;

// Re-export commonly used types at crate root
pub use config::{
    BreakerConfig, GovernorConfig, LaneWeights, PerCapability, ProviderConfig, ProviderEndpoint,
    RuntimeConfig, StageSettings, TunerConfig,
};
pub use error::{Error, Result};
pub use events::{BreakerTripped, EventBus, EventEnvelope, PipelineEvent, Subscription, TripCause};
pub use models::*;
pub use payload::TaskPayload;
pub use retry::RetryPolicy;
pub use traits::*;
