//! # glimpse-jobs
//!
//! Background processing for the glimpse capture pipeline.
//!
//! This crate provides:
//! - A self-pacing [`TaskScheduler`] with debounced, coalescing wakes
//! - Lane-weighted fan-out of due work ([`process_in_lanes`])
//! - The generic stage cycle ([`TaskStage`]) over a [`TaskStore`]
//! - Processors for each pipeline step and the [`Pipeline`] that wires them
//!
//! ## Example
//!
//! ```ignore
//! use glimpse_db::Database;
//! use glimpse_jobs::{Collaborators, PipelineBuilder, RuntimeConfig};
//!
//! let db = Database::connect("sqlite://glimpse.db").await?;
//! let pipeline = PipelineBuilder::new(Arc::new(db.tasks.clone()), collaborators)
//!     .with_config(RuntimeConfig::from_env())
//!     .with_capture_control(capture)
//!     .build()?;
//!
//! pipeline.start();
//! pipeline.ingest(batch_id, screenshot_ids).await?;
//! ```

pub mod lanes;
pub mod pipeline;
pub mod scheduler;
pub mod stage;
pub mod stages;

// Re-export core types
pub use glimpse_core::*;

pub use lanes::{lane_sequence, process_in_lanes, LaneDispatch, LaneReport, Lanes};
pub use pipeline::{Collaborators, Pipeline, PipelineBuilder};
pub use scheduler::{next_delay, SchedulerHooks, TaskScheduler};
pub use stage::{CycleReport, StageContext, StageOutput, StageProcessor, TaskStage};
pub use stages::{
    Embedder, EmbeddingStage, IndexingStage, MemoryVectorIndex, TextRecognitionStage,
    TextRecognizer, ThreadAssigner, ThreadAssignmentStage, VectorIndex, VisionAnalysisStage,
    VisionAnalyzer,
};

/// Default polling interval for an idle stage (milliseconds).
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = glimpse_core::defaults::STAGE_SCAN_INTERVAL_MS;

/// Default debounce before a woken stage runs (milliseconds).
pub const DEFAULT_SOON_DELAY_MS: u64 = glimpse_core::defaults::STAGE_SOON_DELAY_MS;
