//! Domain models shared across the pipeline crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::payload::TaskPayload;

// =============================================================================
// CAPABILITIES
// =============================================================================

/// External-call budget pool. Every model call belongs to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Vision-language model (screenshot understanding, OCR).
    Vlm,
    /// Text-only language model.
    Text,
    /// Embedding model.
    Embedding,
}

impl Capability {
    /// Every capability, in a stable order.
    pub const ALL: [Capability; 3] = [Capability::Vlm, Capability::Text, Capability::Embedding];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Vlm => "vlm",
            Capability::Text => "text",
            Capability::Embedding => "embedding",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vlm" => Ok(Capability::Vlm),
            "text" => Ok(Capability::Text),
            "embedding" => Ok(Capability::Embedding),
            other => Err(Error::InvalidInput(format!("unknown capability: {other}"))),
        }
    }
}

// =============================================================================
// PIPELINE STAGES
// =============================================================================

/// A step of the enrichment pipeline. Each stage owns its own task rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Screenshot understanding through the vision model.
    VisionAnalysis,
    /// Text extraction from screenshots.
    TextRecognition,
    /// Grouping the batch into an activity thread.
    ThreadAssignment,
    /// Vector embedding of the batch summary.
    Embedding,
    /// Upsert into the vector index.
    Indexing,
}

impl Stage {
    /// Every stage, in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::VisionAnalysis,
        Stage::TextRecognition,
        Stage::ThreadAssignment,
        Stage::Embedding,
        Stage::Indexing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::VisionAnalysis => "vision_analysis",
            Stage::TextRecognition => "text_recognition",
            Stage::ThreadAssignment => "thread_assignment",
            Stage::Embedding => "embedding",
            Stage::Indexing => "indexing",
        }
    }

    /// The stage that receives this stage's output, if any.
    pub fn successor(&self) -> Option<Stage> {
        match self {
            Stage::VisionAnalysis => Some(Stage::TextRecognition),
            Stage::TextRecognition => Some(Stage::ThreadAssignment),
            Stage::ThreadAssignment => Some(Stage::Embedding),
            Stage::Embedding => Some(Stage::Indexing),
            Stage::Indexing => None,
        }
    }

    /// The budget pool this stage's external calls draw from.
    ///
    /// Indexing talks to the local vector index only and takes no permit.
    pub fn capability(&self) -> Option<Capability> {
        match self {
            Stage::VisionAnalysis | Stage::TextRecognition => Some(Capability::Vlm),
            Stage::ThreadAssignment => Some(Capability::Text),
            Stage::Embedding => Some(Capability::Embedding),
            Stage::Indexing => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown stage: {s}")))
    }
}

// =============================================================================
// TASK ROWS
// =============================================================================

/// Lifecycle status of a task row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    FailedPermanent,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::FailedPermanent => "failed_permanent",
        }
    }

    /// Whether no automatic transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::FailedPermanent)
    }

    /// Whether a row in this status may be claimed.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "succeeded" => Ok(TaskStatus::Succeeded),
            "failed" => Ok(TaskStatus::Failed),
            "failed_permanent" => Ok(TaskStatus::FailedPermanent),
            other => Err(Error::InvalidInput(format!("unknown task status: {other}"))),
        }
    }
}

/// One unit of stage work for one capture batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRow {
    pub id: i64,
    pub stage: Stage,
    /// Capture batch this work belongs to.
    pub subject_id: i64,
    pub status: TaskStatus,
    pub attempts: u32,
    /// `None` means eligible immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    pub payload: TaskPayload,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-status row counts for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub failed_permanent: i64,
}

impl QueueStats {
    /// Rows that still have work ahead of them.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running + self.failed
    }

    pub fn total(&self) -> i64 {
        self.outstanding() + self.succeeded + self.failed_permanent
    }
}

/// What a failed attempt turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Row went back to `failed` and becomes due at `next_run_at`.
    Retry { next_run_at: DateTime<Utc> },
    /// Row reached `failed_permanent`.
    Permanent,
    /// Row was no longer `running` (recovered as stale, or reset); nothing changed.
    Skipped,
}

/// Outcome of one stale-row sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaleRecovery {
    /// Rows returned to `pending`.
    pub requeued: u64,
    /// Rows that had already used every attempt and went to `failed_permanent`.
    pub exhausted: u64,
}

// =============================================================================
// SCHEDULER LANES
// =============================================================================

/// Fairness lane for due work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerLane {
    /// Fresh, first-attempt work.
    Realtime,
    /// Retries and backlog.
    Recovery,
}

impl SchedulerLane {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerLane::Realtime => "realtime",
            SchedulerLane::Recovery => "recovery",
        }
    }
}

impl fmt::Display for SchedulerLane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CAPTURE CONTROL
// =============================================================================

/// Status reported by the screenshot capture subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Running,
    Paused,
    Idle,
    Stopped,
}

impl CaptureStatus {
    /// Whether capture was active enough that it should come back after a
    /// breaker trip is cleared.
    pub fn allows_auto_resume(&self) -> bool {
        matches!(
            self,
            CaptureStatus::Running | CaptureStatus::Paused | CaptureStatus::Idle
        )
    }
}
