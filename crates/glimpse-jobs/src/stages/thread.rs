//! Thread assignment: the text model links a batch to an activity thread.

use std::sync::Arc;

use async_trait::async_trait;

use glimpse_core::{Result, Stage, TaskRow};

use super::require_screenshots;
use crate::stage::{StageOutput, StageProcessor};

/// Decides which activity thread a capture batch continues.
#[async_trait]
pub trait ThreadAssigner: Send + Sync {
    /// Returns the thread id, or `None` when the batch starts no thread
    /// (e.g. idle screens).
    async fn assign(&self, subject_id: i64, screenshot_ids: &[i64]) -> Result<Option<i64>>;
}

pub struct ThreadAssignmentStage {
    assigner: Arc<dyn ThreadAssigner>,
}

impl ThreadAssignmentStage {
    pub fn new(assigner: Arc<dyn ThreadAssigner>) -> Self {
        Self { assigner }
    }
}

#[async_trait]
impl StageProcessor for ThreadAssignmentStage {
    fn stage(&self) -> Stage {
        Stage::ThreadAssignment
    }

    fn validate(&self, task: &TaskRow) -> Result<()> {
        require_screenshots(task).map(|_| ())
    }

    async fn process(&self, task: &TaskRow) -> Result<StageOutput> {
        let screenshots = require_screenshots(task)?;
        let payload = match self.assigner.assign(task.subject_id, screenshots).await? {
            Some(thread_id) => task.payload.clone().with_thread(thread_id),
            None => task.payload.clone(),
        };
        Ok(StageOutput::chain(payload))
    }
}
