//! Text recognition: OCR of each screenshot in the batch.

use std::sync::Arc;

use async_trait::async_trait;

use glimpse_core::{Result, Stage, TaskRow};

use super::require_screenshots;
use crate::stage::{StageOutput, StageProcessor};

/// OCR client. Results are persisted by the implementation.
#[async_trait]
pub trait TextRecognizer: Send + Sync {
    async fn recognize(&self, screenshot_id: i64) -> Result<()>;
}

pub struct TextRecognitionStage {
    recognizer: Arc<dyn TextRecognizer>,
}

impl TextRecognitionStage {
    pub fn new(recognizer: Arc<dyn TextRecognizer>) -> Self {
        Self { recognizer }
    }
}

#[async_trait]
impl StageProcessor for TextRecognitionStage {
    fn stage(&self) -> Stage {
        Stage::TextRecognition
    }

    /// Screenshots are recognized in order; the first failure fails the task
    /// and the whole batch is retried.
    fn validate(&self, task: &TaskRow) -> Result<()> {
        require_screenshots(task).map(|_| ())
    }

    async fn process(&self, task: &TaskRow) -> Result<StageOutput> {
        for screenshot_id in require_screenshots(task)? {
            self.recognizer.recognize(*screenshot_id).await?;
        }
        Ok(StageOutput::chain(task.payload.clone()))
    }
}
