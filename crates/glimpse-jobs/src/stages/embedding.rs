//! Embedding: a vector for the batch's extracted content.

use std::sync::Arc;

use async_trait::async_trait;

use glimpse_core::{Error, Result, Stage, TaskRow};

use super::require_screenshots;
use crate::stage::{StageOutput, StageProcessor};

/// Embedding model client.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(
        &self,
        subject_id: i64,
        screenshot_ids: &[i64],
        thread_id: Option<i64>,
    ) -> Result<Vec<f32>>;
}

pub struct EmbeddingStage {
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingStage {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl StageProcessor for EmbeddingStage {
    fn stage(&self) -> Stage {
        Stage::Embedding
    }

    fn validate(&self, task: &TaskRow) -> Result<()> {
        require_screenshots(task).map(|_| ())
    }

    async fn process(&self, task: &TaskRow) -> Result<StageOutput> {
        let screenshots = require_screenshots(task)?;
        let vector = self
            .embedder
            .embed(task.subject_id, screenshots, task.payload.thread_id)
            .await?;
        if vector.is_empty() {
            return Err(Error::Provider(format!(
                "empty embedding for subject {}",
                task.subject_id
            )));
        }
        Ok(StageOutput::chain(task.payload.clone().with_embedding(vector)))
    }
}
