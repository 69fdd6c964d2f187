//! Vision analysis: the multimodal model summarizes the captured batch.

use std::sync::Arc;

use async_trait::async_trait;

use glimpse_core::{Result, Stage, TaskRow};

use super::require_screenshots;
use crate::stage::{StageOutput, StageProcessor};

/// Multimodal model client.
#[async_trait]
pub trait VisionAnalyzer: Send + Sync {
    /// Analyze the screenshots of one capture batch and persist the result.
    async fn analyze(&self, subject_id: i64, screenshot_ids: &[i64]) -> Result<()>;
}

pub struct VisionAnalysisStage {
    analyzer: Arc<dyn VisionAnalyzer>,
}

impl VisionAnalysisStage {
    pub fn new(analyzer: Arc<dyn VisionAnalyzer>) -> Self {
        Self { analyzer }
    }
}

#[async_trait]
impl StageProcessor for VisionAnalysisStage {
    fn stage(&self) -> Stage {
        Stage::VisionAnalysis
    }

    fn validate(&self, task: &TaskRow) -> Result<()> {
        require_screenshots(task).map(|_| ())
    }

    async fn process(&self, task: &TaskRow) -> Result<StageOutput> {
        let screenshots = require_screenshots(task)?;
        self.analyzer.analyze(task.subject_id, screenshots).await?;
        Ok(StageOutput::chain(task.payload.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::task;
    use glimpse_core::{Capability, Error, TaskPayload};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingAnalyzer {
        calls: Mutex<Vec<(i64, Vec<i64>)>>,
    }

    #[async_trait]
    impl VisionAnalyzer for RecordingAnalyzer {
        async fn analyze(&self, subject_id: i64, screenshot_ids: &[i64]) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push((subject_id, screenshot_ids.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_analyzes_batch_and_chains_payload() {
        let analyzer = Arc::new(RecordingAnalyzer::default());
        let stage = VisionAnalysisStage::new(analyzer.clone());
        assert_eq!(stage.capability(), Some(Capability::Vlm));

        let payload = TaskPayload::screenshots(vec![4, 5]);
        let output = stage
            .process(&task(Stage::VisionAnalysis, payload.clone()))
            .await
            .unwrap();

        assert_eq!(output, StageOutput::chain(payload));
        assert_eq!(*analyzer.calls.lock().unwrap(), vec![(100, vec![4, 5])]);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let stage = VisionAnalysisStage::new(Arc::new(RecordingAnalyzer::default()));
        let row = task(Stage::VisionAnalysis, TaskPayload::default());
        assert!(matches!(stage.validate(&row), Err(Error::InvalidInput(_))));
        let err = stage.process(&row).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!stage.defers_completion());
    }
}
