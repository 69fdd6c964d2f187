//! Processors for the five pipeline steps.
//!
//! Each processor adapts one injected collaborator (a model client, the
//! thread store, the vector index) to [`StageProcessor`](crate::stage::StageProcessor).

pub mod embedding;
pub mod index;
pub mod ocr;
pub mod thread;
pub mod vision;

pub use embedding::{EmbeddingStage, Embedder};
pub use index::{IndexingStage, MemoryVectorIndex, VectorIndex};
pub use ocr::{TextRecognitionStage, TextRecognizer};
pub use thread::{ThreadAssigner, ThreadAssignmentStage};
pub use vision::{VisionAnalysisStage, VisionAnalyzer};

use glimpse_core::{Error, Result, TaskRow};

/// Screenshot ids of a task, rejecting empty batches.
pub(crate) fn require_screenshots(task: &TaskRow) -> Result<&[i64]> {
    if task.payload.screenshot_ids.is_empty() {
        return Err(Error::InvalidInput(format!(
            "{} task {} has no screenshots",
            task.stage, task.id
        )));
    }
    Ok(&task.payload.screenshot_ids)
}
