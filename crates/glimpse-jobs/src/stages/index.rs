//! Indexing: upsert batch vectors into the search index.
//!
//! Upserts are buffered by the index and flushed once per cycle, after the
//! last successful upsert.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tracing::debug;

use glimpse_core::{Error, Result, Stage, TaskRow};

use crate::stage::{StageOutput, StageProcessor};

/// Vector search index keyed by capture batch.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(&self, subject_id: i64, vector: &[f32]) -> Result<()>;

    /// Nearest `k` batches by cosine similarity, best first.
    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>>;

    /// Persist buffered upserts.
    async fn flush(&self) -> Result<()>;
}

pub struct IndexingStage {
    index: Arc<dyn VectorIndex>,
}

impl IndexingStage {
    pub fn new(index: Arc<dyn VectorIndex>) -> Self {
        Self { index }
    }
}

#[async_trait]
impl StageProcessor for IndexingStage {
    fn stage(&self) -> Stage {
        Stage::Indexing
    }

    fn validate(&self, task: &TaskRow) -> Result<()> {
        require_embedding(task).map(|_| ())
    }

    async fn process(&self, task: &TaskRow) -> Result<StageOutput> {
        let vector = require_embedding(task)?;
        self.index.upsert(task.subject_id, vector).await?;
        Ok(StageOutput::done())
    }

    /// An upsert is only durable once the cycle's flush lands.
    fn defers_completion(&self) -> bool {
        true
    }

    async fn finish_cycle(&self, succeeded: usize) -> Result<()> {
        if succeeded == 0 {
            return Ok(());
        }
        self.index.flush().await?;
        debug!(subsystem = "jobs", stage = "indexing", row_count = succeeded, "Index flushed");
        Ok(())
    }
}

fn require_embedding(task: &TaskRow) -> Result<&[f32]> {
    match task.payload.embedding.as_deref() {
        Some(vector) if !vector.is_empty() => Ok(vector),
        _ => Err(Error::InvalidInput(format!(
            "indexing task {} has no embedding",
            task.id
        ))),
    }
}

/// Calculate cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Brute-force in-process index. Upserts become searchable on flush.
#[derive(Default)]
pub struct MemoryVectorIndex {
    pending: RwLock<HashMap<i64, Vec<f32>>>,
    vectors: RwLock<HashMap<i64, Vec<f32>>>,
    flushes: AtomicUsize,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Searchable vectors.
    pub fn len(&self) -> usize {
        self.vectors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, subject_id: i64, vector: &[f32]) -> Result<()> {
        self.pending
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(subject_id, vector.to_vec());
        Ok(())
    }

    async fn search(&self, query: &[f32], k: usize) -> Result<Vec<(i64, f32)>> {
        let vectors = self
            .vectors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut scored: Vec<(i64, f32)> = vectors
            .iter()
            .map(|(id, v)| (*id, cosine_similarity(query, v)))
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    async fn flush(&self) -> Result<()> {
        let drained: Vec<(i64, Vec<f32>)> = self
            .pending
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain()
            .collect();
        self.vectors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(drained);
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::test_support::task;
    use glimpse_core::TaskPayload;

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_upserts_visible_after_flush() {
        let index = Arc::new(MemoryVectorIndex::new());
        let stage = IndexingStage::new(index.clone());
        assert_eq!(stage.capability(), None);
        assert!(stage.defers_completion());

        let payload = TaskPayload::screenshots(vec![1]).with_embedding(vec![1.0, 0.0]);
        let output = stage.process(&task(Stage::Indexing, payload)).await.unwrap();
        assert_eq!(output, StageOutput::done());
        assert!(index.is_empty());

        stage.finish_cycle(1).await.unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index.flush_count(), 1);

        let hits = index.search(&[0.9, 0.1], 5).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 100);
    }

    #[tokio::test]
    async fn test_idle_cycle_skips_flush() {
        let index = Arc::new(MemoryVectorIndex::new());
        let stage = IndexingStage::new(index.clone());
        stage.finish_cycle(0).await.unwrap();
        assert_eq!(index.flush_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_embedding_rejected() {
        let stage = IndexingStage::new(Arc::new(MemoryVectorIndex::new()));
        let row = task(Stage::Indexing, TaskPayload::screenshots(vec![1]));
        assert!(matches!(stage.validate(&row), Err(Error::InvalidInput(_))));
        let result = stage.process(&row).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        let empty = task(
            Stage::Indexing,
            TaskPayload::screenshots(vec![1]).with_embedding(Vec::new()),
        );
        assert!(stage.validate(&empty).is_err());
    }

    #[tokio::test]
    async fn test_search_orders_by_similarity() {
        let index = MemoryVectorIndex::new();
        index.upsert(1, &[1.0, 0.0]).await.unwrap();
        index.upsert(2, &[0.7, 0.7]).await.unwrap();
        index.upsert(3, &[0.0, 1.0]).await.unwrap();
        index.flush().await.unwrap();

        let hits = index.search(&[1.0, 0.1], 2).await.unwrap();
        let ids: Vec<i64> = hits.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2]);
    }
}
