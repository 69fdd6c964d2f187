//! End-to-end pipeline runs over a temporary SQLite database.
//!
//! This test suite validates:
//! - Pipeline-001: An ingested batch flows through all five stages into the index
//! - Pipeline-002: Empty batches are rejected at ingest
//! - Pipeline-003: Re-ingesting a queued batch reuses its row
//! - Pipeline-004: Repeated vision failures trip the breaker and stop capture
//! - Pipeline-005: A stopped pipeline leaves queued work alone
//! - Pipeline-006: Invalid configuration is rejected at build time

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use glimpse_core::{
    CaptureControl, CaptureStatus, Error, PipelineEvent, Result, RuntimeConfig, Stage,
    StageSettings, TaskStore,
};
use glimpse_db::Database;
use glimpse_jobs::{
    Collaborators, Embedder, MemoryVectorIndex, Pipeline, PipelineBuilder, TextRecognizer,
    ThreadAssigner, VectorIndex, VisionAnalyzer,
};

/// Batches whose subject id ends in this value fail vision analysis.
const BROKEN_SUBJECT: i64 = 666;

// ============================================================================
// COLLABORATOR MOCKS
// ============================================================================

#[derive(Default)]
struct MockVision {
    calls: AtomicUsize,
}

#[async_trait]
impl VisionAnalyzer for MockVision {
    async fn analyze(&self, subject_id: i64, _screenshot_ids: &[i64]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if subject_id % 1000 == BROKEN_SUBJECT {
            return Err(Error::Provider("vision model unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct MockText {
    recognized: AtomicUsize,
}

#[async_trait]
impl TextRecognizer for MockText {
    async fn recognize(&self, _screenshot_id: i64) -> Result<()> {
        self.recognized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct MockThreads;

#[async_trait]
impl ThreadAssigner for MockThreads {
    async fn assign(&self, subject_id: i64, _screenshot_ids: &[i64]) -> Result<Option<i64>> {
        Ok(Some(subject_id * 10))
    }
}

struct MockEmbedder;

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(
        &self,
        subject_id: i64,
        _screenshot_ids: &[i64],
        thread_id: Option<i64>,
    ) -> Result<Vec<f32>> {
        let threaded = if thread_id.is_some() { 1.0 } else { 0.0 };
        Ok(vec![subject_id as f32, threaded])
    }
}

struct MockCapture {
    stopped: AtomicBool,
}

#[async_trait]
impl CaptureControl for MockCapture {
    async fn stop(&self) -> Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn status(&self) -> CaptureStatus {
        if self.stopped.load(Ordering::SeqCst) {
            CaptureStatus::Stopped
        } else {
            CaptureStatus::Running
        }
    }
}

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

struct Fixture {
    _dir: TempDir,
    pipeline: Pipeline,
    vision: Arc<MockVision>,
    text: Arc<MockText>,
    index: Arc<MemoryVectorIndex>,
    capture: Arc<MockCapture>,
}

/// Stage settings that keep a test run short.
fn fast_config() -> RuntimeConfig {
    RuntimeConfig::default().with_all_stages(
        StageSettings::default()
            .with_scan_interval(Duration::from_millis(200))
            .with_min_delay(Duration::from_millis(20)),
    )
}

async fn fixture(config: RuntimeConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("pipeline.db").display());
    let db = Database::connect(&url).await.unwrap();

    let vision = Arc::new(MockVision::default());
    let text = Arc::new(MockText::default());
    let index = Arc::new(MemoryVectorIndex::new());
    let capture = Arc::new(MockCapture {
        stopped: AtomicBool::new(false),
    });
    let collaborators = Collaborators {
        vision: vision.clone(),
        text: text.clone(),
        threads: Arc::new(MockThreads),
        embedder: Arc::new(MockEmbedder),
        index: index.clone(),
    };

    let pipeline = PipelineBuilder::new(Arc::new(db.tasks.clone()), collaborators)
        .with_config(config)
        .with_capture_control(capture.clone())
        .build()
        .unwrap();

    Fixture {
        _dir: dir,
        pipeline,
        vision,
        text,
        index,
        capture,
    }
}

/// Poll `check` until it holds, failing the test after ten seconds.
async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

// ============================================================================
// END TO END
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_flows_through_every_stage() {
    let f = fixture(fast_config()).await;
    f.pipeline.start();
    assert!(f.pipeline.is_running());

    f.pipeline.ingest(1, vec![11, 12]).await.unwrap();
    f.pipeline.ingest(2, vec![21]).await.unwrap();

    let pipeline = &f.pipeline;
    wait_until("both batches indexed", move || async move {
        pipeline
            .queue_stats(Stage::Indexing)
            .await
            .map(|stats| stats.succeeded == 2)
            .unwrap_or(false)
    })
    .await;

    for stage in Stage::ALL {
        let stats = f.pipeline.queue_stats(stage).await.unwrap();
        assert_eq!(stats.succeeded, 2, "{stage} did not finish both batches");
        assert_eq!(stats.outstanding(), 0);
    }
    assert_eq!(f.vision.calls.load(Ordering::SeqCst), 2);
    assert_eq!(f.text.recognized.load(Ordering::SeqCst), 3);

    // The indexing cycle flushes after the upserts it ran.
    let index = &f.index;
    wait_until("index flushed", move || async move { index.len() == 2 }).await;
    let hits = f.index.search(&[2.0, 1.0], 1).await.unwrap();
    assert_eq!(hits[0].0, 2);

    f.pipeline.stop();
    assert!(!f.pipeline.is_running());
}

// ============================================================================
// INGEST
// ============================================================================

#[tokio::test]
async fn test_empty_batch_rejected() {
    let f = fixture(fast_config()).await;
    let result = f.pipeline.ingest(1, Vec::new()).await;
    assert!(matches!(result, Err(Error::InvalidInput(_))));
    let stats = f.pipeline.queue_stats(Stage::VisionAnalysis).await.unwrap();
    assert_eq!(stats.total(), 0);
}

#[tokio::test]
async fn test_reingest_reuses_queued_row() {
    let f = fixture(fast_config()).await;
    let first = f.pipeline.ingest(7, vec![1]).await.unwrap();
    let second = f.pipeline.ingest(7, vec![1, 2]).await.unwrap();
    assert!(first.is_some());
    assert_eq!(first, second);

    let row = f.pipeline.store().get(first.unwrap()).await.unwrap().unwrap();
    assert_eq!(row.payload.screenshot_ids, vec![1, 2]);
}

// ============================================================================
// BREAKER
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_vision_failures_trip_breaker() {
    let f = fixture(fast_config()).await;
    let mut rx = f.pipeline.events().subscribe();
    f.pipeline.start();

    for offset in 0..3 {
        // Distinct subjects that all hit the broken model.
        f.pipeline
            .ingest(BROKEN_SUBJECT + offset * 1000, vec![1])
            .await
            .unwrap();
    }

    let tripped = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if let PipelineEvent::BreakerTripped(notice) = envelope.payload {
                        return notice;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event bus closed: {e}"),
            }
        }
    })
    .await
    .expect("breaker should trip");

    assert_eq!(tripped.threshold, 3);
    assert!(f.pipeline.governor().is_tripped());
    assert!(f.capture.stopped.load(Ordering::SeqCst));
    f.pipeline.stop();
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stopped_pipeline_leaves_work_queued() {
    let f = fixture(fast_config()).await;
    f.pipeline.start();
    f.pipeline.stop();
    for stage in Stage::ALL {
        assert!(!f.pipeline.scheduler(stage).unwrap().is_started());
    }

    f.pipeline.ingest(3, vec![31]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = f.pipeline.queue_stats(Stage::VisionAnalysis).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(f.vision.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("bad.db").display());
    let db = Database::connect(&url).await.unwrap();
    let store: Arc<dyn TaskStore> = Arc::new(db.tasks.clone());
    let collaborators = Collaborators {
        vision: Arc::new(MockVision::default()),
        text: Arc::new(MockText::default()),
        threads: Arc::new(MockThreads),
        embedder: Arc::new(MockEmbedder),
        index: Arc::new(MemoryVectorIndex::new()),
    };
    let config = RuntimeConfig::default()
        .with_stage(Stage::Embedding, StageSettings::default().with_concurrency(0));

    let result = PipelineBuilder::new(store, collaborators)
        .with_config(config)
        .build();
    assert!(matches!(result, Err(Error::Config(_))));
}
