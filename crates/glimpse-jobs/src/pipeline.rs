//! Composition root: one governor, one scheduler per stage, wired over a
//! shared event bus.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info};

use glimpse_core::{
    AcceptAllValidator, BreakerObserver, CaptureControl, ConfigValidator, Error, EventBus,
    PipelineEvent, QueueStats, Result, RuntimeConfig, Stage, Subscription, TaskPayload, TaskStore,
};
use glimpse_governor::RuntimeGovernor;

use crate::scheduler::TaskScheduler;
use crate::stage::{StageContext, StageProcessor, TaskStage};
use crate::stages::{
    Embedder, EmbeddingStage, IndexingStage, TextRecognitionStage, TextRecognizer,
    ThreadAssigner, ThreadAssignmentStage, VectorIndex, VisionAnalysisStage, VisionAnalyzer,
};

/// External services the stages call.
#[derive(Clone)]
pub struct Collaborators {
    pub vision: Arc<dyn VisionAnalyzer>,
    pub text: Arc<dyn TextRecognizer>,
    pub threads: Arc<dyn ThreadAssigner>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
}

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder {
    store: Arc<dyn TaskStore>,
    collaborators: Collaborators,
    config: RuntimeConfig,
    events: Option<Arc<EventBus>>,
    validator: Option<Arc<dyn ConfigValidator>>,
    capture: Option<Arc<dyn CaptureControl>>,
    observers: Vec<Arc<dyn BreakerObserver>>,
}

impl PipelineBuilder {
    pub fn new(store: Arc<dyn TaskStore>, collaborators: Collaborators) -> Self {
        Self {
            store,
            collaborators,
            config: RuntimeConfig::default(),
            events: None,
            validator: None,
            capture: None,
            observers: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Share an existing bus instead of creating one.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validator consulted before a tripped breaker is reset.
    pub fn with_validator(mut self, validator: Arc<dyn ConfigValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_capture_control(mut self, capture: Arc<dyn CaptureControl>) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_breaker_observer(mut self, observer: Arc<dyn BreakerObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        self.config.validate()?;

        let events = self.events.unwrap_or_default();
        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(AcceptAllValidator));
        let governor = Arc::new(RuntimeGovernor::new(
            self.config.governor.clone(),
            validator,
            events.clone(),
        )?);
        if let Some(capture) = self.capture {
            governor.register_capture_control(capture);
        }
        for observer in self.observers {
            governor.register_observer(observer);
        }

        let ctx = StageContext {
            store: self.store.clone(),
            governor: governor.clone(),
            events: events.clone(),
            retry: self.config.retry.clone(),
        };
        let c = self.collaborators;
        let processors: Vec<Arc<dyn StageProcessor>> = vec![
            Arc::new(VisionAnalysisStage::new(c.vision)),
            Arc::new(TextRecognitionStage::new(c.text)),
            Arc::new(ThreadAssignmentStage::new(c.threads)),
            Arc::new(EmbeddingStage::new(c.embedder)),
            Arc::new(IndexingStage::new(c.index)),
        ];

        let schedulers = processors
            .into_iter()
            .map(|processor| {
                let stage = processor.stage();
                let hooks = TaskStage::new(processor, self.config.stage(stage), ctx.clone());
                (stage, TaskScheduler::new(Arc::new(hooks)))
            })
            .collect();

        Ok(Pipeline {
            store: self.store,
            governor,
            events,
            schedulers,
            wake_subscription: Mutex::new(None),
        })
    }
}

/// A running (or stopped) set of stage schedulers.
pub struct Pipeline {
    store: Arc<dyn TaskStore>,
    governor: Arc<RuntimeGovernor>,
    events: Arc<EventBus>,
    schedulers: BTreeMap<Stage, TaskScheduler<TaskStage>>,
    wake_subscription: Mutex<Option<Subscription>>,
}

impl Pipeline {
    /// Route `StageWake` events to their schedulers and start every stage.
    /// Must be called inside a tokio runtime.
    pub fn start(&self) {
        let mut subscription = self
            .wake_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if subscription.is_some() {
            return;
        }

        let schedulers = self.schedulers.clone();
        *subscription = Some(self.events.listen(move |envelope| {
            if let PipelineEvent::StageWake { stage, reason } = &envelope.payload {
                if let Some(scheduler) = schedulers.get(stage) {
                    scheduler.wake(reason);
                }
            }
        }));

        for scheduler in self.schedulers.values() {
            scheduler.start();
        }
        info!(
            subsystem = "jobs",
            component = "pipeline",
            op = "start",
            stages = self.schedulers.len(),
            "Pipeline started"
        );
    }

    /// Stop every stage and drop the wake routing.
    pub fn stop(&self) {
        let subscription = self
            .wake_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        for scheduler in self.schedulers.values() {
            scheduler.stop();
        }
        info!(
            subsystem = "jobs",
            component = "pipeline",
            op = "stop",
            "Pipeline stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.wake_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Queue a new capture batch at the first stage and wake it.
    ///
    /// Returns `None` when the batch is already being analyzed.
    pub async fn ingest(&self, subject_id: i64, screenshot_ids: Vec<i64>) -> Result<Option<i64>> {
        if screenshot_ids.is_empty() {
            return Err(Error::InvalidInput(format!(
                "batch {subject_id} has no screenshots"
            )));
        }
        let first = Stage::VisionAnalysis;
        let task_id = self
            .store
            .enqueue(
                first,
                subject_id,
                &TaskPayload::screenshots(screenshot_ids),
                Utc::now(),
            )
            .await?;
        if let Some(task_id) = task_id {
            debug!(
                subsystem = "jobs",
                component = "pipeline",
                op = "ingest",
                subject_id,
                task_id,
                "Capture batch queued"
            );
            self.wake(first, "capture batch ingested");
        }
        Ok(task_id)
    }

    pub fn wake(&self, stage: Stage, reason: &str) {
        if let Some(scheduler) = self.schedulers.get(&stage) {
            scheduler.wake(reason);
        }
    }

    pub fn scheduler(&self, stage: Stage) -> Option<&TaskScheduler<TaskStage>> {
        self.schedulers.get(&stage)
    }

    pub fn governor(&self) -> &Arc<RuntimeGovernor> {
        &self.governor
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn queue_stats(&self, stage: Stage) -> Result<QueueStats> {
        self.store.queue_stats(stage).await
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        for scheduler in self.schedulers.values() {
            scheduler.stop();
        }
    }
}
