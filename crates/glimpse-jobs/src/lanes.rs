//! Weighted round-robin dispatch across the realtime and recovery lanes.
//!
//! Governor semaphores are FIFO, so the order in which workers *enter* them
//! decides who waits. Interleaving lanes by weight keeps a large recovery
//! backlog from queueing ahead of freshly captured work:
//!
//! ```text
//! weights {realtime: 3, recovery: 1}
//! sequence: R R R B R R R B ...   (B = recovery)
//! ```
//!
//! A worker whose preferred lane is empty takes from the other one, so no
//! worker idles while any lane has items.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;

use futures::future::join_all;
use futures::FutureExt;
use tracing::{error, warn};

use glimpse_core::{Error, LaneWeights, Result, SchedulerLane};

/// Items split by lane.
#[derive(Debug, Clone, PartialEq)]
pub struct Lanes<T> {
    pub realtime: Vec<T>,
    pub recovery: Vec<T>,
}

impl<T> Default for Lanes<T> {
    fn default() -> Self {
        Self {
            realtime: Vec::new(),
            recovery: Vec::new(),
        }
    }
}

impl<T> Lanes<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, lane: SchedulerLane, item: T) {
        match lane {
            SchedulerLane::Realtime => self.realtime.push(item),
            SchedulerLane::Recovery => self.recovery.push(item),
        }
    }

    pub fn len(&self) -> usize {
        self.realtime.len() + self.recovery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a batch of lane items is fanned out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneDispatch {
    /// Worker count upper bound.
    pub concurrency: usize,
    pub weights: LaneWeights,
    /// Stop after this many items, leaving the rest untouched.
    pub max_items: Option<usize>,
}

impl LaneDispatch {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            weights: LaneWeights::default(),
            max_items: None,
        }
    }

    pub fn with_weights(mut self, weights: LaneWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }
}

/// What a dispatch run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneReport {
    pub workers: usize,
    pub realtime: usize,
    pub recovery: usize,
    /// Items whose handler returned an error or panicked.
    pub failed: usize,
}

impl LaneReport {
    pub fn dispatched(&self) -> usize {
        self.realtime + self.recovery
    }
}

/// Round-robin order for the given weights. A zero weight counts as one.
pub fn lane_sequence(weights: LaneWeights) -> Vec<SchedulerLane> {
    let realtime = weights.realtime.max(1) as usize;
    let recovery = weights.recovery.max(1) as usize;
    let mut sequence = Vec::with_capacity(realtime + recovery);
    sequence.extend(std::iter::repeat(SchedulerLane::Realtime).take(realtime));
    sequence.extend(std::iter::repeat(SchedulerLane::Recovery).take(recovery));
    sequence
}

struct DispatchState<T> {
    realtime: VecDeque<T>,
    recovery: VecDeque<T>,
    sequence: Vec<SchedulerLane>,
    cursor: usize,
    max_items: Option<usize>,
    report: LaneReport,
}

impl<T> DispatchState<T> {
    fn queue(&mut self, lane: SchedulerLane) -> &mut VecDeque<T> {
        match lane {
            SchedulerLane::Realtime => &mut self.realtime,
            SchedulerLane::Recovery => &mut self.recovery,
        }
    }

    fn next(&mut self) -> Option<(SchedulerLane, T)> {
        if let Some(max) = self.max_items {
            if self.report.dispatched() >= max {
                return None;
            }
        }
        let preferred = self.sequence[self.cursor % self.sequence.len()];
        self.cursor += 1;

        let other = match preferred {
            SchedulerLane::Realtime => SchedulerLane::Recovery,
            SchedulerLane::Recovery => SchedulerLane::Realtime,
        };
        let lane = if !self.queue(preferred).is_empty() {
            preferred
        } else {
            other
        };
        let item = self.queue(lane).pop_front()?;
        match lane {
            SchedulerLane::Realtime => self.report.realtime += 1,
            SchedulerLane::Recovery => self.report.recovery += 1,
        }
        Some((lane, item))
    }
}

/// Run `handler` over every item with at most `min(concurrency, items)`
/// concurrent workers, interleaving lanes by weight.
///
/// A handler error or panic is reported through `on_error` (or logged at
/// `warn`) and never stops the other workers.
pub async fn process_in_lanes<T, F, Fut>(
    lanes: Lanes<T>,
    dispatch: &LaneDispatch,
    handler: F,
    on_error: Option<&(dyn Fn(&Error, SchedulerLane) + Send + Sync)>,
) -> LaneReport
where
    F: Fn(T, SchedulerLane) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let total = dispatch
        .max_items
        .map_or(lanes.len(), |max| max.min(lanes.len()));
    let workers = dispatch.concurrency.max(1).min(total);
    if workers == 0 {
        return LaneReport::default();
    }

    let state = Mutex::new(DispatchState {
        realtime: lanes.realtime.into(),
        recovery: lanes.recovery.into(),
        sequence: lane_sequence(dispatch.weights),
        cursor: 0,
        max_items: dispatch.max_items,
        report: LaneReport {
            workers,
            ..LaneReport::default()
        },
    });

    let worker = |_worker_id: usize| {
        let state = &state;
        let handler = &handler;
        async move {
            loop {
                let next = state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .next();
                let Some((lane, item)) = next else {
                    break;
                };

                let outcome = AssertUnwindSafe(async { handler(item, lane).await })
                    .catch_unwind()
                    .await;
                let error = match outcome {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => e,
                    Err(_) => {
                        error!(subsystem = "scheduler", lane = %lane, "Lane handler panicked");
                        Error::Internal("lane handler panicked".to_string())
                    }
                };
                state
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .report
                    .failed += 1;
                match on_error {
                    Some(callback) => callback(&error, lane),
                    None => warn!(
                        subsystem = "scheduler",
                        lane = %lane,
                        error = %error,
                        "Lane item failed"
                    ),
                }
            }
        }
    };

    join_all((0..workers).map(worker)).await;

    state
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn lanes(realtime: usize, recovery: usize) -> Lanes<(SchedulerLane, usize)> {
        Lanes {
            realtime: (0..realtime).map(|i| (SchedulerLane::Realtime, i)).collect(),
            recovery: (0..recovery).map(|i| (SchedulerLane::Recovery, i)).collect(),
        }
    }

    #[test]
    fn test_lane_sequence_follows_weights() {
        use SchedulerLane::{Realtime as R, Recovery as B};
        assert_eq!(lane_sequence(LaneWeights::default()), vec![R, R, R, B]);
        assert_eq!(lane_sequence(LaneWeights::even()), vec![R, B]);
        assert_eq!(
            lane_sequence(LaneWeights {
                realtime: 0,
                recovery: 2
            }),
            vec![R, B, B]
        );
    }

    #[test]
    fn test_lanes_push_and_len() {
        let mut lanes = Lanes::new();
        assert!(lanes.is_empty());
        lanes.push(SchedulerLane::Realtime, 1);
        lanes.push(SchedulerLane::Recovery, 2);
        lanes.push(SchedulerLane::Recovery, 3);
        assert_eq!(lanes.len(), 3);
        assert_eq!(lanes.recovery, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_single_worker_interleaves_by_weight() {
        let order = Mutex::new(Vec::new());
        let report = process_in_lanes(
            lanes(6, 3),
            &LaneDispatch::new(1),
            |item, lane| {
                assert_eq!(item.0, lane);
                order.lock().unwrap().push(lane);
                async { Ok(()) }
            },
            None,
        )
        .await;

        use SchedulerLane::{Realtime as R, Recovery as B};
        // After realtime runs dry the sequence falls back to recovery.
        assert_eq!(
            order.into_inner().unwrap(),
            vec![R, R, R, B, R, R, R, B, B]
        );
        assert_eq!(report.workers, 1);
        assert_eq!(report.realtime, 6);
        assert_eq!(report.recovery, 3);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn test_empty_lane_falls_back() {
        let seen = AtomicUsize::new(0);
        let report = process_in_lanes(
            lanes(0, 5),
            &LaneDispatch::new(2),
            |_, lane| {
                assert_eq!(lane, SchedulerLane::Recovery);
                seen.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            None,
        )
        .await;
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(report.recovery, 5);
    }

    #[tokio::test]
    async fn test_workers_bounded_by_items_and_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let report = process_in_lanes(
            lanes(10, 10),
            &LaneDispatch::new(4),
            |_, _| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            None,
        )
        .await;
        assert_eq!(report.workers, 4);
        assert_eq!(report.dispatched(), 20);
        assert_eq!(peak.load(Ordering::SeqCst), 4);

        let small =
            process_in_lanes(lanes(1, 1), &LaneDispatch::new(8), |_, _| async { Ok(()) }, None)
                .await;
        assert_eq!(small.workers, 2);
    }

    #[tokio::test]
    async fn test_max_items_caps_dispatch() {
        let report = process_in_lanes(
            lanes(10, 10),
            &LaneDispatch::new(3).with_max_items(5),
            |_, _| async { Ok(()) },
            None,
        )
        .await;
        assert_eq!(report.dispatched(), 5);
        assert_eq!(report.workers, 3);
    }

    #[tokio::test]
    async fn test_errors_and_panics_do_not_stop_siblings() {
        let handled = AtomicUsize::new(0);
        let errors = Mutex::new(Vec::new());
        let on_error = |e: &Error, lane: SchedulerLane| {
            errors.lock().unwrap().push((e.to_string(), lane));
        };

        let report = process_in_lanes(
            lanes(4, 2),
            &LaneDispatch::new(2).with_weights(LaneWeights::even()),
            |item, _| {
                handled.fetch_add(1, Ordering::SeqCst);
                async move {
                    match item {
                        (SchedulerLane::Realtime, 1) => Err(Error::Provider("503".into())),
                        (SchedulerLane::Recovery, 0) => panic!("handler bug"),
                        _ => Ok(()),
                    }
                }
            },
            Some(&on_error),
        )
        .await;

        assert_eq!(handled.load(Ordering::SeqCst), 6);
        assert_eq!(report.dispatched(), 6);
        assert_eq!(report.failed, 2);
        let errors = errors.into_inner().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&(
            "Provider error: 503".to_string(),
            SchedulerLane::Realtime
        )));
    }

    #[tokio::test]
    async fn test_empty_input_spawns_nothing() {
        let report =
            process_in_lanes(Lanes::<u8>::new(), &LaneDispatch::new(4), |_, _| async { Ok(()) }, None)
                .await;
        assert_eq!(report, LaneReport::default());
    }
}
