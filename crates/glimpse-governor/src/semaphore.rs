//! Counting semaphore with FIFO waiters and a limit that can move at runtime.
//!
//! `tokio::sync::Semaphore` can add permits but cannot take back permits that
//! are checked out, so shrinking under load needs its own accounting:
//!
//! ```text
//! acquire:    permits > 0 ? take one : enqueue (FIFO)
//! release:    in_use -= 1; permits = min(permits + 1, limit - in_use); drain
//! set_limit:  limit = n;   permits = max(0, limit - in_use);          drain
//! ```
//!
//! While a shrink is in effect `in_use` may exceed `limit`; permits stay at
//! zero until enough holders release.
//!
//! # Usage
//!
//! ```ignore
//! let semaphore = AdjustableSemaphore::new(4, "vlm");
//! let permit = semaphore.acquire().await;
//! // ... external call ...
//! drop(permit); // or permit.release()
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::debug;

use glimpse_core::{Error, Result};

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreState {
    pub limit: usize,
    pub in_use: usize,
    pub permits: usize,
    /// Callers currently queued.
    pub waiting: usize,
}

struct State {
    limit: usize,
    in_use: usize,
    permits: usize,
    waiters: VecDeque<oneshot::Sender<Permit>>,
}

struct Inner {
    label: String,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        // Counters stay consistent even if a holder panicked mid-update.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        let headroom = state.limit.saturating_sub(state.in_use);
        state.permits = (state.permits + 1).min(headroom);
        self.drain(&mut state);
    }

    /// Hand free permits to the oldest live waiters.
    fn drain(self: &Arc<Self>, state: &mut State) {
        while state.permits > 0 {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.permits -= 1;
            state.in_use += 1;
            if let Err(mut permit) = waiter.send(Permit::armed(Arc::clone(self))) {
                // Waiter gave up before being served.
                permit.disarm();
                state.permits += 1;
                state.in_use -= 1;
            }
        }
    }
}

/// Counting semaphore whose limit can grow or shrink while permits are out.
#[derive(Clone)]
pub struct AdjustableSemaphore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AdjustableSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdjustableSemaphore")
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl AdjustableSemaphore {
    /// Creates a semaphore with `limit` permits.
    ///
    /// # Panics
    ///
    /// Panics if `limit` is 0.
    pub fn new(limit: usize, label: impl Into<String>) -> Self {
        assert!(limit > 0, "semaphore limit must be > 0");
        Self {
            inner: Arc::new(Inner {
                label: label.into(),
                state: Mutex::new(State {
                    limit,
                    in_use: 0,
                    permits: limit,
                    waiters: VecDeque::new(),
                }),
            }),
        }
    }

    /// Waits for a permit. Waiters are served in arrival order.
    ///
    /// Dropping the returned future before it resolves gives up the place in
    /// the queue; the permit goes to the next waiter instead.
    pub async fn acquire(&self) -> Permit {
        loop {
            let rx = {
                let mut state = self.inner.lock();
                if state.permits > 0 {
                    state.permits -= 1;
                    state.in_use += 1;
                    return Permit::armed(Arc::clone(&self.inner));
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };

            // Senders are only dropped after a send, so an error here means
            // the queue was torn down; enqueue again.
            if let Ok(permit) = rx.await {
                return permit;
            }
        }
    }

    /// Takes a permit only if one is free right now.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.lock();
        if state.permits > 0 {
            state.permits -= 1;
            state.in_use += 1;
            Some(Permit::armed(Arc::clone(&self.inner)))
        } else {
            None
        }
    }

    /// Changes the limit. Growing wakes queued waiters immediately; shrinking
    /// takes effect as holders release.
    pub fn set_limit(&self, limit: usize) -> Result<()> {
        if limit == 0 {
            return Err(Error::InvalidInput(format!(
                "{} semaphore limit must be positive",
                self.inner.label
            )));
        }
        let mut state = self.inner.lock();
        let previous = state.limit;
        state.limit = limit;
        state.permits = limit.saturating_sub(state.in_use);
        debug!(
            subsystem = "governor",
            component = "semaphore",
            label = %self.inner.label,
            previous,
            limit,
            in_use = state.in_use,
            "Semaphore limit changed"
        );
        self.inner.drain(&mut state);
        Ok(())
    }

    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    pub fn in_use(&self) -> usize {
        self.inner.lock().in_use
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn state(&self) -> SemaphoreState {
        let state = self.inner.lock();
        SemaphoreState {
            limit: state.limit,
            in_use: state.in_use,
            permits: state.permits,
            waiting: state.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }
}

/// A checked-out permit. Released exactly once, on drop or [`Permit::release`].
#[must_use = "the permit is released as soon as it is dropped"]
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl Permit {
    fn armed(inner: Arc<Inner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Forget the permit without touching the counters (caller already did).
    fn disarm(&mut self) {
        self.inner = None;
    }

    /// Release explicitly.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("label", &self.inner.as_ref().map(|i| i.label.as_str()))
            .finish()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}
