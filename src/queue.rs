//! Coalescing reconcile queue
//!
//! A work queue keyed by namespace name with three sets:
//!
//! - `queue`: FIFO of keys waiting for a worker
//! - `dirty`: keys that need a (further) reconcile pass
//! - `processing`: keys a worker currently holds
//!
//! Adding a key that is already dirty is a no-op. Adding a key that is being
//! processed only marks it dirty; it goes back on the FIFO when its current pass
//! finishes. No key is ever handed to two workers at once, and every add is
//! observed by a pass that starts after it.
//!
//! Failed keys are re-added after a jittered exponential delay, forever, until
//! a pass succeeds or the queue shuts down.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::retry::RetryConfig;
use crate::Error;

/// Reconciles a single key
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Drive the object identified by `key` to its desired state
    async fn reconcile(&self, key: &str) -> Result<(), Error>;
}

/// Queue tuning
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Number of concurrent worker loops
    pub workers: usize,
    /// Backoff applied to failed keys (`max_attempts` is ignored)
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            retry: RetryConfig::infinite(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: &'static str,
    config: QueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
}

/// Deduplicating work queue with per-key serialization
#[derive(Clone)]
pub struct ReconcileQueue {
    inner: Arc<Inner>,
}

impl ReconcileQueue {
    /// Create a queue with default tuning (one worker)
    pub fn new(name: &'static str) -> Self {
        Self::with_config(name, QueueConfig::default())
    }

    /// Create a queue with explicit tuning
    pub fn with_config(name: &'static str, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                config,
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Enqueue a key, coalescing with any pending or in-flight pass
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.inner.state.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            debug!(queue = self.inner.name, %key, "key in flight, marked for another pass");
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Enqueue a key after `delay`, unless the queue shuts down first
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no key is waiting for a worker
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consecutive failures recorded for a key
    pub fn failures(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stop accepting keys, drop pending retries and wake idle workers
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Run worker loops until `cancel` fires
    ///
    /// Reconciles already in flight complete; no new key is dequeued after
    /// cancellation is observed.
    pub async fn run<R>(&self, reconciler: &R, cancel: CancellationToken)
    where
        R: Reconciler + ?Sized,
    {
        let workers = self.inner.config.workers.max(1);
        info!(queue = self.inner.name, workers, "starting reconcile queue");

        futures::future::join_all((0..workers).map(|id| self.worker(id, reconciler, &cancel)))
            .await;

        self.shut_down();
        info!(queue = self.inner.name, "reconcile queue stopped");
    }

    async fn worker<R>(&self, id: usize, reconciler: &R, cancel: &CancellationToken)
    where
        R: Reconciler + ?Sized,
    {
        while let Some(key) = self.next(cancel).await {
            match reconciler.reconcile(&key).await {
                Ok(()) => {
                    self.forget(&key);
                    debug!(queue = self.inner.name, worker = id, %key, "reconciled");
                }
                Err(e) => {
                    let (attempt, delay) = self.requeue_with_backoff(&key);
                    warn!(
                        queue = self.inner.name,
                        worker = id,
                        %key,
                        attempt,
                        delay_ms = delay.as_millis(),
                        retryable = e.is_retryable(),
                        error = %e,
                        "reconcile failed, retrying"
                    );
                }
            }
            self.done(&key);
        }
    }

    async fn next(&self, cancel: &CancellationToken) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if cancel.is_cancelled() {
                return None;
            }
            {
                let mut state = self.inner.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    fn done(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    fn forget(&self, key: &str) {
        self.inner.state.lock().failures.remove(key);
    }

    fn requeue_with_backoff(&self, key: &str) -> (u32, Duration) {
        let attempt = {
            let mut state = self.inner.state.lock();
            let count = state.failures.entry(key.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };
        let delay = self.inner.config.retry.delay_for(attempt);
        self.add_after(key, delay);
        (attempt, delay)
    }
}
