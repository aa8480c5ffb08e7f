//! Bounded pool for detached background work.
//!
//! Submission never blocks: work beyond the pending bound is rejected. Tasks
//! sharing a key run one after another, in submission order. A task that has not
//! started yet is replaced by a newer submission under the same key, so a key
//! has at most one task waiting behind the one running.

use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Tasks running at once.
    pub max_concurrency: usize,
    /// Tasks queued or running before submissions are rejected.
    pub max_pending: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            max_pending: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    /// Replaced a task of the same key that had not started.
    Coalesced,
    /// Pending bound reached.
    Rejected,
}

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Per key: the task waiting to run, if any. A key is present while its
/// worker is alive.
type Lanes = Arc<Mutex<HashMap<String, Option<Task>>>>;

fn lock(lanes: &Lanes) -> MutexGuard<'_, HashMap<String, Option<Task>>> {
    lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases a running task's pending slot, even if the task panics.
struct Running(Arc<AtomicUsize>);

impl Drop for Running {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The worker draining one key.
struct Lane {
    key: String,
    lanes: Lanes,
    pending: Arc<AtomicUsize>,
    retired: bool,
}

impl Lane {
    /// Next task for this key. Retires the lane when there is none.
    fn take_next(&mut self) -> Option<Task> {
        let mut lanes = lock(&self.lanes);
        let next = lanes.get_mut(&self.key).and_then(Option::take);
        if next.is_none() {
            lanes.remove(&self.key);
            self.retired = true;
        }
        next
    }
}

impl Drop for Lane {
    fn drop(&mut self) {
        if self.retired {
            return;
        }
        // Worker torn down early: free the key and whatever waited on it.
        if let Some(Some(_)) = lock(&self.lanes).remove(&self.key) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Clone)]
pub struct BackgroundPool {
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    lanes: Lanes,
    tracker: TaskTracker,
}

impl BackgroundPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrency.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending: config.max_pending.max(1),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    fn reserve(&self) -> bool {
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_pending).then_some(n + 1)
            })
            .is_ok()
    }

    /// Queue `task` under `key`.
    pub fn submit<F>(&self, key: impl Into<String>, task: F) -> Submission
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if self.tracker.is_closed() {
            warn!("Background pool is shutting down, dropping task {}", key);
            return Submission::Rejected;
        }

        {
            let mut lanes = lock(&self.lanes);
            if let Some(waiting) = lanes.get_mut(&key) {
                if waiting.is_some() {
                    *waiting = Some(Box::pin(task));
                    debug!("Task {} replaced before it started", key);
                    return Submission::Coalesced;
                }
                if !self.reserve() {
                    warn!(
                        "Background pool full ({} pending), rejecting task {}",
                        self.max_pending, key
                    );
                    return Submission::Rejected;
                }
                // The running worker picks it up when its current task ends.
                *waiting = Some(Box::pin(task));
                return Submission::Accepted;
            }
            if !self.reserve() {
                warn!(
                    "Background pool full ({} pending), rejecting task {}",
                    self.max_pending, key
                );
                return Submission::Rejected;
            }
            lanes.insert(key.clone(), Some(Box::pin(task)));
        }

        let mut lane = Lane {
            key,
            lanes: self.lanes.clone(),
            pending: self.pending.clone(),
            retired: false,
        };
        let semaphore = self.semaphore.clone();
        self.tracker.spawn(async move {
            loop {
                let Ok(_permit) = semaphore.clone().acquire_owned().await else {
                    return;
                };
                let Some(task) = lane.take_next() else {
                    return;
                };
                let _running = Running(lane.pending.clone());
                task.await;
            }
        });
        Submission::Accepted
    }

    /// Tasks queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        while self.pending() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting work and wait up to `timeout` for running tasks.
    /// Returns false if the timeout elapsed first.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}
