//! Background task offloading.
//!
//! Refresh-ahead recomputation, asynchronous L2/L3 writes, and the
//! expiration sweeper all run off the caller's path. [`OffloadManager`]
//! owns those tasks: it deduplicates per-key work (one pending refresh per
//! cache key), tracks join handles so shutdown can drain or abort, and
//! optionally bounds task runtime.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use smol_str::SmolStr;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span, warn};

use memotier_core::CacheKey;

/// Key identifying an offloaded task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OffloadKey {
    /// Derived from a cache key; enables refresh deduplication.
    Cache(CacheKey),
    /// Auto-generated for non-cache tasks, grouped by kind.
    Generated {
        /// Kind of the task (e.g. "write-behind", "sweeper").
        kind: SmolStr,
        /// Unique id within the kind.
        id: u64,
    },
}

impl From<CacheKey> for OffloadKey {
    fn from(key: CacheKey) -> Self {
        OffloadKey::Cache(key)
    }
}

/// Upper bound on one offloaded task's runtime.
#[derive(Debug, Clone, Default)]
pub enum TaskDeadline {
    /// Run to completion.
    #[default]
    None,
    /// Abort the task after the duration.
    Cancel(Duration),
}

#[derive(Debug)]
struct OffloadInner {
    tasks: DashMap<OffloadKey, JoinHandle<()>>,
    key_counter: AtomicU64,
    deadline: TaskDeadline,
}

/// Manager for background tasks with per-key deduplication.
#[derive(Clone, Debug)]
pub struct OffloadManager {
    inner: Arc<OffloadInner>,
}

impl OffloadManager {
    /// Creates a manager with no task deadline.
    pub fn new() -> Self {
        Self::with_deadline(TaskDeadline::None)
    }

    /// Creates a manager with the given per-task deadline.
    pub fn with_deadline(deadline: TaskDeadline) -> Self {
        OffloadManager {
            inner: Arc::new(OffloadInner {
                tasks: DashMap::new(),
                key_counter: AtomicU64::new(0),
                deadline,
            }),
        }
    }

    /// Spawns a task under an auto-generated key of the given kind.
    pub fn spawn<F>(&self, kind: impl Into<SmolStr>, task: F) -> OffloadKey
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let key = OffloadKey::Generated {
            kind: kind.into(),
            id: self.inner.key_counter.fetch_add(1, Ordering::Relaxed),
        };
        self.spawn_with_key(key.clone(), task);
        key
    }

    /// Spawns a task under a specific key.
    ///
    /// Cache-derived keys deduplicate: if a task for the same key is still
    /// in flight the new one is skipped. Returns whether the task was
    /// spawned.
    pub fn spawn_with_key<K, F>(&self, key: K, task: F) -> bool
    where
        K: Into<OffloadKey>,
        F: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if matches!(&key, OffloadKey::Cache(_))
            && self
                .inner
                .tasks
                .get(&key)
                .is_some_and(|handle| !handle.is_finished())
        {
            debug!(?key, "offload task deduplicated, already in flight");
            return false;
        }

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let span = info_span!("offload_task", key = ?task_key);
        let handle = match self.inner.deadline.clone() {
            TaskDeadline::None => tokio::spawn(
                async move {
                    task.await;
                    inner.tasks.remove(&task_key);
                }
                .instrument(span),
            ),
            TaskDeadline::Cancel(deadline) => tokio::spawn(
                async move {
                    if tokio::time::timeout(deadline, task).await.is_err() {
                        warn!(?task_key, ?deadline, "offload task cancelled at deadline");
                    }
                    inner.tasks.remove(&task_key);
                }
                .instrument(span),
            ),
        };
        self.inner.tasks.insert(key, handle);
        true
    }

    /// Whether a task for `key` is still in flight.
    pub fn is_in_flight(&self, key: &OffloadKey) -> bool {
        self.inner
            .tasks
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of tasks still running.
    pub fn active_task_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| !entry.is_finished())
            .count()
    }

    /// Drops handles of finished tasks.
    pub fn cleanup_finished(&self) {
        self.inner.tasks.retain(|_, handle| !handle.is_finished());
    }

    /// Aborts every tracked task.
    pub fn cancel_all(&self) {
        for entry in self.inner.tasks.iter() {
            entry.abort();
        }
    }

    /// Waits for all tracked tasks to finish.
    pub async fn wait_all(&self) {
        loop {
            self.cleanup_finished();
            if self.inner.tasks.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Waits for all tracked tasks, bounded by `timeout`. Returns whether
    /// everything drained in time.
    pub async fn wait_all_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_all()).await.is_ok()
    }
}

impl Default for OffloadManager {
    fn default() -> Self {
        Self::new()
    }
}
