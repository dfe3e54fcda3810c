//! Deduplicating work queue of SidecarInjector keys
//!
//! A key is in at most one of three places: queued, processing, or neither.
//! Adding a queued key is a no-op. Adding a key that is being processed marks
//! it dirty; [`WorkQueue::done`] then queues it once more, so a burst of
//! events during a sync collapses into a single follow-up sync.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use sidecar_injector_common::retry::RetryConfig;

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

/// FIFO of keys with per-key dedup and exponential retry backoff
pub struct WorkQueue {
    state: Mutex<State>,
    notify: Notify,
    backoff: RetryConfig,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(RetryConfig::work_queue())
    }
}

impl WorkQueue {
    /// Create a queue that delays retries according to `backoff`
    pub fn new(backoff: RetryConfig) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    /// Enqueue `key` unless it is already waiting
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock();
        if state.shutting_down || !state.dirty.insert(key.to_string()) {
            return;
        }
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as no longer processing, requeueing it if it was re-added
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Re-add `key` after its backoff delay
    ///
    /// Each consecutive failure doubles the delay up to the configured cap.
    /// There is no retry limit.
    pub fn retry(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return;
            }
            let count = state.failures.entry(key.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let delay = self.backoff.delay_for(failures);
        debug!(key, failures, delay_ms = delay.as_millis() as u64, "requeueing with backoff");

        let queue = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys waiting to be picked up
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Whether no key is waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out keys and wake every waiting worker
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn keys_come_out_in_order() {
        let queue = WorkQueue::default();
        queue.add("a");
        queue.add("b");
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::default();
        queue.add("a");
        queue.add("a");
        queue.add("a");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn add_during_processing_requeues_once_on_done() {
        let queue = WorkQueue::default();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.add("a");
        queue.add("a");
        // not handed out while still processing
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let queue = Arc::new(WorkQueue::default());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("late");
        let key = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("worker should wake")
            .unwrap();
        assert_eq!(key.as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiting_workers() {
        let queue = Arc::new(WorkQueue::default());
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.get().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.shutdown();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
        queue.add("ignored");
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_backs_off_exponentially() {
        let queue = Arc::new(WorkQueue::default());
        queue.retry("a");
        assert_eq!(queue.num_requeues("a"), 1);
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_millis(6)).await;
        assert_eq!(queue.len(), 1);
        let key = queue.get().await.unwrap();

        queue.retry(&key);
        queue.done(&key);
        assert_eq!(queue.num_requeues("a"), 2);
        tokio::time::sleep(Duration::from_millis(6)).await;
        assert!(queue.is_empty(), "second retry waits 10ms");
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(queue.len(), 1);

        queue.forget("a");
        assert_eq!(queue.num_requeues("a"), 0);
    }
}
