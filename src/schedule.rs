#![forbid(unsafe_code)]

// Cancellable scheduled tasks (deferred cleanup, heartbeat scans, sync polling)

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to a spawned timer task. Cancelling (or dropping) the handle aborts the task.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Runs `task` once after `delay`.
    pub fn after<F>(delay: Duration, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
        Self { handle: Some(handle) }
    }

    /// Runs `tick` every `period`. The first tick fires immediately when
    /// `immediate` is set, otherwise after one full period.
    pub fn every<F, Fut>(period: Duration, immediate: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                interval.tick().await;
            }
            loop {
                interval.tick().await;
                tick().await;
            }
        });
        Self { handle: Some(handle) }
    }

    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Lets the task run to completion without holding a cancellation handle.
    pub fn detach(mut self) {
        self.handle.take();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Keyed set of pending tasks; scheduling a key cancels whatever was pending for it.
pub struct TaskSlots<K> {
    inner: Arc<StdRwLock<HashMap<K, ScheduledTask>>>,
}

impl<K> Clone for TaskSlots<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Eq + Hash> Default for TaskSlots<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(StdRwLock::new(HashMap::new())),
        }
    }
}

impl<K: Eq + Hash> TaskSlots<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: K, task: ScheduledTask) {
        let mut slots = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slots.insert(key, task) {
            old.cancel();
        }
    }

    /// Cancels the pending task for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let mut slots = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match slots.remove(key) {
            Some(task) => {
                task.cancel();
                true
            }
            None => false,
        }
    }

    /// Forgets the slot without aborting it (used by a task finishing itself).
    pub fn release(&self, key: &K) {
        let mut slots = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slots.remove(key) {
            // Dropping would abort the caller mid-flight
            task.detach();
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        let slots = self.inner.read().unwrap_or_else(|e| e.into_inner());
        slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self) {
        let mut slots = self.inner.write().unwrap_or_else(|e| e.into_inner());
        for (_, task) in slots.drain() {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _task = ScheduledTask::after(Duration::from_secs(5), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = ScheduledTask::after(Duration::from_secs(1), async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_ticks_until_dropped() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let task = ScheduledTask::every(Duration::from_millis(100), true, move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        drop(task);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slots_replace_cancels_previous() {
        let hits = Arc::new(AtomicUsize::new(0));
        let slots: TaskSlots<String> = TaskSlots::new();

        let h = hits.clone();
        slots.insert("room".into(), ScheduledTask::after(Duration::from_secs(1), async move {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        let h = hits.clone();
        slots.insert("room".into(), ScheduledTask::after(Duration::from_secs(1), async move {
            h.fetch_add(10, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 10);
        assert!(slots.contains(&"room".to_string()));
        assert!(slots.cancel(&"room".to_string()));
        assert!(slots.is_empty());
    }
}
