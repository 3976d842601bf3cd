use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::Notify;
use tracing::debug;

use crate::ExponentialBackoff;

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: queued, or re-added while in flight.
    dirty: FxHashSet<K>,
    processing: FxHashSet<K>,
    shutting_down: bool,
}

/// Deduplicating FIFO of keys with per-key in-flight exclusion and rate-limited retries.
///
/// A key is handed out by [`WorkQueue::get`] to at most one worker at a time. Adding a
/// key that is already queued is a no-op; adding one that is being processed marks it
/// dirty, and it is queued again once when [`WorkQueue::done`] is called.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    limiter: Mutex<ExponentialBackoff<K>>,
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new(name: impl Into<String>, base: Duration, max: Duration) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: FxHashSet::default(),
                processing: FxHashSet::default(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            limiter: Mutex::new(ExponentialBackoff::new(base, max)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }
    fn limiter(&self) -> MutexGuard<'_, ExponentialBackoff<K>> { self.limiter.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn name(&self) -> &str { &self.name }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down || st.dirty.contains(&key) { return; }
        st.dirty.insert(key.clone());
        if st.processing.contains(&key) { return; }
        st.queue.push_back(key);
        let depth = st.queue.len();
        drop(st);
        metrics::counter!("workqueue_adds_total", 1u64, "queue" => self.name.clone());
        metrics::gauge!("workqueue_depth", depth as f64, "queue" => self.name.clone());
        self.notify.notify_one();
    }

    /// Wait for the next key. Returns `None` once the queue is shutting down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down { return None; }
                if let Some(key) = st.queue.pop_front() {
                    st.processing.insert(key.clone());
                    st.dirty.remove(&key);
                    let depth = st.queue.len();
                    drop(st);
                    metrics::gauge!("workqueue_depth", depth as f64, "queue" => self.name.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release the in-flight lock on `key`; re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains(key) && !st.shutting_down {
            st.queue.push_back(key.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    pub fn forget(&self, key: &K) { self.limiter().forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.limiter().num_requeues(key) }

    /// Re-add `key` after its backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) {
        let delay = self.limiter().when(&key);
        debug!(queue = %self.name, delay_ms = %delay.as_millis(), "requeue with backoff");
        self.add_after(key, delay);
    }

    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let q = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            q.add(key);
        });
    }

    /// Stop handing out work. Blocked `get` calls return `None`; later adds are ignored.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<WorkQueue<&'static str>> {
        WorkQueue::new("test", Duration::from_millis(1), Duration::from_millis(10))
    }

    #[tokio::test]
    async fn repeated_adds_coalesce_into_one_item() {
        let q = queue();
        for _ in 0..10 { q.add("a"); }
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_during_processing_is_deferred_until_done() {
        let q = queue();
        q.add("a");
        let k = q.get().await.unwrap();
        q.add("a");
        q.add("a");
        assert!(q.is_empty(), "in-flight key must not be handed out twice");
        q.done(&k);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = queue();
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn rate_limited_add_arrives_after_backoff() {
        let q = queue();
        q.add_rate_limited("a");
        assert_eq!(q.num_requeues(&"a"), 1);
        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.unwrap();
        assert_eq!(got, Some("a"));
        q.forget(&"a");
        assert_eq!(q.num_requeues(&"a"), 0);
    }
}
