//! Coalescing work queue keyed by [`ObjectKey`].
//!
//! A key is held at most once. A key handed to a worker stays out of
//! circulation until `done`; re-adding it meanwhile marks it dirty and it is
//! queued again on `done`. This gives single-pass exclusivity per key.
//!
//! Retry attempts are counted here too, per key, so every worker sees the
//! same count no matter which one handled the previous pass.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::gauge;
use replicon_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Default)]
struct Inner {
    order: VecDeque<ObjectKey>,
    queued: FxHashSet<ObjectKey>,
    processing: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    attempts: FxHashMap<ObjectKey, u32>,
    dropped: u64,
    shutdown: bool,
}

pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    cap: usize,
}

impl WorkQueue {
    pub fn with_capacity(cap: usize) -> Self {
        Self { inner: Mutex::new(Inner::default()), notify: Notify::new(), cap: cap.max(1) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn push(&self, inner: &mut Inner, key: ObjectKey) {
        if inner.order.len() >= self.cap {
            if let Some(old) = inner.order.pop_front() {
                warn!(key = %old, cap = self.cap, "work queue full; dropping oldest key");
                inner.queued.remove(&old);
                inner.dropped += 1;
            }
        }
        inner.queued.insert(key.clone());
        inner.order.push_back(key);
        gauge!("workqueue_depth", inner.order.len() as f64);
        self.notify.notify_one();
    }

    pub fn add(&self, key: ObjectKey) {
        let mut inner = self.lock();
        if inner.shutdown || inner.queued.contains(&key) {
            return;
        }
        if inner.processing.contains(&key) {
            debug!(key = %key, "key in flight; marking dirty");
            inner.dirty.insert(key);
            return;
        }
        self.push(&mut inner, key);
    }

    /// Enqueue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
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

    /// Next key to process; `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return None;
                }
                if let Some(key) = inner.order.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    gauge!("workqueue_depth", inner.order.len() as f64);
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release `key` after processing; a dirty key goes straight back in.
    pub fn done(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        inner.processing.remove(key);
        if inner.dirty.remove(key) && !inner.shutdown && !inner.queued.contains(key) {
            self.push(&mut inner, key.clone());
        }
    }

    /// Count one more retry of `key` and return the new attempt number (1-based).
    pub fn next_attempt(&self, key: &ObjectKey) -> u32 {
        let mut inner = self.lock();
        let n = inner.attempts.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    /// Retries recorded for `key` since it last succeeded.
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().attempts.get(key).copied().unwrap_or(0)
    }

    /// Reset the retry count of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().attempts.remove(key);
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().shutdown }

    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn dropped(&self) -> u64 { self.lock().dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(n: &str) -> ObjectKey {
        ObjectKey::new("ns", n)
    }

    #[tokio::test]
    async fn duplicate_adds_coalesce() {
        let q = WorkQueue::with_capacity(8);
        q.add(k("a"));
        q.add(k("b"));
        q.add(k("a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some(k("a")));
        assert_eq!(q.get().await, Some(k("b")));
    }

    #[tokio::test]
    async fn in_flight_key_is_not_handed_out_twice() {
        let q = WorkQueue::with_capacity(8);
        q.add(k("a"));
        let got = q.get().await;
        assert_eq!(got, Some(k("a")));
        q.add(k("a"));
        assert!(q.is_empty(), "in-flight key must not be queued");
        q.done(&k("a"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(k("a")));
        q.done(&k("a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn capacity_drops_oldest() {
        let q = WorkQueue::with_capacity(2);
        q.add(k("a"));
        q.add(k("b"));
        q.add(k("c"));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.get().await, Some(k("b")));
        assert_eq!(q.get().await, Some(k("c")));
    }

    #[tokio::test]
    async fn shutdown_wakes_waiters() {
        let q = Arc::new(WorkQueue::with_capacity(4));
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("woke").expect("join");
        assert_eq!(got, None);
        q.add(k("late"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_after_delivers_later() {
        let q = Arc::new(WorkQueue::with_capacity(4));
        q.add_after(k("a"), Duration::from_millis(30));
        assert!(q.is_empty());
        let got = tokio::time::timeout(Duration::from_secs(1), q.get()).await.expect("delivered");
        assert_eq!(got, Some(k("a")));
    }

    #[tokio::test]
    async fn attempts_are_shared_by_every_handle() {
        let q = Arc::new(WorkQueue::with_capacity(4));
        let (a, b) = (Arc::clone(&q), Arc::clone(&q));
        assert_eq!(a.next_attempt(&k("x")), 1);
        assert_eq!(a.next_attempt(&k("x")), 2);
        assert_eq!(b.next_attempt(&k("x")), 3);
        assert_eq!(a.num_requeues(&k("y")), 0);
        b.forget(&k("x"));
        assert_eq!(a.num_requeues(&k("x")), 0);
        assert_eq!(a.next_attempt(&k("x")), 1);
    }
}
