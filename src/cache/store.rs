//! Single-flight get-or-compute cache

use super::stats::CacheStats;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of one computation, shared by every waiter
type Outcome<V, E> = Result<V, Arc<E>>;

/// Why `get_or_compute` did not return a value
#[derive(Error, Debug)]
pub enum CacheError<E> {
    /// The computation failed; every waiter of the attempt gets the same `Arc`
    #[error("{0}")]
    Compute(Arc<E>),

    /// This caller stopped waiting; the computation keeps running
    #[error("cancelled while waiting for the result")]
    Cancelled,

    /// The computation task ended without producing an outcome
    #[error("computation ended without producing a result")]
    Abandoned,
}

enum Slot<V, E> {
    Ready(V),
    Pending(watch::Receiver<Option<Outcome<V, E>>>),
}

struct Inner<K, V, E> {
    slots: Mutex<HashMap<K, Slot<V, E>>>,
    stats: Arc<CacheStats>,
}

/// Key/value cache that runs at most one computation per key at a time
///
/// Successful values are kept for the lifetime of the cache. Failures are
/// delivered to everyone waiting on that attempt and then forgotten, so the
/// next caller starts a fresh computation.
pub struct Cache<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for Cache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> Default for Cache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CacheStats::new())
    }
}

impl<K, V, E> Cache<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Send + Sync + 'static,
{
    /// Create an empty cache reporting into `stats`
    pub fn new(stats: Arc<CacheStats>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                stats,
            }),
        }
    }

    /// Counters this cache reports into
    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.inner.stats
    }

    /// Return the completed value for `key` without waiting or computing
    pub fn get(&self, key: &K) -> Option<V> {
        match self.inner.slots.lock().get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of completed entries
    pub fn len(&self) -> usize {
        self.inner
            .slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the value for `key`, computing it with `compute` if needed
    ///
    /// `compute` is only called when no value is cached and no computation
    /// for `key` is in flight. It runs on its own task, so cancelling `cancel`
    /// detaches this caller without aborting work other callers may be
    /// waiting on. Must be called from within a tokio runtime.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: K,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<V, CacheError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let stats = &self.inner.stats;

        let (receiver, sender) = {
            let mut slots = self.inner.slots.lock();
            match slots.get(&key) {
                Some(Slot::Ready(value)) => {
                    stats.record_hit();
                    return Ok(value.clone());
                }
                Some(Slot::Pending(receiver)) => {
                    stats.record_hit();
                    (receiver.clone(), None)
                }
                None => {
                    stats.record_miss();
                    stats.computation_started();
                    let (sender, receiver) = watch::channel(None);
                    slots.insert(key.clone(), Slot::Pending(receiver.clone()));
                    (receiver, Some(sender))
                }
            }
        };

        if let Some(sender) = sender {
            let flight = Flight {
                inner: Arc::clone(&self.inner),
                key,
                sender: Some(sender),
            };
            let work = compute();
            tokio::spawn(async move {
                let outcome = work.await;
                flight.complete(outcome);
            });
        }

        tokio::select! {
            biased;
            outcome = wait_for_outcome(receiver) => outcome,
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
        }
    }
}

async fn wait_for_outcome<V: Clone, E>(
    mut receiver: watch::Receiver<Option<Outcome<V, E>>>,
) -> Result<V, CacheError<E>> {
    let published = receiver.wait_for(Option::is_some).await;
    match published.as_deref() {
        Ok(Some(Ok(value))) => Ok(value.clone()),
        Ok(Some(Err(e))) => Err(CacheError::Compute(Arc::clone(e))),
        Ok(None) | Err(_) => Err(CacheError::Abandoned),
    }
}

/// Owner of one in-flight computation
///
/// Publishing the outcome and replacing the pending slot happen under the slot
/// lock, so a caller either joins the pending computation or sees its final
/// state. Dropping an unfinished flight evicts the pending slot.
struct Flight<K, V, E>
where
    K: Eq + Hash,
{
    inner: Arc<Inner<K, V, E>>,
    key: K,
    sender: Option<watch::Sender<Option<Outcome<V, E>>>>,
}

impl<K, V, E> Flight<K, V, E>
where
    K: Eq + Hash,
    V: Clone,
{
    fn complete(mut self, outcome: Result<V, E>) {
        let Some(sender) = self.sender.take() else {
            return;
        };
        let stats = &self.inner.stats;

        let mut slots = self.inner.slots.lock();
        let outcome = match outcome {
            Ok(value) => {
                if let Some(slot) = slots.get_mut(&self.key) {
                    *slot = Slot::Ready(value.clone());
                    stats.entry_added();
                }
                Ok(value)
            }
            Err(e) => {
                slots.remove(&self.key);
                debug!("computation failed, not caching");
                Err(Arc::new(e))
            }
        };
        stats.computation_finished();
        sender.send_replace(Some(outcome));
    }
}

impl<K, V, E> Drop for Flight<K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if self.sender.take().is_some() {
            self.inner.slots.lock().remove(&self.key);
            self.inner.stats.computation_finished();
            debug!("computation abandoned, pending entry evicted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    type TestCache = Cache<String, String, String>;

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = TestCache::default();
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            let value = cache
                .get_or_compute("k".to_string(), &token, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("v".to_string())
                })
                .await
                .unwrap();
            assert_eq!(value, "v");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = cache.stats().snapshot();
        assert_eq!((snap.misses, snap.hits, snap.entries, snap.in_flight), (1, 2, 1, 0));
        assert_eq!(cache.get(&"k".to_string()), Some("v".to_string()));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_computation() {
        let cache = TestCache::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_compute("k".to_string(), &token, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        release.notified().await;
                        Ok("shared".to_string())
                    })
                    .await
            }));
        }

        // Let every caller reach the pending entry before releasing
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let snap = cache.stats().snapshot();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.hits, 31);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn waiters_share_the_same_failure() {
        let cache = TestCache::default();
        let release = Arc::new(Notify::new());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let release = Arc::clone(&release);
            handles.push(tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_compute("k".to_string(), &token, move || async move {
                        release.notified().await;
                        Err("boom".to_string())
                    })
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_one();

        let mut errors = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Err(CacheError::Compute(e)) => errors.push(e),
                other => panic!("unexpected: {:?}", other.map_err(|e| e.to_string())),
            }
        }
        assert_eq!(*errors[0], "boom");
        assert!(errors.iter().all(|e| Arc::ptr_eq(e, &errors[0])));
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = TestCache::default();
        let token = CancellationToken::new();

        let first = cache
            .get_or_compute("k".to_string(), &token, || async { Err("boom".to_string()) })
            .await;
        assert!(matches!(first, Err(CacheError::Compute(_))));
        assert!(cache.is_empty());

        let second = cache
            .get_or_compute("k".to_string(), &token, || async { Ok("ok".to_string()) })
            .await
            .unwrap();
        assert_eq!(second, "ok");
        assert_eq!(cache.stats().snapshot().misses, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_caller_detaches_without_aborting() {
        let cache = TestCache::default();
        let release = Arc::new(Notify::new());
        let leaving = CancellationToken::new();

        let initiator = {
            let cache = cache.clone();
            let leaving = leaving.clone();
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_string(), &leaving, move || async move {
                        release.notified().await;
                        Ok("done".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let staying = {
            let cache = cache.clone();
            tokio::spawn(async move {
                let token = CancellationToken::new();
                cache
                    .get_or_compute("k".to_string(), &token, || async {
                        Ok("second computation".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leaving.cancel();
        assert!(matches!(initiator.await.unwrap(), Err(CacheError::Cancelled)));

        release.notify_one();
        assert_eq!(staying.await.unwrap().unwrap(), "done");
        assert_eq!(cache.get(&"k".to_string()), Some("done".to_string()));
    }

    #[tokio::test]
    async fn sole_waiter_cancel_still_populates_cache() {
        let cache = TestCache::default();
        let token = CancellationToken::new();
        token.cancel();

        let result = cache
            .get_or_compute("k".to_string(), &token, || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok("late".to_string())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Cancelled)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&"k".to_string()), Some("late".to_string()));
    }

    #[tokio::test]
    async fn panicking_computation_is_abandoned_and_evicted() {
        let cache = TestCache::default();
        let token = CancellationToken::new();

        let result = cache
            .get_or_compute("k".to_string(), &token, || async {
                if true {
                    panic!("resolver bug");
                }
                Ok(String::new())
            })
            .await;
        assert!(matches!(result, Err(CacheError::Abandoned)));
        assert_eq!(cache.stats().snapshot().in_flight, 0);

        let retry = cache
            .get_or_compute("k".to_string(), &token, || async { Ok("fine".to_string()) })
            .await
            .unwrap();
        assert_eq!(retry, "fine");
    }
}
