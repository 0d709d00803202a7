//! Cache that serves the current value while a refresh runs in the background.
use std::{
    fmt::Debug,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::TryFutureExt;
use observability_deps::tracing::{debug, warn};

use crate::{
    interfaces::{ArcResult, DynError, EvictionPredicate},
    utils::{resolved, spawn_shared, try_resolved, CacheFut, CatchUnwindDynErrorExt},
};

/// One installed cache entry.
///
/// Publishing a refresh installs a new slot with a new generation and a fresh eviction latch.
#[derive(Debug)]
struct Slot<V> {
    gen: u64,

    /// Value that is served.
    current: CacheFut<V>,

    /// Refresh in flight, derived from `current`.
    refresh: Option<CacheFut<V>>,

    /// One-shot latch, only the first eviction attempt of this slot proceeds.
    evicted: Arc<AtomicBool>,
}

impl<V> Slot<V>
where
    V: Send + Sync + 'static,
{
    fn new(gen: u64, current: CacheFut<V>) -> Self {
        Self {
            gen,
            current,
            refresh: None,
            evicted: Default::default(),
        }
    }
}

/// What the fast path of [`StaleServingCache::get_if`] saw.
enum Observed<V> {
    Absent,
    Failed(u64),
    Stale(u64, Arc<V>),
}

/// Cache that serves the current value for a key while a refresh runs in the background.
///
/// Unlike [`SingleFlightCache`](crate::SingleFlightCache), a refresh never blocks callers that
/// are fine with the current value. Only callers that asked for the refresh wait for it.
///
/// # Failures
/// - **initial computation:** the entry is removed, the next call starts over.
/// - **refresh:** the stale value stays servable, unless the [`EvictionPredicate`] of the cache
///   says otherwise. Then the entry is evicted.
pub struct StaleServingCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    gen_counter: AtomicU64,
    cache: Arc<DashMap<K, Slot<V>>>,
    should_evict: EvictionPredicate,
}

impl<K, V> StaleServingCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create new, empty cache.
    pub fn new(should_evict: EvictionPredicate) -> Self {
        Self {
            gen_counter: AtomicU64::new(0),
            cache: Default::default(),
            should_evict,
        }
    }

    /// Get the current value, computing it if the key is unknown.
    ///
    /// If `force_refresh` is set and a value is cached, `f` is called with that value and the
    /// caller waits for the refresh. Concurrent forced callers join the same refresh.
    pub async fn get<F, Fut>(&self, k: &K, f: F, force_refresh: bool) -> ArcResult<V>
    where
        F: FnOnce(Option<Arc<V>>) -> Fut + Send,
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        self.get_if(k, f, |_| force_refresh).await
    }

    /// Same as [`get`](Self::get), but a refresh is only forced if `should_refresh` returns true
    /// for the cached value.
    ///
    /// A value that is still computing for the first time is never refreshed.
    pub async fn get_if<F, Fut, P>(&self, k: &K, f: F, should_refresh: P) -> ArcResult<V>
    where
        F: FnOnce(Option<Arc<V>>) -> Fut + Send,
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
        P: FnOnce(&V) -> bool + Send,
    {
        self.get_impl(k, f, should_refresh).await
    }

    fn get_impl<F, Fut, P>(&self, k: &K, f: F, should_refresh: P) -> CacheFut<V>
    where
        F: FnOnce(Option<Arc<V>>) -> Fut,
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
        P: FnOnce(&V) -> bool,
    {
        // try fast path
        let observed = match self.cache.get(k) {
            None => Observed::Absent,
            Some(slot) => match try_resolved(&slot.current) {
                None => return slot.current.clone(),
                Some(Ok(v)) => {
                    if !should_refresh(&*v) {
                        return slot.current.clone();
                    }
                    if let Some(refresh) = &slot.refresh {
                        return refresh.clone();
                    }
                    Observed::Stale(slot.gen, v)
                }
                Some(Err(_)) => Observed::Failed(slot.gen),
            },
        };

        // slow path
        match self.cache.entry(k.clone()) {
            Entry::Vacant(v) => {
                let slot = self.initial_slot(k, f(None));
                let fut = slot.current.clone();
                v.insert(slot);
                fut
            }
            Entry::Occupied(mut o) => {
                let slot = o.get_mut();
                match observed {
                    Observed::Stale(gen, base) if slot.gen == gen => {
                        if let Some(refresh) = &slot.refresh {
                            // another forced caller was faster
                            return refresh.clone();
                        }

                        let refresh = self.spawn_refresh(k, slot, f(Some(base)));
                        slot.refresh = Some(refresh.clone());
                        refresh
                    }
                    Observed::Failed(gen) if slot.gen == gen => {
                        *slot = self.initial_slot(k, f(None));
                        slot.current.clone()
                    }
                    _ => {
                        // race, entry was created or replaced in the meantime, serve that one
                        slot.current.clone()
                    }
                }
            }
        }
    }

    fn next_gen(&self) -> u64 {
        self.gen_counter.fetch_add(1, Ordering::Relaxed)
    }

    fn initial_slot<Fut>(&self, k: &K, fut: Fut) -> Slot<V>
    where
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        let gen = self.next_gen();
        let key = k.clone();
        let cache = Arc::downgrade(&self.cache);

        let fut = async move {
            let res = fut.map_ok(Arc::new).catch_unwind_dyn_error().await;

            if let Err(e) = &res {
                if let Some(cache) = cache.upgrade() {
                    if cache.remove_if(&key, |_k, slot| slot.gen == gen).is_some() {
                        debug!(gen, error = %e, "initial computation failed, entry removed");
                    }
                }
            }

            res
        };

        Slot::new(gen, spawn_shared(fut))
    }

    fn spawn_refresh<Fut>(&self, k: &K, base: &Slot<V>, fut: Fut) -> CacheFut<V>
    where
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        let base_gen = base.gen;
        let new_gen = self.next_gen();
        let latch = Arc::clone(&base.evicted);
        let key = k.clone();
        let cache = Arc::downgrade(&self.cache);
        let should_evict = Arc::clone(&self.should_evict);
        debug!(base_gen, new_gen, "starting background refresh");

        spawn_shared(async move {
            let res = fut.map_ok(Arc::new).catch_unwind_dyn_error().await;
            let Some(cache) = cache.upgrade() else {
                return res;
            };

            match &res {
                Ok(v) => {
                    if let Some(mut slot) = cache.get_mut(&key) {
                        if slot.gen == base_gen {
                            *slot = Slot::new(new_gen, resolved(Ok(Arc::clone(v))));
                            debug!(base_gen, new_gen, "published refreshed value");
                        }
                    }
                }
                Err(e) if should_evict(e) => {
                    if evict(&cache, &key, base_gen, &latch) {
                        warn!(gen = base_gen, error = %e, "refresh failed, entry evicted");
                    }
                }
                Err(e) => {
                    if let Some(mut slot) = cache.get_mut(&key) {
                        if slot.gen == base_gen {
                            slot.refresh = None;
                        }
                    }
                    warn!(gen = base_gen, error = %e, "refresh failed, serving stale value");
                }
            }

            res
        })
    }

    /// Install a computed value, replacing whatever was cached.
    ///
    /// A refresh that is still running for the replaced value is not published.
    pub fn set(&self, k: K, v: Arc<V>) {
        let slot = Slot::new(self.next_gen(), resolved(Ok(v)));
        self.cache.insert(k, slot);
    }

    /// Evict the entry if it still serves `observed` (the same allocation).
    ///
    /// Of all concurrent calls for the same entry only the first one evicts. Returns true if this
    /// call removed the entry.
    pub fn invalidate(&self, k: &K, observed: &Arc<V>) -> bool {
        let (gen, latch) = {
            let Some(slot) = self.cache.get(k) else {
                return false;
            };
            match try_resolved(&slot.current) {
                Some(Ok(v)) if Arc::ptr_eq(&v, observed) => (slot.gen, Arc::clone(&slot.evicted)),
                _ => return false,
            }
        };

        let evicted = evict(&self.cache, k, gen, &latch);
        if evicted {
            debug!(gen, "entry invalidated");
        }
        evicted
    }

    /// Get the served value or error and return `None` if was not cached.
    ///
    /// Entries that are computing for the first time also result in `None`.
    pub fn peek(&self, k: &K) -> Option<ArcResult<V>> {
        self.cache
            .get(k)
            .map(|slot| slot.current.clone())
            .and_then(|fut| try_resolved(&fut))
    }

    /// Remove entry. Returns true if there was one.
    pub fn remove(&self, k: &K) -> bool {
        self.cache.remove(k).is_some()
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Get number of entries in the cache.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Return true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Remove the slot `gen` unless some other caller already evicted it.
fn evict<K, V>(cache: &DashMap<K, Slot<V>>, k: &K, gen: u64, latch: &AtomicBool) -> bool
where
    K: Eq + Hash,
{
    if latch.swap(true, Ordering::SeqCst) {
        return false;
    }
    cache.remove_if(k, |_k, slot| slot.gen == gen).is_some()
}

impl<K, V> Default for StaleServingCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Arc::new(|_e: &DynError| false))
    }
}

impl<K, V> Debug for StaleServingCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaleServingCache")
            .field("gen_counter", &self.gen_counter)
            .field("len", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use futures::{future::BoxFuture, FutureExt};
    use tokio::sync::Barrier;

    use futures_test_utils::{assert_converge_eq, AssertFutureExt};

    use crate::utils::str_err;

    use super::*;

    #[tokio::test]
    async fn test_happy_path() {
        let cache = TestCache::default();

        let res = cache
            .get(
                &"k1",
                |prev| {
                    assert!(prev.is_none());
                    value(1)
                },
                false,
            )
            .await;
        assert_eq!(res.unwrap(), Arc::new(1));
        assert_eq!(cache.len(), 1);

        let res = cache.get(&"k1", |_| value(2), false).await;
        assert_eq!(res.unwrap(), Arc::new(1));
    }

    #[tokio::test]
    async fn test_forced_refresh_sees_current_value() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));

        let res = cache
            .get(
                &"k1",
                |prev| {
                    assert_eq!(prev, Some(Arc::new(1)));
                    value(2)
                },
                true,
            )
            .await;
        assert_eq!(res.unwrap(), Arc::new(2));
        assert_eq!(*cache.peek(&"k1").unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_serves_stale_value_while_refreshing() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));

        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let calls_captured = Arc::clone(&calls);
        let mut fut_refresh = std::pin::pin!(cache.get(
            &"k1",
            move |_prev| {
                calls_captured.fetch_add(1, Ordering::SeqCst);
                async move {
                    barrier_captured.wait().await;
                    Ok(2)
                }
                .boxed()
            },
            true,
        ));
        fut_refresh.assert_pending().await;

        // does not block
        let res = cache.get(&"k1", |_| value(3), false).with_timeout().await;
        assert_eq!(res.unwrap(), Arc::new(1));

        // joins the running refresh
        let calls_captured = Arc::clone(&calls);
        let mut fut_joined = std::pin::pin!(cache.get(
            &"k1",
            move |_prev| {
                calls_captured.fetch_add(1, Ordering::SeqCst);
                value(4)
            },
            true,
        ));
        fut_joined.assert_pending().await;

        let (_, res_refresh, res_joined) = tokio::join!(barrier.wait(), fut_refresh, fut_joined);
        assert_eq!(res_refresh.unwrap(), Arc::new(2));
        assert_eq!(res_joined.unwrap(), Arc::new(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*cache.peek(&"k1").unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_if() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));

        let res = cache
            .get_if(&"k1", |_| value(2), |current| *current == 5)
            .await;
        assert_eq!(res.unwrap(), Arc::new(1));

        let res = cache
            .get_if(&"k1", |_| value(2), |current| *current == 1)
            .await;
        assert_eq!(res.unwrap(), Arc::new(2));
    }

    #[tokio::test]
    async fn test_first_computation_is_not_refreshed() {
        let cache = TestCache::default();

        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let mut fut_1 = std::pin::pin!(cache.get(
            &"k1",
            move |_prev| async move {
                barrier_captured.wait().await;
                Ok(1)
            }
            .boxed(),
            false,
        ));
        fut_1.assert_pending().await;

        let mut fut_2 = std::pin::pin!(cache.get(&"k1", |_| value(2), true));
        fut_2.assert_pending().await;

        let (_, res_1, res_2) = tokio::join!(barrier.wait(), fut_1, fut_2);
        assert_eq!(res_1.unwrap(), Arc::new(1));
        assert_eq!(res_2.unwrap(), Arc::new(1));
    }

    #[tokio::test]
    async fn test_initial_failure_removes_entry() {
        let cache = TestCache::default();

        let res = cache.get(&"k1", |_| error("my error"), false).await;
        assert_eq!(res.unwrap_err().to_string(), "my error");
        assert!(cache.is_empty());

        let res = cache
            .get(&"k1", |_| async move { panic!("foo") }.boxed(), false)
            .await;
        assert_eq!(res.unwrap_err().to_string(), "panic: foo");
        assert!(cache.is_empty());

        let res = cache.get(&"k1", |_| value(1), false).await;
        assert_eq!(res.unwrap(), Arc::new(1));
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_stale_value() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));

        let res = cache.get(&"k1", |_| error("my error"), true).await;
        assert_eq!(res.unwrap_err().to_string(), "my error");
        assert_eq!(*cache.peek(&"k1").unwrap().unwrap(), 1);

        // the failed refresh does not block the next one
        let res = cache.get(&"k1", |_| value(2), true).await;
        assert_eq!(res.unwrap(), Arc::new(2));
    }

    #[tokio::test]
    async fn test_refresh_failure_evicts() {
        let cache = TestCache::new(Arc::new(|e: &DynError| e.to_string() == "gone"));
        cache.set("k1", Arc::new(1));

        let res = cache.get(&"k1", |_| error("gone"), true).await;
        assert_eq!(res.unwrap_err().to_string(), "gone");
        assert!(cache.peek(&"k1").is_none());
        assert!(cache.is_empty());

        let res = cache
            .get(
                &"k1",
                |prev| {
                    assert!(prev.is_none());
                    value(2)
                },
                false,
            )
            .await;
        assert_eq!(res.unwrap(), Arc::new(2));
    }

    #[tokio::test]
    async fn test_refresh_does_not_clobber_set() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));

        let barrier = Arc::new(Barrier::new(2));
        let barrier_captured = Arc::clone(&barrier);
        let mut fut = std::pin::pin!(cache.get(
            &"k1",
            move |_prev| async move {
                barrier_captured.wait().await;
                Ok(2)
            }
            .boxed(),
            true,
        ));
        fut.assert_pending().await;

        cache.set("k1", Arc::new(3));

        let (_, res) = tokio::join!(barrier.wait(), fut);
        assert_eq!(res.unwrap(), Arc::new(2));
        assert_eq!(*cache.peek(&"k1").unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));
        let v = cache.peek(&"k1").unwrap().unwrap();

        // same value, different allocation
        assert!(!cache.invalidate(&"k1", &Arc::new(1)));
        assert!(!cache.invalidate(&"k2", &v));

        assert!(cache.invalidate(&"k1", &v));
        assert!(!cache.invalidate(&"k1", &v));
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_invalidation_evicts_once() {
        const N: usize = 16;

        let cache = Arc::new(TestCache::default());
        cache.set("k1", Arc::new(1));
        let v = cache.peek(&"k1").unwrap().unwrap();
        let barrier = Arc::new(Barrier::new(N));

        let handles = (0..N)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let v = Arc::clone(&v);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    cache.invalidate(&"k1", &v)
                })
            })
            .collect::<Vec<_>>();

        let mut evicted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                evicted += 1;
            }
        }
        assert_eq!(evicted, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_does_not_remove_newer_entry() {
        let cache = TestCache::default();
        cache.set("k1", Arc::new(1));
        let v1 = cache.peek(&"k1").unwrap().unwrap();

        let res = cache.get(&"k1", |_| value(2), true).await;
        assert_eq!(res.unwrap(), Arc::new(2));

        assert!(!cache.invalidate(&"k1", &v1));
        assert_eq!(*cache.peek(&"k1").unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_computation_survives_dropped_caller() {
        let cache = TestCache::default();

        let barrier = Arc::new(Barrier::new(2));
        {
            let barrier_captured = Arc::clone(&barrier);
            let mut fut = std::pin::pin!(cache.get(
                &"k1",
                move |_prev| async move {
                    barrier_captured.wait().await;
                    Ok(1)
                }
                .boxed(),
                false,
            ));
            fut.assert_pending().await;
        }

        barrier.wait().with_timeout().await;
        assert_converge_eq(|| cache.peek(&"k1").is_some(), true).await;
    }

    #[tokio::test]
    async fn test_set_remove_clear() {
        let cache = TestCache::default();
        assert!(cache.is_empty());

        cache.set("k1", Arc::new(1));
        cache.set("k2", Arc::new(2));
        assert_eq!(cache.len(), 2);

        assert!(cache.remove(&"k1"));
        assert!(!cache.remove(&"k1"));
        assert!(cache.peek(&"k1").is_none());

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(
            format!("{cache:?}"),
            "StaleServingCache { gen_counter: 2, len: 0, .. }"
        );
    }

    type TestCache = StaleServingCache<&'static str, usize>;

    fn value(v: usize) -> BoxFuture<'static, Result<usize, DynError>> {
        async move { Ok(v) }.boxed()
    }

    fn error(msg: &'static str) -> BoxFuture<'static, Result<usize, DynError>> {
        async move { Err(str_err(msg)) }.boxed()
    }
}
