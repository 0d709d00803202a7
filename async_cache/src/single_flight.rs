//! Cache that runs at most one computation per key at a time.
use std::{
    fmt::Debug,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::TryFutureExt;
use observability_deps::tracing::debug;

use crate::{
    interfaces::{ArcResult, DynError, EvictionPredicate},
    utils::{resolved, spawn_shared, try_resolved, CacheFut},
};

/// State that provides more information about [`get`](SingleFlightCache::get).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheState {
    /// Entry was already part of the cache and fully computed.
    WasCached,

    /// Entry was already part of the cache but did not finish computing.
    AlreadyLoading,

    /// A new entry was created.
    NewEntry,

    /// An obsolete or failed entry was replaced by a new computation.
    Replaced,
}

/// Decides if two values are the same.
pub type Comparator<V> = Arc<dyn Fn(&V, &V) -> bool + Send + Sync>;

#[derive(Debug)]
struct CacheEntry<V> {
    gen: u64,
    fut: CacheFut<V>,
}

/// Return type of [`SingleFlightCache::get_impl`].
enum GetRes<V> {
    /// Entry created or replaced by this call.
    Installed(CacheFut<V>, CacheState),

    /// Known entry, may or may not be computed.
    Known(CacheFut<V>),
}

/// Cache that maps a key to a failable value future.
///
/// For every key there is at most one computation in flight. Concurrent callers share it.
///
/// A caller that believes a cached value is obsolete passes it as hint to [`get`](Self::get). The
/// cached value is replaced if it equals the hint, according to the comparator of the cache. A
/// value that differs from the hint was already refreshed by someone else and is returned as is.
///
/// Every caller that joined a failed computation sees the same error. Afterwards the entry is
/// evicted if the [`EvictionPredicate`] of the cache matches the error, otherwise it stays until
/// the next [`get`](Self::get) replaces it.
pub struct SingleFlightCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    gen_counter: AtomicU64,
    cache: Arc<DashMap<K, CacheEntry<V>>>,
    is_same: Comparator<V>,
    should_evict: EvictionPredicate,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Create new, empty cache that compares values using `is_same`.
    ///
    /// Failed entries are never evicted, see [`with_eviction`](Self::with_eviction).
    pub fn new(is_same: Comparator<V>) -> Self {
        Self {
            gen_counter: AtomicU64::new(0),
            cache: Default::default(),
            is_same,
            should_evict: Arc::new(|_e: &DynError| false),
        }
    }

    /// Evict entries whose computation failed with an error matching `should_evict`.
    pub fn with_eviction(self, should_evict: EvictionPredicate) -> Self {
        Self {
            should_evict,
            ..self
        }
    }

    /// Get an existing value or start a new computation.
    ///
    /// If `obsolete` is given and the cached value is the same, a new computation replaces the
    /// cached one. The computation is driven by a background tokio task and makes progress even
    /// if the returned future is dropped.
    ///
    /// `f` is called at most once, and only if this call installs a new entry.
    pub async fn get<F, Fut>(&self, k: &K, obsolete: Option<&V>, f: F) -> (ArcResult<V>, CacheState)
    where
        F: FnOnce(&K) -> Fut + Send,
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        match self.get_impl(k, obsolete, f) {
            GetRes::Installed(fut, state) => (fut.await, state),
            GetRes::Known(fut) => match try_resolved(&fut) {
                None => (fut.await, CacheState::AlreadyLoading),
                Some(res) => (res, CacheState::WasCached),
            },
        }
    }

    fn get_impl<F, Fut>(&self, k: &K, obsolete: Option<&V>, f: F) -> GetRes<V>
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        // try fast path
        let observed_gen = match self.cache.get(k) {
            None => None,
            Some(entry) => match try_resolved(&entry.fut) {
                None => return GetRes::Known(entry.fut.clone()),
                Some(Ok(v)) if !obsolete.is_some_and(|o| (self.is_same)(&*v, o)) => {
                    return GetRes::Known(entry.fut.clone());
                }
                // obsolete or failed
                Some(_) => Some(entry.gen),
            },
        };

        // slow path
        match self.cache.entry(k.clone()) {
            Entry::Vacant(v) => {
                let entry = self.new_entry(k, f(k));
                let fut = entry.fut.clone();
                v.insert(entry);
                GetRes::Installed(fut, CacheState::NewEntry)
            }
            Entry::Occupied(mut o) => match observed_gen {
                Some(gen) if o.get().gen == gen => {
                    let entry = self.new_entry(k, f(k));
                    let fut = entry.fut.clone();
                    debug!(old_gen = gen, new_gen = entry.gen, "replacing cache entry");
                    o.insert(entry);
                    GetRes::Installed(fut, CacheState::Replaced)
                }
                _ => {
                    // race, entry was created or replaced in the meantime, use that one
                    GetRes::Known(o.get().fut.clone())
                }
            },
        }
    }

    fn new_entry<Fut>(&self, k: &K, fut: Fut) -> CacheEntry<V>
    where
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        let gen = self.gen_counter.fetch_add(1, Ordering::Relaxed);
        let key = k.clone();
        let cache = Arc::downgrade(&self.cache);
        let should_evict = Arc::clone(&self.should_evict);

        let fut = async move {
            let res = fut.map_ok(Arc::new).await;

            if let Err(e) = &res {
                if should_evict(e) {
                    if let Some(cache) = cache.upgrade() {
                        if cache.remove_if(&key, |_k, entry| entry.gen == gen).is_some() {
                            debug!(gen, error = %e, "computation failed, entry evicted");
                        }
                    }
                }
            }

            res
        };

        CacheEntry {
            gen,
            fut: spawn_shared(fut),
        }
    }

    /// Start a background computation for an entry that already finished.
    ///
    /// Does nothing if the key is unknown or still computing. Returns true if a computation was
    /// started.
    pub fn refresh<F, Fut>(&self, k: &K, f: F) -> bool
    where
        F: FnOnce(&K) -> Fut,
        Fut: Future<Output = Result<V, DynError>> + Send + 'static,
    {
        match self.cache.entry(k.clone()) {
            Entry::Occupied(mut o) if try_resolved(&o.get().fut).is_some() => {
                let entry = self.new_entry(k, f(k));
                debug!(new_gen = entry.gen, "refreshing cache entry");
                o.insert(entry);
                true
            }
            _ => false,
        }
    }

    /// Install a computed value, replacing whatever was cached.
    pub fn set(&self, k: K, v: Arc<V>) {
        let entry = CacheEntry {
            gen: self.gen_counter.fetch_add(1, Ordering::Relaxed),
            fut: resolved(Ok(v)),
        };
        self.cache.insert(k, entry);
    }

    /// Get the cached value or error and return `None` if was not cached.
    ///
    /// Entries that are currently computing also result in `None`.
    pub fn peek(&self, k: &K) -> Option<ArcResult<V>> {
        self.cache
            .get(k)
            .map(|entry| entry.fut.clone())
            .and_then(|fut| try_resolved(&fut))
    }

    /// Remove entry. Returns true if there was one.
    ///
    /// A computation that is still running finishes, but its result is not cached.
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

impl<K, V> Default for SingleFlightCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: PartialEq + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(Arc::new(|a: &V, b: &V| a == b))
    }
}

impl<K, V> Debug for SingleFlightCache<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightCache")
            .field("gen_counter", &self.gen_counter)
            .field("len", &self.cache.len())
            .finish_non_exhaustive()
    }
}
