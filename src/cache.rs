use crate::handle::EntryHandle;
use crate::janitor::Janitor;
use crate::loader::LoaderFn;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::recency::RecencyList;
use crate::shared_values::SharedValues;

use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::HashMap;
use parking_lot::Mutex;

/// The cache's own record for one live entry. The handle anchors the value
/// in the shared-values index independently of any handles held by callers.
pub(crate) struct LcEntry<K, V> {
  pub(crate) handle: EntryHandle<K, V>,
  pub(crate) loaded_at: Instant,
  pub(crate) reloading: Arc<AtomicBool>,
}

/// The recency-ordered index of live entries.
pub(crate) struct LcIndex<K: Eq + Hash + Clone, V> {
  pub(crate) map: HashMap<K, LcEntry<K, V>>,
  pub(crate) recency: RecencyList<K>,
}

impl<K: Eq + Hash + Clone, V> LcIndex<K, V> {
  pub(crate) fn new() -> Self {
    Self {
      map: HashMap::default(),
      recency: RecencyList::new(),
    }
  }
}

pub(crate) struct CacheShared<K: Eq + Hash + Clone, V, E, H> {
  pub(crate) values: SharedValues<K, V, E, H>,
  pub(crate) index: Arc<Mutex<LcIndex<K, V>>>,
  pub(crate) max_size: usize,
  pub(crate) time_to_live: Duration,
  pub(crate) loader: Option<LoaderFn<K, V, E>>,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) janitor: Mutex<Option<Janitor>>,
}

impl<K: Eq + Hash + Clone, V, E, H> Drop for CacheShared<K, V, E, H> {
  fn drop(&mut self) {
    if let Some(janitor) = self.janitor.lock().take() {
      janitor.request_stop();
    }
  }
}

/// A bounded, expiring cache that loads values through a user-supplied
/// asynchronous loader.
///
/// Lookups for a missing key invoke the loader once, no matter how many
/// callers ask concurrently; everyone resolves to the same [`EntryHandle`].
/// Live entries are kept in least-recently-used order and evicted when the
/// cache grows past its maximum size or when their time-to-live elapses. A
/// background task owned by the cache performs the expiry sweep and, when a
/// refresh interval is configured, reloads live entries so they stay warm.
///
/// Build one with [`CacheBuilder`](crate::CacheBuilder).
pub struct LoadingCache<K: Eq + Hash + Clone, V, E, H = ahash::RandomState> {
  shared: Arc<CacheShared<K, V, E, H>>,
}

impl<K: Eq + Hash + Clone, V, E, H> LoadingCache<K, V, E, H> {
  pub(crate) fn from_shared(shared: CacheShared<K, V, E, H>) -> Self {
    Self {
      shared: Arc::new(shared),
    }
  }

  /// The number of live entries.
  pub fn size(&self) -> usize {
    self.shared.index.lock().map.len()
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.shared.metrics.snapshot()
  }

  /// Stops the maintenance task, waits for it to exit, and releases every
  /// handle the cache itself holds. Values pinned by handles given out to
  /// callers stay alive until those handles are dropped. Idempotent.
  pub async fn stop(&self) {
    let janitor = self.shared.janitor.lock().take();
    if let Some(janitor) = janitor {
      janitor.stop().await;
    }
    let mut guard = self.shared.index.lock();
    let index = &mut *guard;
    index.map.clear();
    index.recency.clear();
  }
}

impl<K, V, E, H> LoadingCache<K, V, E, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  /// Returns the live entry for `key`, if any. Never loads, never touches
  /// recency, and never returns an entry past its time-to-live.
  pub fn find(&self, key: &K) -> Option<EntryHandle<K, V>> {
    let guard = self.shared.index.lock();
    let entry = guard.map.get(key)?;
    if entry.loaded_at.elapsed() > self.shared.time_to_live {
      return None;
    }
    Some(entry.handle.clone())
  }

  /// Removes the live entry for `key`, if any. Handles held by callers keep
  /// the value alive, but a later lookup will load afresh.
  pub fn remove(&self, key: &K) -> bool {
    let mut guard = self.shared.index.lock();
    let index = &mut *guard;
    match index.map.remove(key) {
      Some(_entry) => {
        index.recency.remove(key);
        self.shared.values.remove(key);
        self.shared.metrics.invalidations.fetch_add(1, Ordering::Relaxed);
        true
      }
      None => false,
    }
  }

  /// Removes every live entry matching `pred` and returns how many were
  /// removed.
  pub fn remove_if<F>(&self, mut pred: F) -> usize
  where
    F: FnMut(&K, &V) -> bool,
  {
    let mut guard = self.shared.index.lock();
    let index = &mut *guard;
    let mut victims = Vec::new();
    index.map.retain(|key, entry| {
      if pred(key, entry.handle.value()) {
        victims.push(key.clone());
        false
      } else {
        true
      }
    });
    for key in &victims {
      index.recency.remove(key);
      self.shared.values.remove(key);
    }
    self
      .shared
      .metrics
      .invalidations
      .fetch_add(victims.len() as u64, Ordering::Relaxed);
    victims.len()
  }
}

impl<K, V, E, H> LoadingCache<K, V, E, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Clone + Send + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Returns a handle to the value for `key`, loading it with `load` on a
  /// miss.
  ///
  /// A hit refreshes the entry's recency. An entry past its time-to-live is
  /// evicted on the spot and treated as a miss. On a miss the load is
  /// single-flight: concurrent callers for the same key share one loader
  /// invocation. After the value is installed, least-recently-used entries
  /// are evicted until the cache is back within its maximum size.
  pub async fn get_with<F, Fut>(&self, key: K, load: F) -> Result<EntryHandle<K, V>, E>
  where
    F: FnOnce(K) -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    if let Some(handle) = self.lookup_live(&key) {
      return Ok(handle);
    }
    self.shared.metrics.misses.fetch_add(1, Ordering::Relaxed);
    let handle = self.shared.values.get_or_load(key.clone(), load).await?;
    self.install(key, handle.clone());
    Ok(handle)
  }

  /// Like [`get_with`](Self::get_with), using the loader configured on the
  /// builder.
  ///
  /// # Panics
  ///
  /// Panics if the cache was built without a default loader.
  pub async fn get(&self, key: K) -> Result<EntryHandle<K, V>, E> {
    let loader = self
      .shared
      .loader
      .clone()
      .expect("no default loader configured; use get_with or set one on the builder");
    self.get_with(key, move |key| loader(key)).await
  }

  /// Hit path: returns the handle and refreshes recency, evicting the entry
  /// instead when its time-to-live has elapsed.
  fn lookup_live(&self, key: &K) -> Option<EntryHandle<K, V>> {
    let mut guard = self.shared.index.lock();
    let index = &mut *guard;
    if let Some(entry) = index.map.get(key) {
      if entry.loaded_at.elapsed() <= self.shared.time_to_live {
        index.recency.touch(key);
        self.shared.metrics.hits.fetch_add(1, Ordering::Relaxed);
        return Some(entry.handle.clone());
      }
      // Expired on lookup: evict now rather than waiting for the janitor,
      // and detach from the shared-values index as well so a caller still
      // pinning the stale value cannot cause it to be served again.
      index.map.remove(key);
      index.recency.remove(key);
      self.shared.values.remove(key);
      self.shared.metrics.evicted_by_ttl.fetch_add(1, Ordering::Relaxed);
    }
    None
  }

  fn install(&self, key: K, handle: EntryHandle<K, V>) {
    let mut guard = self.shared.index.lock();
    let index = &mut *guard;
    match index.map.entry(key.clone()) {
      std::collections::hash_map::Entry::Occupied(_) => {
        // A coalesced caller installed this key first; refresh recency.
        index.recency.touch(&key);
      }
      std::collections::hash_map::Entry::Vacant(vacant) => {
        vacant.insert(LcEntry {
          handle,
          loaded_at: Instant::now(),
          reloading: Arc::new(AtomicBool::new(false)),
        });
        index.recency.touch(&key);
      }
    }

    // Expired entries are evicted ahead of live ones; clearing them may
    // already restore the cap.
    if index.map.len() > self.shared.max_size {
      let now = Instant::now();
      let ttl = self.shared.time_to_live;
      let mut stale = Vec::new();
      index.map.retain(|key, entry| {
        if now.duration_since(entry.loaded_at) > ttl {
          stale.push(key.clone());
          false
        } else {
          true
        }
      });
      for key in &stale {
        index.recency.remove(key);
        self.shared.values.remove(key);
      }
      self
        .shared
        .metrics
        .evicted_by_ttl
        .fetch_add(stale.len() as u64, Ordering::Relaxed);
    }

    // Eviction drops this cache's handle and detaches the victim from the
    // shared-values index in one step, so a load resolving for the victim
    // key afterwards cannot be clobbered by a late detach.
    while index.map.len() > self.shared.max_size {
      match index.recency.pop_oldest() {
        Some(victim) => {
          index.map.remove(&victim);
          self.shared.values.remove(&victim);
          self
            .shared
            .metrics
            .evicted_by_capacity
            .fetch_add(1, Ordering::Relaxed);
        }
        None => break,
      }
    }
    debug_assert_eq!(index.map.len(), index.recency.len());
  }
}

impl<K: Eq + Hash + Clone, V, E, H> fmt::Debug for LoadingCache<K, V, E, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LoadingCache")
      .field("size", &self.shared.index.lock().map.len())
      .field("max_size", &self.shared.max_size)
      .field("time_to_live", &self.shared.time_to_live)
      .finish_non_exhaustive()
  }
}
