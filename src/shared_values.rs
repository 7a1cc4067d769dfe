use crate::handle::{EntryHandle, EntryInner};
use crate::loader::{LoadState, WaitForLoad};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::runtime::{TaskSpawner, TokioSpawner};

use std::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use equivalent::Equivalent;
use parking_lot::Mutex;

/// The index never shrinks below this many buckets; below it the lower
/// load-factor bound is not enforced.
pub(crate) const MIN_BUCKETS: usize = 16;

/// A helper function to hash a key using a `BuildHasher`.
#[inline]
pub(crate) fn hash_key<K: Hash + ?Sized, H: BuildHasher>(hasher: &H, key: &K) -> u64 {
  let mut state = hasher.build_hasher();
  key.hash(&mut state);
  state.finish()
}

struct Slot<K, V> {
  hash: u64,
  entry: Arc<EntryInner<K, V>>,
}

/// The bucket index of resolved entries. Bucket count is a power of two so
/// addressing is a mask of the cached hash; the load factor is kept inside
/// (1/4, 3/4] by doubling after inserts and halving after removals.
pub(crate) struct Table<K, V> {
  buckets: Vec<Vec<Slot<K, V>>>,
  len: usize,
}

impl<K, V> Table<K, V> {
  pub(crate) fn new() -> Self {
    Self {
      buckets: (0..MIN_BUCKETS).map(|_| Vec::new()).collect(),
      len: 0,
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.len
  }

  pub(crate) fn buckets_count(&self) -> usize {
    self.buckets.len()
  }

  #[inline]
  fn bucket_of(&self, hash: u64) -> usize {
    hash as usize & (self.buckets.len() - 1)
  }

  /// The smallest power-of-two bucket count that keeps `len` entries inside
  /// the load-factor bounds.
  fn target_buckets(len: usize) -> usize {
    ((len * 4 + 2) / 3).next_power_of_two().max(MIN_BUCKETS)
  }

  fn resize_to(&mut self, new_count: usize) {
    if new_count == self.buckets.len() {
      return;
    }
    let old = std::mem::replace(
      &mut self.buckets,
      (0..new_count).map(|_| Vec::new()).collect(),
    );
    for slot in old.into_iter().flatten() {
      let index = slot.hash as usize & (new_count - 1);
      self.buckets[index].push(slot);
    }
  }

  fn grow_if_needed(&mut self) {
    if self.len * 4 > self.buckets.len() * 3 {
      self.resize_to(Self::target_buckets(self.len));
    }
  }

  fn shrink_if_needed(&mut self) {
    if self.buckets.len() > MIN_BUCKETS && self.len * 4 < self.buckets.len() {
      self.resize_to(Self::target_buckets(self.len));
    }
  }

  /// Recomputes the bucket count for the current size and relocates entries.
  pub(crate) fn rehash(&mut self) {
    self.resize_to(Self::target_buckets(self.len));
  }

  pub(crate) fn find<Q>(&self, hash: u64, key: &Q) -> Option<&Arc<EntryInner<K, V>>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    self.buckets[self.bucket_of(hash)]
      .iter()
      .find(|slot| slot.hash == hash && key.equivalent(&slot.entry.key))
      .map(|slot| &slot.entry)
  }

  fn find_slot_mut<Q>(&mut self, hash: u64, key: &Q) -> Option<&mut Slot<K, V>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let index = self.bucket_of(hash);
    self.buckets[index]
      .iter_mut()
      .find(|slot| slot.hash == hash && key.equivalent(&slot.entry.key))
  }

  pub(crate) fn insert(&mut self, entry: Arc<EntryInner<K, V>>) {
    let hash = entry.hash;
    let index = self.bucket_of(hash);
    self.buckets[index].push(Slot { hash, entry });
    self.len += 1;
    self.grow_if_needed();
  }

  pub(crate) fn remove<Q>(&mut self, hash: u64, key: &Q) -> Option<Arc<EntryInner<K, V>>>
  where
    Q: Equivalent<K> + ?Sized,
  {
    let index = self.bucket_of(hash);
    let position = self.buckets[index]
      .iter()
      .position(|slot| slot.hash == hash && key.equivalent(&slot.entry.key))?;
    let slot = self.buckets[index].swap_remove(position);
    self.len -= 1;
    self.shrink_if_needed();
    Some(slot.entry)
  }

  /// Removes the slot currently occupied by exactly this entry. A slot that
  /// has since been replaced (reload) or removed is left untouched.
  pub(crate) fn detach_entry(&mut self, entry: &Arc<EntryInner<K, V>>) -> bool {
    let index = self.bucket_of(entry.hash);
    let position = self.buckets[index]
      .iter()
      .position(|slot| Arc::ptr_eq(&slot.entry, entry));
    match position {
      Some(position) => {
        self.buckets[index].swap_remove(position);
        self.len -= 1;
        self.shrink_if_needed();
        true
      }
      None => false,
    }
  }

  /// Drops every entry for which `pred` returns false and returns how many
  /// were dropped.
  pub(crate) fn retain<F>(&mut self, mut pred: F) -> usize
  where
    F: FnMut(&K, &V) -> bool,
  {
    let before = self.len;
    for bucket in &mut self.buckets {
      bucket.retain(|slot| pred(&slot.entry.key, &slot.entry.value));
    }
    self.len = self.buckets.iter().map(Vec::len).sum();
    self.shrink_if_needed();
    before - self.len
  }
}

/// A keyed set of shared values with single-flight loading.
///
/// On a miss, `get_or_load` invokes the supplied loader; every concurrent
/// request for the same key coalesces onto that one load and resolves to the
/// same value. Resolved entries are owned collectively by their
/// [`EntryHandle`]s: the entry stays in the index until the last handle is
/// dropped. Load failures are propagated to all coalesced callers and are
/// never cached.
pub struct SharedValues<K, V, E, H = ahash::RandomState> {
  hasher: H,
  table: Arc<Mutex<Table<K, V>>>,
  pending: Arc<Mutex<HashMap<K, Arc<LoadState<K, V, E>>>>>,
  spawner: Arc<dyn TaskSpawner>,
  metrics: Arc<Metrics>,
}

impl<K, V, E, H> Clone for SharedValues<K, V, E, H>
where
  H: Clone,
{
  fn clone(&self) -> Self {
    Self {
      hasher: self.hasher.clone(),
      table: Arc::clone(&self.table),
      pending: Arc::clone(&self.pending),
      spawner: Arc::clone(&self.spawner),
      metrics: Arc::clone(&self.metrics),
    }
  }
}

impl<K, V, E, H> fmt::Debug for SharedValues<K, V, E, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let table = self.table.lock();
    f.debug_struct("SharedValues")
      .field("size", &table.len())
      .field("buckets", &table.buckets_count())
      .finish_non_exhaustive()
  }
}

impl<K, V, E> SharedValues<K, V, E, ahash::RandomState> {
  /// Creates an empty set using the default hasher and the current tokio
  /// runtime for load tasks. Panics outside of a tokio runtime context.
  pub fn new() -> Self {
    Self::with_parts(
      ahash::RandomState::new(),
      Arc::new(TokioSpawner::new()),
      Arc::new(Metrics::new()),
    )
  }
}

impl<K, V, E, H> SharedValues<K, V, E, H> {
  /// Creates an empty set with a caller-supplied hasher.
  pub fn with_hasher(hasher: H) -> Self {
    Self::with_parts(hasher, Arc::new(TokioSpawner::new()), Arc::new(Metrics::new()))
  }

  pub(crate) fn with_parts(
    hasher: H,
    spawner: Arc<dyn TaskSpawner>,
    metrics: Arc<Metrics>,
  ) -> Self {
    Self {
      hasher,
      table: Arc::new(Mutex::new(Table::new())),
      pending: Arc::new(Mutex::new(HashMap::new())),
      spawner,
      metrics,
    }
  }

  /// The number of resolved entries currently in the index.
  pub fn size(&self) -> usize {
    self.table.lock().len()
  }

  pub fn buckets_count(&self) -> usize {
    self.table.lock().buckets_count()
  }

  /// Rebalances the bucket array for the current size.
  pub fn rehash(&self) {
    self.table.lock().rehash();
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }
}

impl<K, V, E, H> SharedValues<K, V, E, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Clone + Send + 'static,
  H: BuildHasher,
{
  /// Returns a handle for `key`, loading the value if it is absent.
  ///
  /// If a load for the same key is already in flight, this call joins it
  /// instead of starting another; all coalesced callers resolve to the same
  /// outcome. The loader future is driven by a spawned task, so dropping
  /// the returned future abandons the result but never cancels the load.
  pub async fn get_or_load<F, Fut>(&self, key: K, load: F) -> Result<EntryHandle<K, V>, E>
  where
    F: FnOnce(K) -> Fut,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    let hash = hash_key(&self.hasher, &key);
    let (state, is_originator) = {
      let table = self.table.lock();
      if let Some(entry) = table.find(hash, &key) {
        entry.handles.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::clone(entry);
        return Ok(EntryHandle::from_parts(Arc::clone(&self.table), entry));
      }
      // Still holding the table lock: the pending map and the index must be
      // consulted as one step or a resolving load could slip between them.
      let mut pending = self.pending.lock();
      match pending.get(&key) {
        Some(existing) => (Arc::clone(existing), false),
        None => {
          let state = Arc::new(LoadState::new());
          pending.insert(key.clone(), Arc::clone(&state));
          (state, true)
        }
      }
    };

    if is_originator {
      let fut = load(key.clone());
      self.spawn_load(key, hash, Arc::clone(&state), fut);
    }
    WaitForLoad::new(state).await
  }

  fn spawn_load<Fut>(&self, key: K, hash: u64, state: Arc<LoadState<K, V, E>>, fut: Fut)
  where
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    let table = Arc::clone(&self.table);
    let pending = Arc::clone(&self.pending);
    let metrics = Arc::clone(&self.metrics);

    let task = async move {
      match fut.await {
        Ok(value) => {
          metrics.loads.fetch_add(1, Ordering::Relaxed);
          let entry = Arc::new(EntryInner {
            key: key.clone(),
            hash,
            value,
            handles: AtomicUsize::new(1),
          });
          {
            let mut table_guard = table.lock();
            table_guard.insert(Arc::clone(&entry));
            pending.lock().remove(&key);
          }
          // The handle held by the load state anchors the entry until the
          // last waiter has taken its own clone.
          state.complete(Ok(EntryHandle::from_parts(table, entry)));
        }
        Err(err) => {
          metrics.load_failures.fetch_add(1, Ordering::Relaxed);
          // The failed load is forgotten before waiters observe the error,
          // so the next request for this key starts a fresh attempt.
          pending.lock().remove(&key);
          state.complete(Err(err));
        }
      }
    };
    self.spawner.spawn(Box::pin(task));
  }
}

impl<K, V, E, H> SharedValues<K, V, E, H>
where
  K: Hash + Eq,
  H: BuildHasher,
{
  /// Returns a handle if `key` is resolved. Never loads.
  pub fn find<Q>(&self, key: &Q) -> Option<EntryHandle<K, V>>
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = hash_key(&self.hasher, key);
    let table = self.table.lock();
    let entry = table.find(hash, key)?;
    entry.handles.fetch_add(1, Ordering::Relaxed);
    let entry = Arc::clone(entry);
    drop(table);
    Some(EntryHandle::from_parts(Arc::clone(&self.table), entry))
  }

  /// Detaches `key` from the index. Outstanding handles keep the detached
  /// value alive; the index simply no longer knows it, so the next
  /// `get_or_load` starts fresh.
  pub fn remove<Q>(&self, key: &Q) -> bool
  where
    Q: Hash + Equivalent<K> + ?Sized,
  {
    let hash = hash_key(&self.hasher, key);
    self.table.lock().remove(hash, key).is_some()
  }

  /// Detaches every resolved entry matching `pred` and returns how many
  /// were detached. In-flight loads are not affected.
  pub fn remove_if<F>(&self, mut pred: F) -> usize
  where
    F: FnMut(&K, &V) -> bool,
  {
    self.table.lock().retain(|key, value| !pred(key, value))
  }

  /// Swaps the value resolved for `key` by installing a fresh entry in its
  /// place, returning a handle to it. Handles to the previous entry keep
  /// the value they were resolved with. Returns `None` when the key is not
  /// resolved (an in-flight load does not count).
  pub fn replace(&self, key: &K, value: V) -> Option<EntryHandle<K, V>>
  where
    K: Clone,
  {
    let hash = hash_key(&self.hasher, key);
    let mut table = self.table.lock();
    let slot = table.find_slot_mut(hash, key)?;
    let entry = Arc::new(EntryInner {
      key: key.clone(),
      hash,
      value,
      handles: AtomicUsize::new(1),
    });
    let displaced = std::mem::replace(&mut slot.entry, Arc::clone(&entry));
    drop(table);
    drop(displaced);
    Some(EntryHandle::from_parts(Arc::clone(&self.table), entry))
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn entry(key: u64) -> Arc<EntryInner<u64, u64>> {
    Arc::new(EntryInner {
      key,
      hash: key,
      value: key,
      handles: AtomicUsize::new(1),
    })
  }

  #[test]
  fn table_starts_at_minimum_buckets() {
    let table = Table::<u64, u64>::new();
    assert_eq!(table.buckets_count(), MIN_BUCKETS);
    assert_eq!(table.len(), 0);
  }

  #[test]
  fn table_grows_within_load_factor() {
    let mut table = Table::new();
    for key in 0..1000u64 {
      table.insert(entry(key));
      assert!(
        table.len() * 4 <= table.buckets_count() * 3,
        "load factor above 3/4 after {} inserts",
        key + 1
      );
    }
  }

  #[test]
  fn table_shrinks_within_load_factor() {
    let mut table = Table::new();
    for key in 0..1000u64 {
      table.insert(entry(key));
    }
    for key in 0..996u64 {
      assert!(table.remove(key, &key).is_some());
      if table.buckets_count() > MIN_BUCKETS {
        assert!(
          table.len() * 4 >= table.buckets_count(),
          "load factor below 1/4 after removing {} entries",
          key + 1
        );
      }
    }
  }

  #[test]
  fn detach_ignores_displaced_entries() {
    let mut table = Table::new();
    let first = entry(7);
    table.insert(Arc::clone(&first));

    // Replace the slot the way a reload would.
    let second = entry(7);
    table.remove(7, &7u64);
    table.insert(Arc::clone(&second));

    assert!(!table.detach_entry(&first), "stale entry must not detach");
    assert_eq!(table.len(), 1);
    assert!(table.detach_entry(&second));
    assert_eq!(table.len(), 0);
  }

  #[test]
  fn retain_reports_removed_count() {
    let mut table = Table::new();
    for key in 0..10u64 {
      table.insert(entry(key));
    }
    let removed = table.retain(|key, _| key % 2 == 0);
    assert_eq!(removed, 5);
    assert_eq!(table.len(), 5);
  }
}
