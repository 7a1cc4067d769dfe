use crate::shared_values::Table;

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// The resolved record for one key: the key itself, its cached hash, the
/// immutable value and the number of outstanding handles.
pub(crate) struct EntryInner<K, V> {
  pub(crate) key: K,
  pub(crate) hash: u64,
  pub(crate) value: V,
  pub(crate) handles: AtomicUsize,
}

/// A reference-counted pointer to a cached value.
///
/// A handle grants shared read access to the value and anchors the entry in
/// the shared-values index: the entry stays resident for as long as at least
/// one handle to it exists. Cloning a handle is a lock-free counter bump;
/// dropping the last handle removes the entry from the index.
///
/// The value replacement performed by a background reload installs a fresh
/// entry under the same key, so handles obtained before the reload keep the
/// value they were resolved with.
pub struct EntryHandle<K, V> {
  table: Arc<Mutex<Table<K, V>>>,
  entry: Arc<EntryInner<K, V>>,
}

impl<K, V> EntryHandle<K, V> {
  /// Wraps an entry whose handle count already accounts for this handle.
  pub(crate) fn from_parts(table: Arc<Mutex<Table<K, V>>>, entry: Arc<EntryInner<K, V>>) -> Self {
    Self { table, entry }
  }

  /// The key this value was loaded for.
  pub fn key(&self) -> &K {
    &self.entry.key
  }

  /// The cached value.
  pub fn value(&self) -> &V {
    &self.entry.value
  }
}

impl<K, V> Deref for EntryHandle<K, V> {
  type Target = V;

  fn deref(&self) -> &V {
    &self.entry.value
  }
}

impl<K, V> Clone for EntryHandle<K, V> {
  fn clone(&self) -> Self {
    self.entry.handles.fetch_add(1, Ordering::Relaxed);
    Self {
      table: self.table.clone(),
      entry: self.entry.clone(),
    }
  }
}

impl<K, V> Drop for EntryHandle<K, V> {
  fn drop(&mut self) {
    if self.entry.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
      return;
    }
    // This was the last handle. A concurrent lookup may resurrect the entry
    // before we get the lock, so the count is re-checked under it.
    let mut table = self.table.lock();
    if self.entry.handles.load(Ordering::Acquire) == 0 {
      table.detach_entry(&self.entry);
    }
  }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for EntryHandle<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EntryHandle")
      .field("key", &self.entry.key)
      .field("value", &self.entry.value)
      .field("handles", &self.entry.handles.load(Ordering::Relaxed))
      .finish()
  }
}
