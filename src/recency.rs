use std::collections::BTreeMap;
use std::hash::Hash;

use ahash::HashMap;

/// Recency ranking for live entries.
///
/// Every touch hands the key a fresh stamp from a monotonic counter, and an
/// ordered map ranks keys by stamp, so the least recently used key is always
/// the first one. Stamps are never reused, which makes the order total:
/// entries loaded in the same instant still rank by arrival.
///
/// Entries here count one each; there is no weighting. `touch` doubles as
/// the insert operation, since inserting and promoting are the same
/// re-stamping step.
pub(crate) struct RecencyList<K: Eq + Hash + Clone> {
  by_stamp: BTreeMap<u64, K>,
  stamp_of: HashMap<K, u64>,
  clock: u64,
}

impl<K: Eq + Hash + Clone> RecencyList<K> {
  pub fn new() -> Self {
    Self {
      by_stamp: BTreeMap::new(),
      stamp_of: HashMap::default(),
      clock: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.stamp_of.len()
  }

  /// Marks `key` as the most recently used, inserting it if unknown.
  pub fn touch(&mut self, key: &K) {
    if let Some(stamp) = self.stamp_of.get(key) {
      self.by_stamp.remove(stamp);
    }
    self.clock += 1;
    self.by_stamp.insert(self.clock, key.clone());
    self.stamp_of.insert(key.clone(), self.clock);
  }

  /// Removes and returns the least recently used key.
  pub fn pop_oldest(&mut self) -> Option<K> {
    let (_, key) = self.by_stamp.pop_first()?;
    self.stamp_of.remove(&key);
    Some(key)
  }

  pub fn remove(&mut self, key: &K) -> bool {
    match self.stamp_of.remove(key) {
      Some(stamp) => {
        self.by_stamp.remove(&stamp);
        true
      }
      None => false,
    }
  }

  pub fn clear(&mut self) {
    self.by_stamp.clear();
    self.stamp_of.clear();
    self.clock = 0;
  }

  /// Keys from least to most recently used.
  #[cfg(test)]
  fn in_order(&self) -> Vec<K> {
    self.by_stamp.values().cloned().collect()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn pop_on_empty_returns_none() {
    let mut list = RecencyList::<u32>::new();
    assert_eq!(list.pop_oldest(), None);
    assert_eq!(list.len(), 0);
  }

  #[test]
  fn keys_pop_in_arrival_order_without_touches() {
    let mut list = RecencyList::new();
    for key in ["a", "b", "c"] {
      list.touch(&key);
    }
    assert_eq!(list.len(), 3);
    assert_eq!(list.pop_oldest(), Some("a"));
    assert_eq!(list.pop_oldest(), Some("b"));
    assert_eq!(list.pop_oldest(), Some("c"));
    assert_eq!(list.pop_oldest(), None);
  }

  #[test]
  fn touching_promotes_past_everything_else() {
    let mut list = RecencyList::new();
    for key in [1, 2, 3] {
      list.touch(&key);
    }
    list.touch(&1);
    assert_eq!(list.in_order(), vec![2, 3, 1]);
    assert_eq!(list.pop_oldest(), Some(2));
  }

  #[test]
  fn touching_the_newest_key_changes_nothing_observable() {
    let mut list = RecencyList::new();
    list.touch(&1);
    list.touch(&2);
    list.touch(&2);
    assert_eq!(list.len(), 2);
    assert_eq!(list.in_order(), vec![1, 2]);
  }

  #[test]
  fn re_touching_does_not_duplicate_a_key() {
    let mut list = RecencyList::new();
    list.touch(&9);
    list.touch(&9);
    list.touch(&9);
    assert_eq!(list.len(), 1);
    assert_eq!(list.pop_oldest(), Some(9));
    assert_eq!(list.pop_oldest(), None);
  }

  #[test]
  fn remove_reports_whether_the_key_was_known() {
    let mut list = RecencyList::new();
    list.touch(&1);
    list.touch(&2);
    list.touch(&3);
    assert!(list.remove(&2));
    assert!(!list.remove(&2));
    assert!(!list.remove(&42));
    assert_eq!(list.in_order(), vec![1, 3]);
    assert_eq!(list.len(), 2);
  }

  #[test]
  fn order_survives_interleaved_removals() {
    let mut list = RecencyList::new();
    for key in [1, 2, 3, 4] {
      list.touch(&key);
    }
    list.remove(&1);
    list.touch(&2);
    assert_eq!(list.in_order(), vec![3, 4, 2]);
  }

  #[test]
  fn clear_makes_the_list_reusable() {
    let mut list = RecencyList::new();
    list.touch(&1);
    list.touch(&2);
    list.clear();
    assert_eq!(list.len(), 0);
    assert_eq!(list.pop_oldest(), None);
    list.touch(&7);
    assert_eq!(list.pop_oldest(), Some(7));
  }
}
