use crate::cache::LcIndex;
use crate::loader::LoaderFn;
use crate::metrics::Metrics;
use crate::runtime::TaskSpawner;
use crate::shared_values::SharedValues;

use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

/// Reports a failed reload to the log. Captured by the builder when reload
/// is enabled; only that configuration needs to render the error type.
pub(crate) type ReloadFailureHook<E> = Arc<dyn Fn(E) + Send + Sync>;

/// A context object holding the shared parts of the cache that the
/// maintenance task needs to access.
pub(crate) struct JanitorContext<K: Eq + Hash + Clone, V, E, H> {
  pub(crate) values: SharedValues<K, V, E, H>,
  pub(crate) index: Arc<Mutex<LcIndex<K, V>>>,
  pub(crate) metrics: Arc<Metrics>,
  pub(crate) time_to_live: Duration,
  pub(crate) refresh: Option<Duration>,
  pub(crate) loader: Option<LoaderFn<K, V, E>>,
  pub(crate) on_reload_failure: Option<ReloadFailureHook<E>>,
  pub(crate) spawner: Arc<dyn TaskSpawner>,
}

/// The background task responsible for periodic expiry and reload.
///
/// Each tick first evicts entries whose time-to-live has elapsed, then, when
/// reload is enabled, re-invokes the loader for entries due a refresh. The
/// task is spawned at construction and runs until stopped.
pub(crate) struct Janitor {
  stop_flag: Arc<AtomicBool>,
  wake: Arc<Notify>,
  done: oneshot::Receiver<()>,
}

impl Janitor {
  pub(crate) fn spawn<K, V, E, H>(context: JanitorContext<K, V, E, H>, tick_interval: Duration) -> Self
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + 'static,
    H: BuildHasher + Clone + Send + Sync + 'static,
  {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let wake = Arc::new(Notify::new());
    let (done_tx, done_rx) = oneshot::channel();

    let stop = Arc::clone(&stop_flag);
    let woken = Arc::clone(&wake);
    let spawner = Arc::clone(&context.spawner);

    let task = async move {
      loop {
        tokio::select! {
          _ = tokio::time::sleep(tick_interval) => {}
          _ = woken.notified() => {}
        }
        if stop.load(Ordering::Acquire) {
          break;
        }
        Self::tick(&context);
      }
      let _ = done_tx.send(());
    };
    spawner.spawn(Box::pin(task));

    Self {
      stop_flag,
      wake,
      done: done_rx,
    }
  }

  /// One maintenance pass. Victims and reload candidates are collected under
  /// the index lock and acted on afterwards; nothing is held across a
  /// suspension point.
  fn tick<K, V, E, H>(context: &JanitorContext<K, V, E, H>)
  where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + 'static,
    H: BuildHasher + Clone + Send + Sync + 'static,
  {
    let now = Instant::now();

    // Expiry comes first so an expired entry never survives on the strength
    // of its recency. Victims are removed from the recency list and detached
    // from the shared-values index before the lock is released.
    let expired = {
      let mut guard = context.index.lock();
      let index = &mut *guard;
      let mut victims = Vec::new();
      index.map.retain(|key, entry| {
        if now.duration_since(entry.loaded_at) > context.time_to_live {
          victims.push(key.clone());
          false
        } else {
          true
        }
      });
      for key in &victims {
        index.recency.remove(key);
        context.values.remove(key);
      }
      victims.len() as u64
    };
    if expired > 0 {
      context
        .metrics
        .evicted_by_ttl
        .fetch_add(expired, Ordering::Relaxed);
      tracing::debug!(count = expired, "evicted expired entries");
    }

    let (refresh, loader, on_failure) = match (
      context.refresh,
      &context.loader,
      &context.on_reload_failure,
    ) {
      (Some(refresh), Some(loader), Some(on_failure)) => (refresh, loader, on_failure),
      _ => return,
    };

    let mut due = Vec::new();
    {
      let guard = context.index.lock();
      for (key, entry) in guard.map.iter() {
        if now.duration_since(entry.loaded_at) >= refresh && !entry.reloading.load(Ordering::Acquire)
        {
          due.push((key.clone(), Arc::clone(&entry.reloading)));
        }
      }
    }

    for (key, reloading) in due {
      // A tick arriving while the previous reload of this entry is still in
      // flight is a no-op for it.
      if reloading.swap(true, Ordering::AcqRel) {
        continue;
      }
      let fut = loader(key.clone());
      let values = context.values.clone();
      let index = Arc::clone(&context.index);
      let metrics = Arc::clone(&context.metrics);
      let on_failure = Arc::clone(on_failure);

      context.spawner.spawn(Box::pin(async move {
        match fut.await {
          Ok(value) => {
            let mut guard = index.lock();
            match guard.map.get_mut(&key) {
              // Only refresh the entry generation this reload was scheduled
              // for; an entry evicted and re-loaded meanwhile is left alone.
              Some(entry) if Arc::ptr_eq(&entry.reloading, &reloading) => {
                if let Some(handle) = values.replace(&key, value) {
                  entry.handle = handle;
                  entry.loaded_at = Instant::now();
                  metrics.reloads.fetch_add(1, Ordering::Relaxed);
                }
              }
              _ => {}
            }
          }
          Err(err) => {
            metrics.reload_failures.fetch_add(1, Ordering::Relaxed);
            on_failure(err);
          }
        }
        reloading.store(false, Ordering::Release);
      }));
    }
  }

  /// Signals the task to stop and waits for it to exit.
  pub(crate) async fn stop(self) {
    self.stop_flag.store(true, Ordering::Release);
    self.wake.notify_one();
    let _ = self.done.await;
  }

  /// Signals the task to stop without waiting for it.
  pub(crate) fn request_stop(&self) {
    self.stop_flag.store(true, Ordering::Release);
    self.wake.notify_one();
  }
}
