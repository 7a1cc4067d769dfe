use crate::cache::{CacheShared, LcIndex, LoadingCache};
use crate::error::BuildError;
use crate::janitor::{Janitor, JanitorContext, ReloadFailureHook};
use crate::loader::LoaderFn;
use crate::metrics::Metrics;
use crate::runtime::{TaskSpawner, TokioSpawner};
use crate::shared_values::SharedValues;

use core::fmt;
use std::future::Future;
use std::hash::{BuildHasher, Hash};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

/// A builder for [`LoadingCache`] instances.
///
/// The maximum size and the time-to-live are the two required parameters;
/// everything else has a sensible default. Configuring a [`refresh`]
/// interval enables background reload and requires a default [`loader`].
///
/// [`refresh`]: Self::refresh
/// [`loader`]: Self::loader
pub struct CacheBuilder<K, V, E, H = ahash::RandomState> {
  max_size: usize,
  time_to_live: Duration,
  refresh: Option<Duration>,
  loader: Option<LoaderFn<K, V, E>>,
  on_reload_failure: Option<ReloadFailureHook<E>>,
  hasher: H,
  spawner: Option<Arc<dyn TaskSpawner>>,
  janitor_tick_interval: Option<Duration>,
}

impl<K, V, E, H> fmt::Debug for CacheBuilder<K, V, E, H> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CacheBuilder")
      .field("max_size", &self.max_size)
      .field("time_to_live", &self.time_to_live)
      .field("refresh", &self.refresh)
      .field("has_loader", &self.loader.is_some())
      .finish_non_exhaustive()
  }
}

impl<K, V, E> CacheBuilder<K, V, E, ahash::RandomState> {
  /// Creates a builder for a cache holding at most `max_size` entries, each
  /// live for at most `time_to_live` from its last successful load.
  pub fn new(max_size: usize, time_to_live: Duration) -> Self {
    Self {
      max_size,
      time_to_live,
      refresh: None,
      loader: None,
      on_reload_failure: None,
      hasher: ahash::RandomState::new(),
      spawner: None,
      janitor_tick_interval: None,
    }
  }
}

impl<K, V, E, H> CacheBuilder<K, V, E, H> {
  /// Enables background reload: live entries older than `refresh` are
  /// re-fetched through the default loader. Must be strictly below the
  /// time-to-live.
  ///
  /// Failed reloads are logged and absorbed, which is why this is the one
  /// place the error type needs `Debug`.
  pub fn refresh(mut self, refresh: Duration) -> Self
  where
    E: fmt::Debug + 'static,
  {
    self.refresh = Some(refresh);
    self.on_reload_failure = Some(Arc::new(|err: E| {
      tracing::warn!(error = ?err, "reload failed; keeping the current value");
    }));
    self
  }

  /// Sets the default asynchronous loader, used by
  /// [`LoadingCache::get`] and by background reload.
  pub fn loader<F, Fut>(mut self, f: F) -> Self
  where
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<V, E>> + Send + 'static,
  {
    let loader =
      move |key: K| Box::pin(f(key)) as Pin<Box<dyn Future<Output = Result<V, E>> + Send>>;
    self.loader = Some(Arc::new(loader));
    self
  }

  /// Sets the hasher for the cache's indexes.
  pub fn hasher(mut self, hasher: H) -> Self {
    self.hasher = hasher;
    self
  }

  /// Sets the spawner used for load, reload and maintenance tasks. Defaults
  /// to the current tokio runtime.
  pub fn spawner(mut self, spawner: Arc<dyn TaskSpawner>) -> Self {
    self.spawner = Some(spawner);
    self
  }

  /// Sets the tick interval for the maintenance task.
  /// (Primarily for testing purposes.)
  #[doc(hidden)]
  pub fn janitor_tick_interval(mut self, duration: Duration) -> Self {
    self.janitor_tick_interval = Some(duration);
    self
  }
}

impl<K, V, E, H> CacheBuilder<K, V, E, H>
where
  K: Eq + Hash + Clone + Send + Sync + 'static,
  V: Send + Sync + 'static,
  E: Clone + Send + 'static,
  H: BuildHasher + Clone + Send + Sync + 'static,
{
  /// Builds the cache and spawns its maintenance task.
  pub fn build(self) -> Result<LoadingCache<K, V, E, H>, BuildError> {
    self.validate()?;

    let spawner = self
      .spawner
      .unwrap_or_else(|| Arc::new(TokioSpawner::new()));
    let metrics = Arc::new(Metrics::new());
    let values =
      SharedValues::with_parts(self.hasher, Arc::clone(&spawner), Arc::clone(&metrics));
    let index = Arc::new(Mutex::new(LcIndex::new()));

    // The maintenance cadence stays well below the shorter of the two
    // intervals so expiry and reload land close to their deadlines.
    let tick_interval = self.janitor_tick_interval.unwrap_or_else(|| {
      let base = match self.refresh {
        Some(refresh) => refresh.min(self.time_to_live),
        None => self.time_to_live,
      };
      (base / 4).max(Duration::from_millis(1))
    });

    let janitor = Janitor::spawn(
      JanitorContext {
        values: values.clone(),
        index: Arc::clone(&index),
        metrics: Arc::clone(&metrics),
        time_to_live: self.time_to_live,
        refresh: self.refresh,
        loader: self.loader.clone(),
        on_reload_failure: self.on_reload_failure,
        spawner: Arc::clone(&spawner),
      },
      tick_interval,
    );

    Ok(LoadingCache::from_shared(CacheShared {
      values,
      index,
      max_size: self.max_size,
      time_to_live: self.time_to_live,
      loader: self.loader,
      metrics,
      janitor: Mutex::new(Some(janitor)),
    }))
  }

  /// Validates the builder configuration.
  fn validate(&self) -> Result<(), BuildError> {
    if self.max_size == 0 {
      return Err(BuildError::ZeroMaxSize);
    }
    if self.time_to_live.is_zero() {
      return Err(BuildError::ZeroTimeToLive);
    }
    if let Some(refresh) = self.refresh {
      if self.loader.is_none() {
        return Err(BuildError::RefreshWithoutLoader);
      }
      if refresh >= self.time_to_live {
        return Err(BuildError::RefreshNotBelowTimeToLive);
      }
    }
    Ok(())
  }
}
