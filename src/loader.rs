use crate::handle::EntryHandle;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// The stored form of a default loader: an async function from a key to a
/// load result. Per-call loaders passed to `get_with` / `get_or_load` stay
/// generic; only the builder-configured loader is boxed.
pub(crate) type LoaderFn<K, V, E> =
  Arc<dyn Fn(K) -> Pin<Box<dyn Future<Output = Result<V, E>> + Send>> + Send + Sync>;

struct LoadInner<K, V, E> {
  result: Option<Result<EntryHandle<K, V>, E>>,
  waiters: Vec<Waker>,
}

/// The single-flight rendezvous for one in-flight load.
///
/// Every caller that arrives for a key while its load is in flight awaits
/// the same `LoadState`. On completion each waiter receives its own handle
/// (a clone of the one created by the load task) or a clone of the error.
/// The stored handle is released when the last waiter lets go of the state,
/// so a load whose callers all walked away still cleans up after itself.
pub(crate) struct LoadState<K, V, E> {
  inner: Mutex<LoadInner<K, V, E>>,
}

impl<K, V, E> LoadState<K, V, E> {
  pub(crate) fn new() -> Self {
    Self {
      inner: Mutex::new(LoadInner {
        result: None,
        waiters: Vec::new(),
      }),
    }
  }

  /// Completes the load, waking all waiters. Wakers are drained before the
  /// lock is released so a waiter polling concurrently either sees the
  /// result or gets woken.
  pub(crate) fn complete(&self, result: Result<EntryHandle<K, V>, E>) {
    let waiters = {
      let mut inner = self.inner.lock();
      inner.result = Some(result);
      std::mem::take(&mut inner.waiters)
    };
    for waiter in waiters {
      waiter.wake();
    }
  }
}

/// A future resolving to the outcome of an in-flight load. It can be
/// awaited by any number of tasks simultaneously.
pub(crate) struct WaitForLoad<K, V, E> {
  state: Arc<LoadState<K, V, E>>,
}

impl<K, V, E> WaitForLoad<K, V, E> {
  pub(crate) fn new(state: Arc<LoadState<K, V, E>>) -> Self {
    Self { state }
  }
}

impl<K, V, E: Clone> Future for WaitForLoad<K, V, E> {
  type Output = Result<EntryHandle<K, V>, E>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let mut inner = self.state.inner.lock();
    match &inner.result {
      Some(Ok(handle)) => Poll::Ready(Ok(handle.clone())),
      Some(Err(err)) => Poll::Ready(Err(err.clone())),
      None => {
        inner.waiters.push(cx.waker().clone());
        Poll::Pending
      }
    }
  }
}
