use shoal::{BuildError, CacheBuilder};

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Instant;

use tokio::time::{sleep, Duration};

const NUM_LOADERS: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
struct LoadError(&'static str);

fn counting_loader(
  load_count: &Arc<AtomicUsize>,
) -> impl Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<String, LoadError>> + Send>>
     + Send
     + Sync
     + 'static {
  let load_count = load_count.clone();
  move |key: u64| {
    let load_count = load_count.clone();
    Box::pin(async move {
      load_count.fetch_add(1, Ordering::SeqCst);
      Ok(format!("value-{key}"))
    })
  }
}

#[tokio::test]
async fn concurrent_gets_for_one_key_load_once() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = Arc::new(
    CacheBuilder::<u64, String, LoadError>::new(NUM_LOADERS, Duration::from_secs(1))
      .build()
      .unwrap(),
  );

  let mut tasks = Vec::with_capacity(NUM_LOADERS);
  for _ in 0..NUM_LOADERS {
    let cache = cache.clone();
    let load_count = load_count.clone();
    tasks.push(tokio::spawn(async move {
      let handle = cache
        .get_with(0, move |key| async move {
          sleep(Duration::from_millis(20)).await;
          load_count.fetch_add(1, Ordering::SeqCst);
          Ok(format!("value-{key}"))
        })
        .await
        .unwrap();
      assert_eq!(*handle, "value-0");
    }));
  }
  for task in tasks {
    task.await.unwrap();
  }

  assert_eq!(load_count.load(Ordering::SeqCst), 1);
  assert_eq!(cache.size(), 1);
  cache.stop().await;
}

#[tokio::test]
async fn concurrent_gets_for_distinct_keys_load_each() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = Arc::new(
    CacheBuilder::<u64, String, LoadError>::new(NUM_LOADERS, Duration::from_secs(1))
      .build()
      .unwrap(),
  );

  let mut tasks = Vec::with_capacity(NUM_LOADERS);
  for key in 0..NUM_LOADERS as u64 {
    let cache = cache.clone();
    let load_count = load_count.clone();
    tasks.push(tokio::spawn(async move {
      cache
        .get_with(key, move |key| async move {
          load_count.fetch_add(1, Ordering::SeqCst);
          Ok(format!("value-{key}"))
        })
        .await
        .unwrap();
    }));
  }
  for task in tasks {
    task.await.unwrap();
  }

  assert_eq!(load_count.load(Ordering::SeqCst), NUM_LOADERS);
  assert_eq!(cache.size(), NUM_LOADERS);
  cache.stop().await;
}

#[tokio::test]
async fn entries_expire_after_their_time_to_live() {
  let cache = CacheBuilder::<u64, String, LoadError>::new(NUM_LOADERS, Duration::from_millis(20))
    .build()
    .unwrap();

  cache
    .get_with(0, |key| async move { Ok(format!("value-{key}")) })
    .await
    .unwrap();
  assert!(cache.find(&0).is_some());

  // Timers get delayed sometimes, so poll with generous retries.
  let mut gone = false;
  for _ in 0..10 {
    sleep(Duration::from_millis(40)).await;
    if cache.find(&0).is_none() {
      gone = true;
      break;
    }
  }
  assert!(gone, "entry must expire once its time-to-live elapses");
  cache.stop().await;
}

#[tokio::test]
async fn reload_refreshes_live_entries() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::<u64, String, LoadError>::new(NUM_LOADERS, Duration::from_millis(100))
    .refresh(Duration::from_millis(20))
    .loader(counting_loader(&load_count))
    .build()
    .unwrap();

  cache.get(0).await.unwrap();
  sleep(Duration::from_millis(60)).await;

  let loads = load_count.load(Ordering::SeqCst);
  assert!(loads >= 2, "expected at least one reload, saw {loads} loads");
  cache.stop().await;
}

#[tokio::test]
async fn reload_failures_keep_the_current_value() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();

  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = {
    let load_count = load_count.clone();
    CacheBuilder::<u64, String, LoadError>::new(NUM_LOADERS, Duration::from_millis(200))
      .refresh(Duration::from_millis(20))
      .loader(move |key: u64| {
        let attempt = load_count.fetch_add(1, Ordering::SeqCst);
        async move {
          if attempt == 0 {
            Ok(format!("value-{key}"))
          } else {
            Err(LoadError("backend unavailable"))
          }
        }
      })
      .build()
      .unwrap()
  };

  cache.get(0).await.unwrap();
  sleep(Duration::from_millis(80)).await;

  assert!(
    load_count.load(Ordering::SeqCst) >= 2,
    "a reload attempt should have fired"
  );
  let handle = cache.find(&0).expect("value must survive failed reloads");
  assert_eq!(*handle, "value-0");
  assert!(cache.metrics().reload_failures >= 1);
  cache.stop().await;
}

#[tokio::test]
async fn size_cap_evicts_the_least_recently_used_entry() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::<u64, String, LoadError>::new(1, Duration::from_secs(1))
    .build()
    .unwrap();

  for i in 0..NUM_LOADERS as u64 {
    let load_count = load_count.clone();
    cache
      .get_with(i % 2, move |key| async move {
        load_count.fetch_add(1, Ordering::SeqCst);
        Ok(format!("value-{key}"))
      })
      .await
      .unwrap();
    assert!(cache.size() <= 1);
  }

  assert_eq!(
    load_count.load(Ordering::SeqCst),
    NUM_LOADERS,
    "with capacity 1, alternating keys must evict each other every time"
  );
  assert_eq!(cache.size(), 1);
  cache.stop().await;
}

#[tokio::test]
async fn reload_keeps_working_under_eviction_churn() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();

  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::<u64, String, LoadError>::new(1, Duration::from_millis(100))
    .refresh(Duration::from_millis(10))
    .loader(counting_loader(&load_count))
    .build()
    .unwrap();

  let started = Instant::now();
  let mut i = 0u64;
  while started.elapsed() < Duration::from_secs(1) {
    cache.get(i % 2).await.unwrap();
    assert_eq!(cache.size(), 1);
    i += 1;
  }

  assert_eq!(cache.size(), 1);
  cache.stop().await;
}

#[tokio::test]
async fn hits_touch_recency_but_find_does_not() {
  let cache = CacheBuilder::<u64, String, LoadError>::new(2, Duration::from_secs(5))
    .build()
    .unwrap();
  let loader = |key: u64| async move { Ok(format!("value-{key}")) };

  // find() must not promote key 1, so loading key 3 evicts it.
  cache.get_with(1, loader).await.unwrap();
  cache.get_with(2, loader).await.unwrap();
  assert!(cache.find(&1).is_some());
  cache.get_with(3, loader).await.unwrap();
  assert!(cache.find(&1).is_none(), "find must not refresh recency");
  assert!(cache.find(&2).is_some());

  // A hit through get_with does promote, so key 3 is the victim instead.
  cache.get_with(2, loader).await.unwrap();
  cache.get_with(4, loader).await.unwrap();
  assert!(cache.find(&3).is_none(), "hits must refresh recency");
  assert!(cache.find(&2).is_some());
  cache.stop().await;
}

#[tokio::test]
async fn load_failures_surface_and_are_retried() {
  let cache = CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
    .build()
    .unwrap();

  let err = cache
    .get_with(0, |_| async move { Err(LoadError("nope")) })
    .await
    .unwrap_err();
  assert_eq!(err, LoadError("nope"));
  assert_eq!(cache.size(), 0, "failures must not be cached");

  let handle = cache
    .get_with(0, |key| async move { Ok(format!("value-{key}")) })
    .await
    .unwrap();
  assert_eq!(*handle, "value-0");
  cache.stop().await;
}

#[tokio::test]
async fn stop_releases_cache_held_handles() {
  let cache = CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
    .build()
    .unwrap();

  let pinned = cache
    .get_with(0, |key| async move { Ok(format!("value-{key}")) })
    .await
    .unwrap();
  cache
    .get_with(1, |key| async move { Ok(format!("value-{key}")) })
    .await
    .unwrap();

  cache.stop().await;
  assert_eq!(cache.size(), 0);

  // A caller's handle outlives the cache's own anchor.
  assert_eq!(*pinned, "value-0");

  // Stopping twice is fine.
  cache.stop().await;
}

#[tokio::test]
async fn remove_invalidates_a_live_entry() {
  let load_count = Arc::new(AtomicUsize::new(0));
  let cache = CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
    .loader(counting_loader(&load_count))
    .build()
    .unwrap();

  cache.get(5).await.unwrap();
  assert!(cache.remove(&5));
  assert!(cache.find(&5).is_none());
  assert!(!cache.remove(&5), "removing twice finds nothing");

  cache.get(5).await.unwrap();
  assert_eq!(
    load_count.load(Ordering::SeqCst),
    2,
    "a removed key must load afresh"
  );
  assert_eq!(cache.metrics().invalidations, 1);
  cache.stop().await;
}

#[tokio::test]
async fn remove_if_invalidates_matching_entries() {
  let cache = CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
    .build()
    .unwrap();
  let loader = |key: u64| async move { Ok(format!("value-{key}")) };

  for key in 0..6u64 {
    cache.get_with(key, loader).await.unwrap();
  }
  let removed = cache.remove_if(|key, _| key % 2 == 0);
  assert_eq!(removed, 3);
  assert_eq!(cache.size(), 3);
  assert!(cache.find(&0).is_none());
  assert!(cache.find(&1).is_some());
  cache.stop().await;
}

#[tokio::test]
async fn metrics_track_the_basic_flow() {
  let cache = CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
    .build()
    .unwrap();
  let loader = |key: u64| async move { Ok(format!("value-{key}")) };

  cache.get_with(0, loader).await.unwrap();
  cache.get_with(0, loader).await.unwrap();

  let metrics = cache.metrics();
  assert_eq!(metrics.misses, 1);
  assert_eq!(metrics.hits, 1);
  assert_eq!(metrics.loads, 1);
  cache.stop().await;
}

#[tokio::test]
async fn builder_rejects_invalid_configuration() {
  assert_eq!(
    CacheBuilder::<u64, String, LoadError>::new(0, Duration::from_secs(1))
      .build()
      .unwrap_err(),
    BuildError::ZeroMaxSize
  );
  assert_eq!(
    CacheBuilder::<u64, String, LoadError>::new(10, Duration::ZERO)
      .build()
      .unwrap_err(),
    BuildError::ZeroTimeToLive
  );
  assert_eq!(
    CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
      .refresh(Duration::from_millis(100))
      .build()
      .unwrap_err(),
    BuildError::RefreshWithoutLoader
  );
  assert_eq!(
    CacheBuilder::<u64, String, LoadError>::new(10, Duration::from_secs(1))
      .refresh(Duration::from_secs(1))
      .loader(|key: u64| async move { Ok(format!("value-{key}")) })
      .build()
      .unwrap_err(),
    BuildError::RefreshNotBelowTimeToLive
  );
}
