//! A concurrent loading cache with single-flight semantics.
//!
//! shoal is built from two cooperating layers:
//!
//! - [`SharedValues`] coalesces concurrent loads of the same key onto one
//!   loader invocation and hands out reference-counted [`EntryHandle`]s;
//!   an entry stays resident for exactly as long as at least one handle to
//!   it exists.
//! - [`LoadingCache`] wraps that layer with a bounded size (LRU eviction),
//!   a per-entry time-to-live, optional periodic background reload, and a
//!   maintenance task that enforces both.
//!
//! ```no_run
//! use shoal::CacheBuilder;
//! use std::time::Duration;
//!
//! # #[derive(Clone, Debug)] struct DbError;
//! # async fn fetch_from_db(id: u64) -> Result<String, DbError> { Ok(String::new()) }
//! # async fn demo() -> Result<(), DbError> {
//! let cache = CacheBuilder::new(10_000, Duration::from_secs(60))
//!   .loader(|id: u64| fetch_from_db(id))
//!   .build()
//!   .unwrap();
//!
//! let user = cache.get(42).await?;
//! println!("{}", *user);
//! # Ok(())
//! # }
//! ```
//!
//! Load failures are returned to every coalesced caller and never cached;
//! the next request starts a fresh attempt. Reload failures are logged and
//! the previous value is served until its time-to-live elapses.

mod builder;
mod cache;
mod error;
mod handle;
mod janitor;
mod loader;
mod metrics;
mod recency;
mod runtime;
mod shared_values;

pub use builder::CacheBuilder;
pub use cache::LoadingCache;
pub use error::BuildError;
pub use handle::EntryHandle;
pub use metrics::MetricsSnapshot;
pub use runtime::{TaskSpawner, TokioSpawner};
pub use shared_values::SharedValues;
