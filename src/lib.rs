//! # cachepool
//!
//! Two engines for sharing bounded, time-sensitive resources between tasks:
//!
//! - [`Cache`]: a sharded LRU cache with a byte budget, per-entry TTL, load
//!   deduplication, background refresh of nearly-expired entries and
//!   best-effort persistence.
//! - [`Pool`]: a resource pool with overflow instead of waiting, idle health
//!   checks, reclaim of abandoned checkouts and delayed destruction.
//!
//! Around them sit the [`Backend`] contract for key/value stores, the
//! [`DefaultCache`] and [`MemoryBackend`] adapters, and a [`PoolRegistry`].
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use cachepool::{Cache, Loaded};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cachepool::Result<()> {
//! let cache: Cache<String> = Cache::builder(64 * 1024 * 1024)
//!     .default_ttl(Duration::from_secs(60))
//!     .empty_ttl(Duration::from_secs(5))
//!     .build();
//!
//! // Concurrent callers for the same key share one loader execution.
//! let profile = cache
//!     .get_or_load("user:1", || async {
//!         Ok::<_, std::io::Error>(Loaded::value("alice".to_string()))
//!     })
//!     .await?;
//! assert_eq!(profile.as_deref(), Some("alice"));
//!
//! // A loader may report that the key has no value; that is cached too.
//! let missing = cache
//!     .get_or_load("user:2", || async { Ok::<_, std::io::Error>(Loaded::empty()) })
//!     .await?;
//! assert_eq!(missing, None);
//! # Ok(())
//! # }
//! ```
//!
//! ## Async Usage
//!
//! Loaders run as their own tokio tasks, so `get_or_load` must be called from
//! within a tokio runtime. A caller that stops waiting, by dropping the future or
//! through [`Cache::get_or_load_cancellable`], does not stop the load; the result
//! still lands in the cache.
//!
//! ## Thread Safety
//!
//! [`Cache`] and [`Pool`] are cheap `Clone` handles over shared state and are
//! `Send + Sync` for `Send + Sync` values. Locks are never held across an
//! `await` or while user callbacks run.

mod backend;
mod builder;
mod cache;
mod entry;
mod error;
mod inflight;
mod metrics;
mod pool;
mod registry;
mod shard;
mod traits;

pub use backend::{Backend, DefaultCache, MemoryBackend, Namespaced, namespaced_key};
pub use builder::{CacheBuilder, PoolBuilder};
pub use cache::Cache;
pub use entry::Loaded;
pub use error::{BoxError, Error, Result, SharedError};
pub use metrics::CacheMetrics;
pub use pool::{Factory, Hook, Pool, PoolStats, Resource};
pub use registry::PoolRegistry;
pub use traits::{CacheValue, Persister, Weigher};
