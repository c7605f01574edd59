use std::sync::Arc;
use std::time::Duration;

use crate::cache::Cache;
use crate::error::BoxError;
use crate::pool::{Factory, Hook, Pool, PoolConfig};
use crate::traits::{CacheValue, Persister, Weigher};

pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
pub(crate) const DEFAULT_EMPTY_TTL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_REFRESH_FACTOR: f64 = 0.2;
pub(crate) const DEFAULT_PERSIST_CONCURRENCY: usize = 4;

pub(crate) const DEFAULT_POOL_SIZE: usize = 10;
pub(crate) const DEFAULT_MAX_USAGE: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_RECLAIM_INTERVAL: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_CLOSE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Builder for configuring a [`Cache`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cachepool::{Cache, CacheBuilder};
///
/// let cache: Cache<String> = CacheBuilder::new(64 * 1024 * 1024)
///     .shards(32)
///     .default_ttl(Duration::from_secs(60))
///     .empty_ttl(Duration::from_secs(5))
///     .refresh_factor(0.25)
///     .build();
/// assert_eq!(cache.shard_count(), 32);
/// ```
pub struct CacheBuilder<V> {
	pub(crate) max_size: u64,
	pub(crate) shard_count: Option<usize>,
	pub(crate) default_ttl: Duration,
	pub(crate) empty_ttl: Duration,
	pub(crate) refresh_factor: f64,
	pub(crate) weigher: Option<Weigher<V>>,
	pub(crate) persister: Option<Arc<dyn Persister<V>>>,
	pub(crate) persist_concurrency: usize,
}

impl<V: CacheValue> CacheBuilder<V> {
	/// Create a new builder with the given total byte budget. Zero means unbounded.
	pub fn new(max_size_bytes: u64) -> Self {
		Self {
			max_size: max_size_bytes,
			shard_count: None,
			default_ttl: DEFAULT_TTL,
			empty_ttl: DEFAULT_EMPTY_TTL,
			refresh_factor: DEFAULT_REFRESH_FACTOR,
			weigher: None,
			persister: None,
			persist_concurrency: DEFAULT_PERSIST_CONCURRENCY,
		}
	}

	/// Set the number of shards. Rounded up to the next power of 2 and capped
	/// at 65536. A bounded cache never gets more shards than budget bytes.
	///
	/// Default: up to 64 shards, scaled down so each shard keeps at least 4KB.
	pub fn shards(mut self, count: usize) -> Self {
		self.shard_count = Some(count);
		self
	}

	/// TTL for loaded values when the loader does not choose one. Zero never expires.
	pub fn default_ttl(mut self, ttl: Duration) -> Self {
		self.default_ttl = ttl;
		self
	}

	/// TTL for cached "no value" results.
	pub fn empty_ttl(mut self, ttl: Duration) -> Self {
		self.empty_ttl = ttl;
		self
	}

	/// Fraction of the TTL below which a hit schedules a background refresh.
	///
	/// Clamped to `[0, 1]`; zero disables refresh.
	pub fn refresh_factor(mut self, factor: f64) -> Self {
		self.refresh_factor = if factor.is_nan() { 0.0 } else { factor.clamp(0.0, 1.0) };
		self
	}

	/// Override [`CacheValue::weight`] with a custom weigher.
	pub fn weigher(mut self, weigher: impl Fn(&str, &V) -> u64 + Send + Sync + 'static) -> Self {
		self.weigher = Some(Arc::new(weigher));
		self
	}

	/// Persist every written value in the background.
	pub fn persister(mut self, persister: impl Persister<V>) -> Self {
		self.persister = Some(Arc::new(persister));
		self
	}

	/// Maximum concurrent background saves. Saves beyond this are dropped.
	pub fn persist_concurrency(mut self, limit: usize) -> Self {
		self.persist_concurrency = limit;
		self
	}

	/// Build the cache with the configured settings.
	pub fn build(self) -> Cache<V> {
		Cache::from_builder(self)
	}
}

impl<V: CacheValue> Default for CacheBuilder<V> {
	/// Create a builder with default settings and 1GB capacity.
	fn default() -> Self {
		Self::new(1024 * 1024 * 1024)
	}
}

/// Builder for configuring a [`Pool`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cachepool::{Pool, PoolBuilder};
///
/// let pool: Pool<String> = PoolBuilder::new(|| Ok::<_, std::io::Error>(String::from("conn")))
///     .max_size(4)
///     .max_usage(Duration::from_secs(30))
///     .health_check(|conn: &String| {
///         if conn.is_empty() { Err("empty connection") } else { Ok(()) }
///     })
///     .build();
/// assert_eq!(pool.max_size(), 4);
/// ```
pub struct PoolBuilder<T> {
	factory: Factory<T>,
	max_size: usize,
	max_usage: Duration,
	health_check: Option<Hook<T>>,
	destroy: Option<Hook<T>>,
	health_check_interval: Duration,
	reclaim_interval: Duration,
	close_sweep_interval: Duration,
	reclaim_abandoned: bool,
}

impl<T: Send + Sync + 'static> PoolBuilder<T> {
	/// Create a builder around the resource factory.
	pub fn new<F, E>(factory: F) -> Self
	where
		F: Fn() -> Result<T, E> + Send + Sync + 'static,
		E: Into<BoxError>,
	{
		Self {
			factory: Arc::new(move || -> Result<T, BoxError> { factory().map_err(Into::into) }),
			max_size: DEFAULT_POOL_SIZE,
			max_usage: DEFAULT_MAX_USAGE,
			health_check: None,
			destroy: None,
			health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
			reclaim_interval: DEFAULT_RECLAIM_INTERVAL,
			close_sweep_interval: DEFAULT_CLOSE_SWEEP_INTERVAL,
			reclaim_abandoned: true,
		}
	}

	/// Maximum number of checked-out resources. Zero selects the default of 10.
	pub fn max_size(mut self, max_size: usize) -> Self {
		self.max_size = if max_size == 0 { DEFAULT_POOL_SIZE } else { max_size };
		self
	}

	/// How long a checkout may last before it is reclaimed, and how long a
	/// resource waits in pending close. Zero selects the default of 60s.
	pub fn max_usage(mut self, max_usage: Duration) -> Self {
		self.max_usage = if max_usage.is_zero() { DEFAULT_MAX_USAGE } else { max_usage };
		self
	}

	/// Validate idle resources periodically; failures are replaced.
	pub fn health_check<F, E>(mut self, check: F) -> Self
	where
		F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
		E: Into<BoxError>,
	{
		self.health_check = Some(Arc::new(move |resource: &T| -> Result<(), BoxError> {
			check(resource).map_err(Into::into)
		}));
		self
	}

	/// Release a resource when it leaves the pool. Errors are logged.
	pub fn destroy<F, E>(mut self, destroy: F) -> Self
	where
		F: Fn(&T) -> Result<(), E> + Send + Sync + 'static,
		E: Into<BoxError>,
	{
		self.destroy = Some(Arc::new(move |resource: &T| -> Result<(), BoxError> {
			destroy(resource).map_err(Into::into)
		}));
		self
	}

	pub fn health_check_interval(mut self, interval: Duration) -> Self {
		self.health_check_interval = interval;
		self
	}

	pub fn reclaim_interval(mut self, interval: Duration) -> Self {
		self.reclaim_interval = interval;
		self
	}

	pub fn close_sweep_interval(mut self, interval: Duration) -> Self {
		self.close_sweep_interval = interval;
		self
	}

	/// Return checkouts held longer than `max_usage` to the pool. Default: true.
	///
	/// A caller that is slow rather than gone can have its resource handed out
	/// again while still using it.
	pub fn reclaim_abandoned(mut self, enabled: bool) -> Self {
		self.reclaim_abandoned = enabled;
		self
	}

	/// Build the pool. Background maintenance starts if called inside a tokio runtime.
	pub fn build(self) -> Pool<T> {
		Pool::from_config(PoolConfig {
			factory: self.factory,
			max_size: self.max_size,
			max_usage: self.max_usage,
			health_check: self.health_check,
			destroy: self.destroy,
			health_check_interval: self.health_check_interval,
			reclaim_interval: self.reclaim_interval,
			close_sweep_interval: self.close_sweep_interval,
			reclaim_abandoned: self.reclaim_abandoned,
		})
	}
}
