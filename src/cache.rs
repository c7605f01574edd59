use std::future::Future;
use std::hash::BuildHasher;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::builder::CacheBuilder;
use crate::entry::{CacheEntry, Loaded, Snapshot};
use crate::error::{BoxError, Error, Result};
use crate::inflight::{self, Call, InFlight, Join};
use crate::metrics::CacheMetrics;
use crate::shard::{KeyRef, Lookup, Shard};
use crate::traits::{CacheValue, Persister, Weigher};

/// Minimum budget per shard when the shard count is chosen automatically.
///
/// Keeps uneven hash distribution from evicting prematurely in small caches.
const MIN_SHARD_SIZE: u64 = 4096;

/// Default number of shards for large caches.
const DEFAULT_SHARD_COUNT: usize = 64;

/// Upper bound for an explicitly requested shard count.
const MAX_SHARD_COUNT: usize = 1 << 16;

fn compute_shard_count(capacity: u64, desired: Option<usize>) -> usize {
	match desired {
		Some(count) => {
			let count = count.clamp(1, MAX_SHARD_COUNT).next_power_of_two();
			// A bounded cache must leave every shard at least one byte, since a
			// zero shard budget means unbounded.
			match usize::try_from(capacity) {
				Ok(capacity) if capacity > 0 && capacity < count => 1 << capacity.ilog2(),
				_ => count,
			}
		}
		None if capacity == 0 => DEFAULT_SHARD_COUNT,
		None => {
			let max_shards = usize::try_from(capacity / MIN_SHARD_SIZE).unwrap_or(usize::MAX).max(1);
			DEFAULT_SHARD_COUNT.min(max_shards).next_power_of_two()
		}
	}
}

/// Thread-safe, sharded, TTL-aware LRU cache with load deduplication.
///
/// `Cache` is a cheap handle; clones share the same storage. All methods except
/// the `get_or_load` family are synchronous.
///
/// # Loading
///
/// [`get_or_load`](Cache::get_or_load) returns a live entry immediately. On a
/// miss, the first caller for the key spawns the loader and every concurrent
/// caller for that key waits for the same execution. The load runs as its own
/// task, so it completes and populates the cache even if the caller that
/// started it stops waiting.
///
/// # Refresh
///
/// A hit on an entry whose remaining lifetime is below `ttl * refresh_factor`
/// schedules one background reload. The stale value is served until the reload
/// replaces it; reload failures are logged and dropped.
///
/// # Sharding for Concurrency
///
/// Keys are routed to shards by hash. Each shard has its own lock and an equal
/// slice of the byte budget, and evicts in strict LRU order within that slice.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cachepool::{Cache, Loaded};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cachepool::Result<()> {
/// let cache: Cache<String> = Cache::new(1024 * 1024);
///
/// let name = cache
///     .get_or_load("user:1", || async {
///         Ok::<_, std::io::Error>(Loaded::value("alice".to_string()))
///     })
///     .await?;
/// assert_eq!(name.as_deref(), Some("alice"));
///
/// cache.set_with_ttl("user:2", "bob".to_string(), Duration::from_secs(10));
/// assert_eq!(cache.get("user:2"), Some(Some("bob".to_string())));
/// # Ok(())
/// # }
/// ```
pub struct Cache<V> {
	inner: Arc<Inner<V>>,
}

impl<V> Clone for Cache<V> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

struct Inner<V> {
	/// Sharded storage
	shards: Box<[Mutex<Shard<V>>]>,
	hasher: ahash::RandomState,
	shard_count: usize,
	capacity_bytes: u64,
	default_ttl: Duration,
	empty_ttl: Duration,
	refresh_factor: f64,
	weigher: Option<Weigher<V>>,
	persister: Option<Arc<dyn Persister<V>>>,
	persist_permits: Arc<Semaphore>,
	inflight: Arc<InFlight<V>>,
	hits: AtomicU64,
	misses: AtomicU64,
	loads: AtomicU64,
	load_failures: AtomicU64,
	refreshes: AtomicU64,
	inserts: AtomicU64,
	updates: AtomicU64,
	evictions: AtomicU64,
	removals: AtomicU64,
	expirations: AtomicU64,
	persist_dropped: AtomicU64,
}

impl<V: CacheValue> Cache<V> {
	/// Create a cache with the given total byte budget and default settings.
	pub fn new(max_size_bytes: u64) -> Self {
		CacheBuilder::new(max_size_bytes).build()
	}

	/// Start configuring a cache.
	pub fn builder(max_size_bytes: u64) -> CacheBuilder<V> {
		CacheBuilder::new(max_size_bytes)
	}

	pub(crate) fn from_builder(builder: CacheBuilder<V>) -> Self {
		let shard_count = compute_shard_count(builder.max_size, builder.shard_count);
		let size_per_shard = builder.max_size / shard_count as u64;
		let shards = (0..shard_count).map(|_| Mutex::new(Shard::new(size_per_shard))).collect();

		Self {
			inner: Arc::new(Inner {
				shards,
				hasher: ahash::RandomState::new(),
				shard_count,
				capacity_bytes: builder.max_size,
				default_ttl: builder.default_ttl,
				empty_ttl: builder.empty_ttl,
				refresh_factor: builder.refresh_factor,
				weigher: builder.weigher,
				persister: builder.persister,
				persist_permits: Arc::new(Semaphore::new(builder.persist_concurrency)),
				inflight: Arc::new(InFlight::new()),
				hits: AtomicU64::new(0),
				misses: AtomicU64::new(0),
				loads: AtomicU64::new(0),
				load_failures: AtomicU64::new(0),
				refreshes: AtomicU64::new(0),
				inserts: AtomicU64::new(0),
				updates: AtomicU64::new(0),
				evictions: AtomicU64::new(0),
				removals: AtomicU64::new(0),
				expirations: AtomicU64::new(0),
				persist_dropped: AtomicU64::new(0),
			}),
		}
	}

	/// Return the cached value for `key`, loading it on a miss.
	///
	/// Returns `Ok(None)` when the loader (now or earlier, within the empty-result
	/// TTL) reported that the key has no value. A loader error is returned to every
	/// caller that waited on that load and nothing is cached.
	///
	/// Dropping the returned future stops waiting but does not stop the load.
	pub async fn get_or_load<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<V>>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = std::result::Result<Loaded<V>, E>> + Send + 'static,
		E: Into<BoxError> + 'static,
	{
		match self.start(key, loader) {
			Started::Hit(value) => Ok(value),
			Started::Waiting(slot) => inflight::wait(slot, key).await,
		}
	}

	/// Like [`get_or_load`](Cache::get_or_load), but stops waiting with
	/// [`Error::Cancelled`] once `token` is cancelled. The load itself keeps running
	/// and still populates the cache.
	pub async fn get_or_load_cancellable<F, Fut, E>(
		&self,
		key: &str,
		token: &CancellationToken,
		loader: F,
	) -> Result<Option<V>>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = std::result::Result<Loaded<V>, E>> + Send + 'static,
		E: Into<BoxError> + 'static,
	{
		match self.start(key, loader) {
			Started::Hit(value) => Ok(value),
			Started::Waiting(slot) => inflight::wait_cancellable(slot, key, token).await,
		}
	}

	fn start<F, Fut, E>(&self, key: &str, loader: F) -> Started<V>
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = std::result::Result<Loaded<V>, E>> + Send + 'static,
		E: Into<BoxError> + 'static,
	{
		if let Some(snapshot) = self.lookup(self.key_ref(key)) {
			self.maybe_refresh(key, &snapshot, loader);
			return Started::Hit(snapshot.value);
		}

		match self.inner.inflight.join(key) {
			Join::Follower(slot) => Started::Waiting(slot),
			Join::Leader(call, slot) => {
				self.inner.loads.fetch_add(1, Ordering::Relaxed);
				tokio::spawn(self.clone().run_load(call, loader));
				Started::Waiting(slot)
			}
		}
	}

	async fn run_load<F, Fut, E>(self, call: Call<V>, loader: F)
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = std::result::Result<Loaded<V>, E>>,
		E: Into<BoxError> + 'static,
	{
		if let Some(persister) = &self.inner.persister
			&& let Some(value) = persister.load(call.key()).await
		{
			trace!(key = call.key(), "restored entry from persister");
			self.insert(call.key(), Some(value.clone()), self.inner.default_ttl, false);
			call.complete(Ok(Some(value)));
			return;
		}

		match loader().await {
			Ok(loaded) => {
				let ttl = match loaded.value {
					Some(_) => loaded.ttl.unwrap_or(self.inner.default_ttl),
					None => self.inner.empty_ttl,
				};
				self.insert(call.key(), loaded.value.clone(), ttl, true);
				call.complete(Ok(loaded.value));
			}
			Err(err) => {
				let err = err.into();
				self.inner.load_failures.fetch_add(1, Ordering::Relaxed);
				debug!(key = call.key(), error = %err, "loader failed");
				call.complete(Err(Error::load(err)));
			}
		}
	}

	/// Schedule a background reload if the hit entry is close to expiry.
	fn maybe_refresh<F, Fut, E>(&self, key: &str, snapshot: &Snapshot<V>, loader: F)
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = std::result::Result<Loaded<V>, E>> + Send + 'static,
		E: Into<BoxError> + 'static,
	{
		if self.inner.refresh_factor <= 0.0 || snapshot.ttl.is_zero() {
			return;
		}
		let Some(remaining) = snapshot.remaining else {
			return;
		};
		if remaining >= snapshot.ttl.mul_f64(self.inner.refresh_factor) {
			return;
		}
		// A load or refresh for this key is already running.
		let Some(call) = self.inner.inflight.try_lead(key) else {
			return;
		};

		self.inner.refreshes.fetch_add(1, Ordering::Relaxed);
		trace!(key, ?remaining, "scheduling refresh");
		tokio::spawn(self.clone().run_refresh(call, loader));
	}

	async fn run_refresh<F, Fut, E>(self, call: Call<V>, loader: F)
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = std::result::Result<Loaded<V>, E>>,
		E: Into<BoxError> + 'static,
	{
		match loader().await {
			Ok(Loaded {
				value: Some(value),
				ttl,
			}) => {
				let ttl = ttl.unwrap_or(self.inner.default_ttl);
				self.insert(call.key(), Some(value.clone()), ttl, true);
				call.complete(Ok(Some(value)));
			}
			// An empty reload leaves the stale value in place until it expires.
			Ok(_) => call.complete(Ok(None)),
			Err(err) => {
				let err = err.into();
				self.inner.load_failures.fetch_add(1, Ordering::Relaxed);
				debug!(key = call.key(), error = %err, "refresh failed, keeping stale entry");
				call.complete(Err(Error::load(err)));
			}
		}
	}

	/// Insert or replace a value with the default TTL.
	pub fn set(&self, key: &str, value: V) {
		self.set_with_ttl(key, value, self.inner.default_ttl);
	}

	/// Insert or replace a value. A zero `ttl` never expires.
	///
	/// Evicts least-recently-used entries from the owning shard before returning if
	/// the write pushed it over budget, and enqueues a best-effort save if a
	/// persister is configured.
	pub fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
		self.insert(key, Some(value), ttl, true);
	}

	fn insert(&self, key: &str, value: Option<V>, ttl: Duration, persist: bool) {
		let weight = match (&value, &self.inner.weigher) {
			(Some(value), Some(weigher)) => weigher(key, value),
			(Some(value), None) => value.weight(),
			(None, _) => 1,
		};
		let key_ref = self.key_ref(key);
		let entry = CacheEntry::new(value.clone(), ttl, weight, Instant::now());

		let outcome = self.shard(key_ref.hash).lock().insert(key_ref.into_owned(), entry);

		if outcome.replaced {
			self.inner.updates.fetch_add(1, Ordering::Relaxed);
		} else {
			self.inner.inserts.fetch_add(1, Ordering::Relaxed);
		}
		if outcome.evicted > 0 {
			self.inner.evictions.fetch_add(outcome.evicted as u64, Ordering::Relaxed);
		}

		if persist && let Some(value) = value {
			self.enqueue_persist(key, value);
		}
	}

	fn enqueue_persist(&self, key: &str, value: V) {
		let Some(persister) = self.inner.persister.clone() else {
			return;
		};
		let Ok(permit) = self.inner.persist_permits.clone().try_acquire_owned() else {
			self.inner.persist_dropped.fetch_add(1, Ordering::Relaxed);
			trace!(key, "persistence limiter saturated, dropping save");
			return;
		};
		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			self.inner.persist_dropped.fetch_add(1, Ordering::Relaxed);
			debug!(key, "no async runtime, dropping save");
			return;
		};

		let key = key.to_owned();
		runtime.spawn(async move {
			let _permit = permit;
			if let Err(error) = persister.save(&key, &value).await {
				warn!(key, %error, "failed to persist cache entry");
			}
		});
	}

	/// Read a key without loading.
	///
	/// Returns `None` if the key is absent or expired (an expired entry is removed),
	/// and `Some(None)` if the cache holds a "no value" result for it.
	pub fn get(&self, key: &str) -> Option<Option<V>> {
		self.lookup(self.key_ref(key)).map(|snapshot| snapshot.value)
	}

	/// Check for a live entry without refreshing its recency.
	pub fn contains(&self, key: &str) -> bool {
		let key_ref = self.key_ref(key);
		self.shard(key_ref.hash).lock().contains(key_ref, Instant::now())
	}

	/// Whether a load or refresh for `key` is currently running.
	pub fn is_loading(&self, key: &str) -> bool {
		self.inner.inflight.contains(key)
	}

	fn lookup(&self, key: KeyRef<'_>) -> Option<Snapshot<V>> {
		let lookup = self.shard(key.hash).lock().get(key, Instant::now());
		match lookup {
			Lookup::Hit(snapshot) => {
				self.inner.hits.fetch_add(1, Ordering::Relaxed);
				Some(snapshot)
			}
			Lookup::Expired => {
				self.inner.expirations.fetch_add(1, Ordering::Relaxed);
				self.inner.misses.fetch_add(1, Ordering::Relaxed);
				None
			}
			Lookup::Miss => {
				self.inner.misses.fetch_add(1, Ordering::Relaxed);
				None
			}
		}
	}

	/// Remove a key. Returns true if it was present.
	pub fn delete(&self, key: &str) -> bool {
		let key_ref = self.key_ref(key);
		let removed = self.shard(key_ref.hash).lock().remove(key_ref);
		if removed {
			self.inner.removals.fetch_add(1, Ordering::Relaxed);
		}
		removed
	}

	/// Empty every shard.
	pub fn purge(&self) {
		for index in 0..self.inner.shard_count {
			self.purge_shard(index);
		}
	}

	/// Empty a single shard. Returns how many entries were dropped.
	pub fn purge_shard(&self, index: usize) -> usize {
		let Some(shard) = self.inner.shards.get(index) else {
			return 0;
		};
		let removed = shard.lock().clear();
		self.inner.removals.fetch_add(removed as u64, Ordering::Relaxed);
		removed
	}

	pub fn shard_count(&self) -> usize {
		self.inner.shard_count
	}

	/// Number of entries in one shard; 0 for an out-of-range index.
	pub fn shard_len(&self, index: usize) -> usize {
		self.inner.shards.get(index).map_or(0, |shard| shard.lock().len())
	}

	/// Number of entries, including expired ones not yet read.
	pub fn len(&self) -> usize {
		self.inner.shards.iter().map(|shard| shard.lock().len()).sum()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Total weight of all entries.
	pub fn size(&self) -> u64 {
		self.inner.shards.iter().map(|shard| shard.lock().used_bytes()).sum()
	}

	/// Get a performance metrics snapshot.
	pub fn metrics(&self) -> CacheMetrics {
		let (entry_count, current_size_bytes) =
			self.inner.shards.iter().fold((0, 0), |(count, size), shard| {
				let shard = shard.lock();
				(count + shard.len(), size + shard.used_bytes())
			});

		CacheMetrics {
			hits: self.inner.hits.load(Ordering::Relaxed),
			misses: self.inner.misses.load(Ordering::Relaxed),
			loads: self.inner.loads.load(Ordering::Relaxed),
			load_failures: self.inner.load_failures.load(Ordering::Relaxed),
			refreshes: self.inner.refreshes.load(Ordering::Relaxed),
			inserts: self.inner.inserts.load(Ordering::Relaxed),
			updates: self.inner.updates.load(Ordering::Relaxed),
			evictions: self.inner.evictions.load(Ordering::Relaxed),
			removals: self.inner.removals.load(Ordering::Relaxed),
			expirations: self.inner.expirations.load(Ordering::Relaxed),
			persist_dropped: self.inner.persist_dropped.load(Ordering::Relaxed),
			current_size_bytes,
			capacity_bytes: self.inner.capacity_bytes,
			entry_count,
		}
	}

	fn key_ref<'a>(&self, key: &'a str) -> KeyRef<'a> {
		KeyRef {
			hash: self.inner.hasher.hash_one(key),
			key,
		}
	}

	/// Get the shard for a given hash.
	fn shard(&self, hash: u64) -> &Mutex<Shard<V>> {
		let index = (hash as usize) & (self.inner.shard_count - 1);
		&self.inner.shards[index]
	}
}

enum Started<V> {
	Hit(Option<V>),
	Waiting(tokio::sync::watch::Receiver<Option<inflight::Outcome<V>>>),
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;

	fn loader_for(
		value: &'static str,
		calls: Arc<AtomicUsize>,
	) -> impl FnOnce() -> std::future::Ready<std::result::Result<Loaded<String>, BoxError>> + Send + 'static {
		move || {
			calls.fetch_add(1, Ordering::SeqCst);
			std::future::ready(Ok(Loaded::value(value.to_string())))
		}
	}

	#[test]
	fn test_cache_set_and_get() {
		let cache: Cache<String> = Cache::new(1024);
		cache.set("k", "hello".to_string());

		assert_eq!(cache.get("k"), Some(Some("hello".to_string())));
		assert_eq!(cache.size(), 5);
		assert_eq!(cache.len(), 1);
	}

	#[test]
	fn test_cache_delete() {
		let cache: Cache<String> = Cache::new(1024);
		cache.set("k", "hello".to_string());

		assert!(cache.delete("k"));
		assert!(!cache.delete("k"));
		assert_eq!(cache.get("k"), None);
		assert_eq!(cache.metrics().removals, 1);
	}

	#[test]
	fn test_cache_purge() {
		let cache: Cache<u64> = Cache::builder(0).shards(8).build();
		for i in 0..100 {
			cache.set(&format!("k{i}"), i);
		}
		let per_shard: usize = (0..cache.shard_count()).map(|i| cache.shard_len(i)).sum();
		assert_eq!(per_shard, 100);

		cache.purge();

		assert!(cache.is_empty());
		assert_eq!(cache.size(), 0);
		assert_eq!(cache.shard_len(99), 0);
	}

	#[test]
	fn test_custom_weigher() {
		let cache: Cache<u64> = Cache::builder(0).shards(1).weigher(|_, value| *value).build();
		cache.set("a", 10);
		cache.set("b", 32);
		assert_eq!(cache.size(), 42);
	}

	#[test]
	fn test_shard_budget_is_split_evenly() {
		let cache: Cache<u64> = Cache::builder(64).shards(4).build();
		for i in 0..1000 {
			cache.set(&format!("k{i}"), i);
		}
		for index in 0..cache.shard_count() {
			assert!(cache.shard_len(index) <= 16);
		}
		assert!(cache.metrics().evictions > 0);
	}

	#[test]
	fn test_tiny_budget_stays_bounded() {
		let cache: Cache<u64> = Cache::builder(3).shards(4).weigher(|_, _| 1).build();
		for i in 0..100 {
			cache.set(&format!("k{i}"), i);
		}

		assert_eq!(cache.shard_count(), 2);
		assert!(cache.size() <= 3);
		assert!(cache.len() <= 3);
	}

	#[test]
	fn test_compute_shard_count_limits() {
		assert_eq!(compute_shard_count(0, Some(usize::MAX)), MAX_SHARD_COUNT);
		assert_eq!(compute_shard_count(1, Some(8)), 1);
		assert_eq!(compute_shard_count(5, Some(8)), 4);
		assert_eq!(compute_shard_count(1024, Some(30)), 32);
		assert_eq!(compute_shard_count(0, Some(0)), 1);
	}

	#[tokio::test]
	async fn test_get_or_load_caches_value() {
		let cache: Cache<String> = Cache::new(1024);
		let calls = Arc::new(AtomicUsize::new(0));

		let first = cache.get_or_load("k", loader_for("v", calls.clone())).await.unwrap();
		let second = cache.get_or_load("k", loader_for("other", calls.clone())).await.unwrap();

		assert_eq!(first.as_deref(), Some("v"));
		assert_eq!(second.as_deref(), Some("v"));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(cache.metrics().loads, 1);
	}

	#[tokio::test]
	async fn test_loader_error_is_not_cached() {
		let cache: Cache<String> = Cache::new(1024);

		let result = cache
			.get_or_load("k", || async { Err::<Loaded<String>, _>(std::io::Error::other("boom")) })
			.await;

		let err = result.unwrap_err();
		assert!(matches!(err, Error::Load(_)));
		assert_eq!(err.to_string(), "boom");
		assert!(!cache.contains("k"));
		assert!(!cache.is_loading("k"));
		assert_eq!(cache.metrics().load_failures, 1);
	}

	#[tokio::test]
	async fn test_loader_chosen_ttl_wins() {
		let cache: Cache<String> = Cache::builder(1024).default_ttl(Duration::from_secs(60)).build();

		cache
			.get_or_load("k", || async {
				Ok::<_, BoxError>(Loaded::value("v".to_string()).with_ttl(Duration::ZERO))
			})
			.await
			.unwrap();

		let key_ref = cache.key_ref("k");
		let lookup = cache.shard(key_ref.hash).lock().get(key_ref, Instant::now());
		let Lookup::Hit(snapshot) = lookup else {
			panic!("entry should be cached");
		};
		assert_eq!(snapshot.ttl, Duration::ZERO);
	}

	#[tokio::test]
	async fn test_panicking_loader_abandons_waiters() {
		let cache: Cache<String> = Cache::new(1024);

		let result = cache
			.get_or_load("k", || async {
				if true {
					panic!("loader exploded");
				}
				Ok::<_, BoxError>(Loaded::empty())
			})
			.await;

		assert!(matches!(result, Err(Error::LoadAbandoned { .. })));
		assert!(!cache.is_loading("k"));
	}

	#[test]
	fn test_cache_is_send_sync() {
		fn assert_send<T: Send>() {}
		fn assert_sync<T: Sync>() {}

		assert_send::<Cache<String>>();
		assert_sync::<Cache<String>>();
	}
}
