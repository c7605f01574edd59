//! Cache performance metrics.

/// Performance metrics for the cache.
///
/// # Example
///
/// ```
/// use cachepool::Cache;
///
/// let cache: Cache<String> = Cache::new(1024 * 1024);
/// cache.set("greeting", "hello".to_string());
/// let _ = cache.get("greeting");
///
/// let metrics = cache.metrics();
/// println!("Hit rate: {:.2}%", metrics.hit_rate() * 100.0);
/// println!("Utilization: {:.2}%", metrics.utilization() * 100.0);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Default)]
pub struct CacheMetrics {
	/// Lookups that found a live entry.
	pub hits: u64,
	/// Lookups that found nothing, or only an expired entry.
	pub misses: u64,
	/// Loader executions started on a miss (one per deduplicated group).
	pub loads: u64,
	/// Loader executions that returned an error.
	pub load_failures: u64,
	/// Background refreshes scheduled for nearly-expired entries.
	pub refreshes: u64,
	/// New entries written.
	pub inserts: u64,
	/// Writes that replaced an existing entry.
	pub updates: u64,
	/// Entries evicted to stay within the byte budget.
	pub evictions: u64,
	/// Entries explicitly deleted or purged.
	pub removals: u64,
	/// Entries dropped lazily because a read found them expired.
	pub expirations: u64,
	/// Persistence requests dropped because the limiter was saturated.
	pub persist_dropped: u64,
	/// Current total weight across all shards.
	pub current_size_bytes: u64,
	/// Total byte budget. Zero means unbounded.
	pub capacity_bytes: u64,
	/// Current number of entries.
	pub entry_count: usize,
}

impl CacheMetrics {
	/// Cache hit rate as a ratio between 0.0 and 1.0.
	///
	/// Returns 0.0 if there have been no cache accesses.
	pub fn hit_rate(&self) -> f64 {
		let total = self.hits + self.misses;
		if total == 0 {
			0.0
		} else {
			self.hits as f64 / total as f64
		}
	}

	/// Fraction of the byte budget in use. 0.0 for unbounded caches.
	pub fn utilization(&self) -> f64 {
		if self.capacity_bytes == 0 {
			0.0
		} else {
			self.current_size_bytes as f64 / self.capacity_bytes as f64
		}
	}

	pub fn total_accesses(&self) -> u64 {
		self.hits + self.misses
	}

	pub fn total_writes(&self) -> u64 {
		self.inserts + self.updates
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_empty_metrics_ratios() {
		let metrics = CacheMetrics::default();
		assert_eq!(metrics.hit_rate(), 0.0);
		assert_eq!(metrics.utilization(), 0.0);
	}

	#[test]
	fn test_ratios() {
		let metrics = CacheMetrics {
			hits: 3,
			misses: 1,
			current_size_bytes: 25,
			capacity_bytes: 100,
			..Default::default()
		};
		assert_eq!(metrics.hit_rate(), 0.75);
		assert_eq!(metrics.utilization(), 0.25);
		assert_eq!(metrics.total_accesses(), 4);
	}
}
