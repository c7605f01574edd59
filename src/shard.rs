//! Shard implementation for partitioned cache storage.
//!
//! A `Shard` is a single partition that stores cache entries in strict
//! least-recently-used order under a byte budget. The `Cache` divides its total
//! budget evenly across shards, each wrapped in its own `Mutex`; reads mutate the
//! recency order, so there is no shared read path.
//!
//! # Recency Order
//!
//! Every insert or hit stamps the entry with a monotonically increasing counter.
//! `order` maps stamps back to keys, so its first element is always the least
//! recently used entry and eviction is a `pop_first`.
//!
//! # Optimizations
//!
//! - **Passthrough hasher**: The cache hashes each key once to pick a shard. The
//!   same hash is carried in `HashedKey`/`KeyRef` and the shard map returns it
//!   as-is instead of hashing the string a second time.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::Arc;

use hashbrown::{Equivalent, HashMap};
use tokio::time::Instant;

use crate::entry::{CacheEntry, Snapshot};

/// Passthrough hasher for keys that carry a pre-computed hash.
#[derive(Default)]
pub(crate) struct PassthroughHasher(u64);

impl Hasher for PassthroughHasher {
	fn finish(&self) -> u64 {
		self.0
	}

	fn write(&mut self, _bytes: &[u8]) {
		panic!("PassthroughHasher only works with u64 hash values");
	}

	fn write_u64(&mut self, i: u64) {
		self.0 = i;
	}
}

#[derive(Clone, Default)]
pub(crate) struct PassthroughBuildHasher;

impl BuildHasher for PassthroughBuildHasher {
	type Hasher = PassthroughHasher;

	fn build_hasher(&self) -> Self::Hasher {
		PassthroughHasher::default()
	}
}

/// Owned key with its routing hash.
#[derive(Clone, Debug)]
pub(crate) struct HashedKey {
	pub hash: u64,
	pub key: Arc<str>,
}

impl Hash for HashedKey {
	fn hash<H: Hasher>(&self, state: &mut H) {
		state.write_u64(self.hash);
	}
}

impl PartialEq for HashedKey {
	fn eq(&self, other: &Self) -> bool {
		self.hash == other.hash && self.key == other.key
	}
}

impl Eq for HashedKey {}

/// Borrowed key for zero-allocation lookups.
#[derive(Clone, Copy, Debug)]
pub(crate) struct KeyRef<'a> {
	pub hash: u64,
	pub key: &'a str,
}

impl KeyRef<'_> {
	pub fn into_owned(self) -> HashedKey {
		HashedKey {
			hash: self.hash,
			key: Arc::from(self.key),
		}
	}
}

impl Hash for KeyRef<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		state.write_u64(self.hash);
	}
}

impl Equivalent<HashedKey> for KeyRef<'_> {
	fn equivalent(&self, other: &HashedKey) -> bool {
		self.hash == other.hash && self.key == &*other.key
	}
}

/// Result of a shard lookup.
pub(crate) enum Lookup<V> {
	Hit(Snapshot<V>),
	/// The entry was present but expired; it has been removed.
	Expired,
	Miss,
}

/// Accounting for a single insert.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct InsertOutcome {
	/// The key already existed and its entry was replaced.
	pub replaced: bool,
	/// Entries evicted from the LRU tail to get back under budget.
	pub evicted: usize,
}

/// A single shard: LRU-ordered entries under a byte budget.
///
/// The shard is not thread-safe on its own; the Cache wraps it in a Mutex.
pub(crate) struct Shard<V> {
	entries: HashMap<HashedKey, CacheEntry<V>, PassthroughBuildHasher>,
	/// Recency order: stamp -> key, oldest first.
	order: BTreeMap<u64, HashedKey>,
	next_stamp: u64,
	/// Sum of the weights of all live entries.
	used_bytes: u64,
	/// Zero disables eviction.
	capacity_bytes: u64,
}

impl<V: Clone> Shard<V> {
	pub fn new(capacity_bytes: u64) -> Self {
		Self {
			entries: HashMap::with_hasher(PassthroughBuildHasher),
			order: BTreeMap::new(),
			next_stamp: 0,
			used_bytes: 0,
			capacity_bytes,
		}
	}

	fn bump(&mut self) -> u64 {
		let stamp = self.next_stamp;
		self.next_stamp += 1;
		stamp
	}

	/// Look up a key, refreshing its recency on a hit and dropping it if expired.
	pub fn get(&mut self, key: KeyRef<'_>, now: Instant) -> Lookup<V> {
		let Some(entry) = self.entries.get(&key) else {
			return Lookup::Miss;
		};

		if entry.is_expired(now) {
			self.remove(key);
			return Lookup::Expired;
		}

		let old_stamp = entry.stamp;
		let stamp = self.bump();
		let Some(entry) = self.entries.get_mut(&key) else {
			return Lookup::Miss;
		};
		entry.stamp = stamp;
		if let Some(owned) = self.order.remove(&old_stamp) {
			self.order.insert(stamp, owned);
		}

		Lookup::Hit(Snapshot {
			value: entry.value.clone(),
			ttl: entry.ttl,
			remaining: entry.remaining(now),
		})
	}

	/// Check for a live entry without touching recency.
	pub fn contains(&self, key: KeyRef<'_>, now: Instant) -> bool {
		self.entries.get(&key).is_some_and(|entry| !entry.is_expired(now))
	}

	/// Insert or replace an entry, then evict from the LRU tail while over budget.
	pub fn insert(&mut self, key: HashedKey, mut entry: CacheEntry<V>) -> InsertOutcome {
		let replaced = match self.entries.remove(&key) {
			Some(old) => {
				self.order.remove(&old.stamp);
				self.used_bytes -= old.weight;
				true
			}
			None => false,
		};

		entry.stamp = self.bump();
		self.used_bytes += entry.weight;
		self.order.insert(entry.stamp, key.clone());
		self.entries.insert(key, entry);

		InsertOutcome {
			replaced,
			evicted: self.evict(),
		}
	}

	/// Evict least-recently-used entries until `used_bytes <= capacity_bytes`.
	fn evict(&mut self) -> usize {
		let mut evicted = 0;
		while self.capacity_bytes > 0 && self.used_bytes > self.capacity_bytes {
			let Some((_, key)) = self.order.pop_first() else {
				break;
			};
			if let Some(entry) = self.entries.remove(&key) {
				self.used_bytes -= entry.weight;
				evicted += 1;
			}
		}
		evicted
	}

	/// Remove a key. Returns true if it was present.
	pub fn remove(&mut self, key: KeyRef<'_>) -> bool {
		match self.entries.remove(&key) {
			Some(entry) => {
				self.order.remove(&entry.stamp);
				self.used_bytes -= entry.weight;
				true
			}
			None => false,
		}
	}

	/// Drop every entry. Returns how many were removed.
	pub fn clear(&mut self) -> usize {
		let count = self.entries.len();
		self.entries.clear();
		self.order.clear();
		self.used_bytes = 0;
		count
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn used_bytes(&self) -> u64 {
		self.used_bytes
	}
}
