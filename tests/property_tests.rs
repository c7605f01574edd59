use std::collections::VecDeque;

use cachepool::Cache;
use proptest::prelude::*;

#[derive(Clone, Debug)]
enum Op {
	Set(u8, u64),
	Get(u8),
	Delete(u8),
}

fn op() -> impl Strategy<Value = Op> {
	prop_oneof![
		(0u8..16, 1u64..40).prop_map(|(key, weight)| Op::Set(key, weight)),
		(0u8..16).prop_map(Op::Get),
		(0u8..16).prop_map(Op::Delete),
	]
}

/// Reference LRU: front is least recently used.
#[derive(Default)]
struct Model {
	entries: VecDeque<(u8, u64)>,
	capacity: u64,
}

impl Model {
	fn used(&self) -> u64 {
		self.entries.iter().map(|(_, weight)| weight).sum()
	}

	fn take(&mut self, key: u8) -> Option<(u8, u64)> {
		let index = self.entries.iter().position(|(k, _)| *k == key)?;
		self.entries.remove(index)
	}

	fn set(&mut self, key: u8, weight: u64) {
		self.take(key);
		self.entries.push_back((key, weight));
		while self.used() > self.capacity {
			self.entries.pop_front();
		}
	}

	fn get(&mut self, key: u8) -> Option<u64> {
		let entry = self.take(key)?;
		self.entries.push_back(entry);
		Some(entry.1)
	}
}

proptest! {
	#[test]
	fn test_single_shard_matches_reference_lru(
		capacity in 1u64..200,
		ops in prop::collection::vec(op(), 1..200),
	) {
		let cache: Cache<u64> = Cache::builder(capacity).shards(1).weigher(|_, weight| *weight).build();
		let mut model = Model { capacity, ..Default::default() };

		for op in ops {
			match op {
				Op::Set(key, weight) => {
					cache.set(&key.to_string(), weight);
					model.set(key, weight);
				}
				Op::Get(key) => {
					prop_assert_eq!(cache.get(&key.to_string()).flatten(), model.get(key));
				}
				Op::Delete(key) => {
					prop_assert_eq!(cache.delete(&key.to_string()), model.take(key).is_some());
				}
			}

			prop_assert_eq!(cache.size(), model.used());
			prop_assert_eq!(cache.len(), model.entries.len());
			prop_assert!(cache.size() <= capacity);
		}
	}

	#[test]
	fn test_size_accounting_across_shards(
		ops in prop::collection::vec((0u16..500, 1u64..64), 1..300),
		shards in 1usize..16,
	) {
		let capacity = 4096;
		let cache: Cache<u64> = Cache::builder(capacity).shards(shards).weigher(|_, weight| *weight).build();
		let per_shard = capacity / cache.shard_count() as u64;

		for (key, weight) in ops {
			cache.set(&key.to_string(), weight);
		}

		let metrics = cache.metrics();
		prop_assert_eq!(metrics.current_size_bytes, cache.size());
		prop_assert_eq!(metrics.entry_count, cache.len());
		prop_assert!(cache.size() <= per_shard * cache.shard_count() as u64);
		prop_assert_eq!(
			(0..cache.shard_count()).map(|index| cache.shard_len(index)).sum::<usize>(),
			cache.len()
		);
	}

	#[test]
	fn test_purge_resets_accounting(keys in prop::collection::hash_set(0u32..1000, 1..100)) {
		let cache: Cache<String> = Cache::new(0);
		for key in &keys {
			cache.set(&key.to_string(), format!("value-{key}"));
		}
		prop_assert_eq!(cache.len(), keys.len());

		cache.purge();

		prop_assert_eq!(cache.len(), 0);
		prop_assert_eq!(cache.size(), 0);
		prop_assert_eq!(cache.metrics().removals, keys.len() as u64);
	}
}
