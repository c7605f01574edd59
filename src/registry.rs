//! Named pools with an explicit lifecycle.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::backend::namespaced_key;
use crate::pool::Pool;

/// Registry of pools addressed by namespace and name.
///
/// A pool is closed when it is replaced or removed. Pools still registered when
/// the registry is dropped are left running; call [`close_all`](Self::close_all)
/// to shut them down.
///
/// # Example
///
/// ```
/// use cachepool::{Pool, PoolRegistry};
///
/// let registry = PoolRegistry::new();
/// let pool = registry.get_or_insert_with("db", "primary", || {
///     Pool::builder(|| Ok::<_, std::io::Error>(0u32)).build()
/// });
/// assert!(registry.get("db", "primary").is_some());
///
/// registry.close_all();
/// assert!(pool.is_closed());
/// ```
pub struct PoolRegistry<T> {
	pools: Mutex<HashMap<Arc<str>, Pool<T>, ahash::RandomState>>,
}

impl<T: Send + Sync + 'static> PoolRegistry<T> {
	pub fn new() -> Self {
		Self {
			pools: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
		}
	}

	/// Register `pool`, closing any pool it replaces.
	pub fn set(&self, namespace: &str, name: &str, pool: Pool<T>) {
		let key = namespaced_key(namespace, name);
		let previous = self.pools.lock().insert(Arc::from(key.as_ref()), pool);
		if let Some(previous) = previous {
			debug!(pool = &*key, "replacing registered pool");
			previous.close();
		}
	}

	pub fn get(&self, namespace: &str, name: &str) -> Option<Pool<T>> {
		self.pools.lock().get(namespaced_key(namespace, name).as_ref()).cloned()
	}

	/// Return the registered pool, building and registering one if absent.
	///
	/// `build` runs under the registry lock, so concurrent callers register at
	/// most one pool per name.
	pub fn get_or_insert_with(&self, namespace: &str, name: &str, build: impl FnOnce() -> Pool<T>) -> Pool<T> {
		let key = namespaced_key(namespace, name);
		let mut pools = self.pools.lock();
		if let Some(pool) = pools.get(key.as_ref()) {
			return pool.clone();
		}
		let pool = build();
		pools.insert(Arc::from(key.as_ref()), pool.clone());
		pool
	}

	/// Unregister and close a pool. Returns whether one was registered.
	pub fn remove(&self, namespace: &str, name: &str) -> bool {
		let removed = self.pools.lock().remove(namespaced_key(namespace, name).as_ref());
		match removed {
			Some(pool) => {
				pool.close();
				true
			}
			None => false,
		}
	}

	/// Close and unregister every pool.
	pub fn close_all(&self) {
		let pools: Vec<Pool<T>> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
		debug!(pools = pools.len(), "closing all registered pools");
		for pool in pools {
			pool.close();
		}
	}

	pub fn len(&self) -> usize {
		self.pools.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl<T: Send + Sync + 'static> Default for PoolRegistry<T> {
	fn default() -> Self {
		Self::new()
	}
}
