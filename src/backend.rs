//! Key/value backend contract and the adapters built on the cache engine.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::cache::Cache;
use crate::error::Result;
use crate::traits::CacheValue;

/// A key/value store with per-entry TTL.
///
/// A missing key is `Ok(None)`, never an error. Implementations decide what a
/// zero `ttl` means; the in-process backends treat it as "never expires".
#[async_trait]
pub trait Backend<V: Send + 'static>: Send + Sync {
	async fn get(&self, key: &str) -> Result<Option<V>>;

	/// Store a value. Returns whether the store accepted it.
	async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<bool>;

	/// Remove a key. Returns whether it was present.
	async fn del(&self, key: &str) -> Result<bool>;
}

#[async_trait]
impl<V, B> Backend<V> for Arc<B>
where
	V: Send + 'static,
	B: Backend<V> + ?Sized,
{
	async fn get(&self, key: &str) -> Result<Option<V>> {
		(**self).get(key).await
	}

	async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<bool> {
		(**self).set(key, value, ttl).await
	}

	async fn del(&self, key: &str) -> Result<bool> {
		(**self).del(key).await
	}
}

/// Qualify `key` with a namespace as `{namespace}key`. An empty namespace leaves
/// the key unchanged.
///
/// ```
/// assert_eq!(cachepool::namespaced_key("users", "42"), "{users}42");
/// assert_eq!(cachepool::namespaced_key("", "42"), "42");
/// ```
pub fn namespaced_key<'a>(namespace: &str, key: &'a str) -> Cow<'a, str> {
	if namespace.is_empty() {
		Cow::Borrowed(key)
	} else {
		Cow::Owned(format!("{{{namespace}}}{key}"))
	}
}

/// Wraps a backend so every key is qualified with a namespace.
pub struct Namespaced<B> {
	namespace: String,
	inner: B,
}

impl<B> Namespaced<B> {
	pub fn new(namespace: impl Into<String>, inner: B) -> Self {
		Self {
			namespace: namespace.into(),
			inner,
		}
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	pub fn into_inner(self) -> B {
		self.inner
	}
}

#[async_trait]
impl<V, B> Backend<V> for Namespaced<B>
where
	V: Send + 'static,
	B: Backend<V>,
{
	async fn get(&self, key: &str) -> Result<Option<V>> {
		self.inner.get(&namespaced_key(&self.namespace, key)).await
	}

	async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<bool> {
		self.inner.set(&namespaced_key(&self.namespace, key), value, ttl).await
	}

	async fn del(&self, key: &str) -> Result<bool> {
		self.inner.del(&namespaced_key(&self.namespace, key)).await
	}
}

/// In-process [`Backend`] over a [`Cache`].
#[derive(Clone)]
pub struct MemoryBackend<V> {
	cache: Cache<V>,
}

impl<V: CacheValue> MemoryBackend<V> {
	pub fn new(cache: Cache<V>) -> Self {
		Self {
			cache,
		}
	}

	pub fn cache(&self) -> &Cache<V> {
		&self.cache
	}
}

impl<V: CacheValue> Default for MemoryBackend<V> {
	fn default() -> Self {
		Self::new(Cache::new(0))
	}
}

#[async_trait]
impl<V: CacheValue> Backend<V> for MemoryBackend<V> {
	async fn get(&self, key: &str) -> Result<Option<V>> {
		Ok(self.cache.get(key).flatten())
	}

	async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<bool> {
		self.cache.set_with_ttl(key, value, ttl);
		Ok(true)
	}

	async fn del(&self, key: &str) -> Result<bool> {
		Ok(self.cache.delete(key))
	}
}

/// Encoding of a value in a string backend.
///
/// Carries its own deadline so stores without native expiry still honor the TTL.
#[derive(Serialize, Deserialize)]
struct Envelope<V> {
	value: V,
	/// Unix time in milliseconds; absent for values that never expire.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	expires_at: Option<u64>,
}

fn unix_millis() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map_or(0, |elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Namespaced cache with an optional remote string store.
///
/// With a remote configured, values are written to it as JSON and the local
/// cache only takes writes the remote rejected. Reads check the local cache
/// first. Remote failures never fail a read or write: a failed read is a miss,
/// a failed write falls back to the local cache.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cachepool::{Backend, DefaultCache, MemoryBackend};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cachepool::Result<()> {
/// let users: DefaultCache<Vec<u8>> =
///     DefaultCache::new("users").with_remote(MemoryBackend::<String>::default());
///
/// users.set("42", vec![1, 2, 3], Duration::from_secs(60)).await?;
/// assert_eq!(users.get("42").await?, Some(vec![1, 2, 3]));
/// # Ok(())
/// # }
/// ```
pub struct DefaultCache<V> {
	namespace: String,
	local: Cache<V>,
	remote: Option<Arc<dyn Backend<String>>>,
}

impl<V> DefaultCache<V>
where
	V: CacheValue + Serialize + DeserializeOwned,
{
	/// Local-only cache under `namespace`.
	pub fn new(namespace: impl Into<String>) -> Self {
		Self::with_local(namespace, Cache::new(0))
	}

	/// Use an existing local cache, for example one shared between namespaces.
	pub fn with_local(namespace: impl Into<String>, local: Cache<V>) -> Self {
		Self {
			namespace: namespace.into(),
			local,
			remote: None,
		}
	}

	/// Store values in `remote`, keeping the local cache as a fallback.
	pub fn with_remote(mut self, remote: impl Backend<String> + 'static) -> Self {
		self.remote = Some(Arc::new(remote));
		self
	}

	pub fn namespace(&self) -> &str {
		&self.namespace
	}

	fn decode(&self, key: &str, encoded: &str) -> Result<Option<V>> {
		let envelope: Envelope<V> = serde_json::from_str(encoded)?;
		match envelope.expires_at {
			Some(deadline) if unix_millis() > deadline => {
				trace!(key, "remote value past its deadline");
				Ok(None)
			}
			_ => Ok(Some(envelope.value)),
		}
	}
}

#[async_trait]
impl<V> Backend<V> for DefaultCache<V>
where
	V: CacheValue + Serialize + DeserializeOwned,
{
	async fn get(&self, key: &str) -> Result<Option<V>> {
		let key = namespaced_key(&self.namespace, key);
		if let Some(value) = self.local.get(&key).flatten() {
			return Ok(Some(value));
		}
		let Some(remote) = &self.remote else {
			return Ok(None);
		};

		match remote.get(&key).await {
			Ok(Some(encoded)) => self.decode(&key, &encoded),
			Ok(None) => Ok(None),
			Err(error) => {
				warn!(key = &*key, %error, "remote cache read failed, treating as miss");
				Ok(None)
			}
		}
	}

	async fn set(&self, key: &str, value: V, ttl: Duration) -> Result<bool> {
		let key = namespaced_key(&self.namespace, key);
		if let Some(remote) = &self.remote {
			let envelope = Envelope {
				value: &value,
				expires_at: (!ttl.is_zero())
					.then(|| unix_millis().saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX))),
			};
			let encoded = serde_json::to_string(&envelope)?;
			match remote.set(&key, encoded, ttl).await {
				Ok(true) => {
					// A copy from an earlier fallback write would shadow this one.
					self.local.delete(&key);
					return Ok(true);
				}
				Ok(false) => warn!(key = &*key, "remote cache rejected write, storing locally"),
				Err(error) => warn!(key = &*key, %error, "remote cache write failed, storing locally"),
			}
		}

		self.local.set_with_ttl(&key, value, ttl);
		Ok(true)
	}

	async fn del(&self, key: &str) -> Result<bool> {
		let key = namespaced_key(&self.namespace, key);
		let local = self.local.delete(&key);
		let remote = match &self.remote {
			Some(remote) => remote.del(&key).await.unwrap_or_else(|error| {
				warn!(key = &*key, %error, "remote cache delete failed");
				false
			}),
			None => false,
		};
		Ok(local || remote)
	}
}
