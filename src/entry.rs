use std::time::Duration;

use tokio::time::Instant;

/// A value stored in a shard.
///
/// `value` is `None` when the loader reported that the key legitimately has no
/// value; the absence itself is cached so repeated loads are dampened.
pub(crate) struct CacheEntry<V> {
	pub value: Option<V>,
	/// Zero means the entry never expires.
	pub ttl: Duration,
	pub expires_at: Instant,
	pub weight: u64,
	/// Position in the shard's recency order.
	pub stamp: u64,
}

impl<V> CacheEntry<V> {
	pub fn new(value: Option<V>, ttl: Duration, weight: u64, now: Instant) -> Self {
		Self {
			value,
			ttl,
			expires_at: now + ttl,
			weight,
			stamp: 0,
		}
	}

	pub fn is_expired(&self, now: Instant) -> bool {
		!self.ttl.is_zero() && now > self.expires_at
	}

	/// Lifetime left before expiry, `None` for entries that never expire.
	pub fn remaining(&self, now: Instant) -> Option<Duration> {
		if self.ttl.is_zero() {
			None
		} else {
			Some(self.expires_at.saturating_duration_since(now))
		}
	}
}

/// Point-in-time copy of an entry handed out of the shard lock.
pub(crate) struct Snapshot<V> {
	pub value: Option<V>,
	pub ttl: Duration,
	pub remaining: Option<Duration>,
}

/// What a loader produced for a key.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cachepool::Loaded;
///
/// let found = Loaded::value("alice".to_string()).with_ttl(Duration::from_secs(30));
/// let missing: Loaded<String> = Loaded::empty();
/// assert!(found.is_some());
/// assert!(!missing.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded<V> {
	pub(crate) value: Option<V>,
	pub(crate) ttl: Option<Duration>,
}

impl<V> Loaded<V> {
	/// A found value, cached with the default TTL unless overridden.
	pub fn value(value: V) -> Self {
		Self {
			value: Some(value),
			ttl: None,
		}
	}

	/// The key has no value. Cached with the empty-result TTL.
	pub fn empty() -> Self {
		Self {
			value: None,
			ttl: None,
		}
	}

	/// Override the TTL for a found value. Ignored for empty results.
	pub fn with_ttl(mut self, ttl: Duration) -> Self {
		self.ttl = Some(ttl);
		self
	}

	pub fn is_some(&self) -> bool {
		self.value.is_some()
	}
}

impl<V> From<Option<V>> for Loaded<V> {
	fn from(value: Option<V>) -> Self {
		Self {
			value,
			ttl: None,
		}
	}
}
