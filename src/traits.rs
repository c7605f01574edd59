use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BoxError;

/// Trait for values stored in a [`Cache`](crate::Cache).
///
/// The weight is what the value costs against the shard's byte budget.
/// Text and byte buffers weigh their length; everything else weighs 1 unless
/// the implementation says otherwise, or a custom weigher is configured on the
/// [`CacheBuilder`](crate::CacheBuilder).
///
/// # Example
///
/// ```
/// use cachepool::CacheValue;
///
/// #[derive(Clone)]
/// struct Profile {
///     name: String,
///     bio: String,
/// }
///
/// impl CacheValue for Profile {
///     fn weight(&self) -> u64 {
///         (self.name.len() + self.bio.len()) as u64
///     }
/// }
/// ```
pub trait CacheValue: Clone + Send + Sync + 'static {
	/// Capacity consumed by this value.
	fn weight(&self) -> u64 {
		1
	}
}

macro_rules! unit_weight {
	($($ty:ty),* $(,)?) => {
		$(impl CacheValue for $ty {})*
	};
}

unit_weight!(bool, char, u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl CacheValue for String {
	fn weight(&self) -> u64 {
		self.len() as u64
	}
}

impl CacheValue for Arc<str> {
	fn weight(&self) -> u64 {
		self.len() as u64
	}
}

impl CacheValue for &'static str {
	fn weight(&self) -> u64 {
		self.len() as u64
	}
}

impl CacheValue for Vec<u8> {
	fn weight(&self) -> u64 {
		self.len() as u64
	}
}

impl CacheValue for Arc<[u8]> {
	fn weight(&self) -> u64 {
		self.len() as u64
	}
}

impl<T: CacheValue> CacheValue for Arc<T> {
	fn weight(&self) -> u64 {
		(**self).weight()
	}
}

/// Custom weigher overriding [`CacheValue::weight`].
pub type Weigher<V> = Arc<dyn Fn(&str, &V) -> u64 + Send + Sync>;

/// Best-effort persistence target for cached values.
///
/// `save` is called in the background after every write; its errors are logged
/// and never reach the cache caller. `load` is consulted on a miss before the
/// loader runs.
#[async_trait]
pub trait Persister<V>: Send + Sync + 'static {
	/// Persist a value.
	async fn save(&self, key: &str, value: &V) -> Result<(), BoxError>;

	/// Fetch a previously persisted value.
	async fn load(&self, key: &str) -> Option<V>;
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_text_weighs_its_length() {
		assert_eq!("hello".to_string().weight(), 5);
		assert_eq!(vec![0u8; 12].weight(), 12);
		assert_eq!(Arc::new("abc".to_string()).weight(), 3);
	}

	#[test]
	fn test_other_values_weigh_one() {
		assert_eq!(42u64.weight(), 1);
		assert_eq!(true.weight(), 1);
	}
}
