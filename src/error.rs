//! Error types shared by the cache and pool engines.

use std::sync::Arc;

/// Boxed error returned by user-supplied callbacks (loaders, factories, persisters).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared form of a callback error. Cloned out to every caller that observed it.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the cache and pool engines.
///
/// Absence of a cache entry is never an error; lookups return `Option` instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
	/// The loader failed. Every caller that was deduplicated onto the same load
	/// receives this same error.
	#[error(transparent)]
	Load(SharedError),

	/// The task running the load ended without producing an outcome (it panicked).
	#[error("load of `{key}` was abandoned before completing")]
	LoadAbandoned {
		key: String,
	},

	/// The caller stopped waiting for an in-flight load.
	#[error("wait for `{key}` was cancelled")]
	Cancelled {
		key: String,
	},

	/// The pool factory failed to create a resource.
	#[error(transparent)]
	Create(SharedError),

	/// The pool has been closed and can no longer hand out resources.
	#[error("pool is closed")]
	PoolClosed,

	/// A storage backend failed.
	#[error("backend error: {0}")]
	Backend(SharedError),

	/// A value could not be encoded or decoded for a string backend.
	#[error("codec error: {0}")]
	Codec(Arc<serde_json::Error>),
}

impl Error {
	pub(crate) fn load(err: BoxError) -> Self {
		Self::Load(Arc::from(err))
	}

	pub(crate) fn create(err: BoxError) -> Self {
		Self::Create(Arc::from(err))
	}

	/// Wrap an adapter failure.
	pub fn backend(err: impl Into<BoxError>) -> Self {
		Self::Backend(Arc::from(err.into()))
	}
}

impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Codec(Arc::new(err))
	}
}
