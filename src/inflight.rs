//! Keyed registry of in-progress loads.
//!
//! The first caller for a key becomes the leader and receives a [`Call`]; the
//! call owns a `watch` channel whose receiver is stored in the registry.
//! Concurrent callers for the same key clone that receiver and wait for the
//! leader's outcome instead of starting their own load. The registry entry is
//! removed when the call completes or is dropped, so the next miss after that
//! starts a fresh load.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Outcome of one load, shared by every caller that waited on it.
pub(crate) type Outcome<V> = Result<Option<V>>;

type Slot<V> = watch::Receiver<Option<Outcome<V>>>;

pub(crate) struct InFlight<V> {
	calls: Mutex<HashMap<Arc<str>, Slot<V>, ahash::RandomState>>,
}

/// Position of a caller relative to the load for its key.
pub(crate) enum Join<V> {
	/// No load was running; the caller must run it and complete the call.
	Leader(Call<V>, Slot<V>),
	/// A load is already running; wait on the receiver.
	Follower(Slot<V>),
}

impl<V: Clone> InFlight<V> {
	pub fn new() -> Self {
		Self {
			calls: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
		}
	}

	/// Join the load for `key`, becoming its leader if none is running.
	pub fn join(self: &Arc<Self>, key: &str) -> Join<V> {
		let mut calls = self.calls.lock();
		if let Some(slot) = calls.get(key) {
			return Join::Follower(slot.clone());
		}
		let (call, slot) = self.register(&mut calls, key);
		Join::Leader(call, slot)
	}

	/// Become the leader for `key` only if nothing is in flight for it.
	pub fn try_lead(self: &Arc<Self>, key: &str) -> Option<Call<V>> {
		let mut calls = self.calls.lock();
		if calls.contains_key(key) {
			return None;
		}
		let (call, _) = self.register(&mut calls, key);
		Some(call)
	}

	fn register(
		self: &Arc<Self>,
		calls: &mut HashMap<Arc<str>, Slot<V>, ahash::RandomState>,
		key: &str,
	) -> (Call<V>, Slot<V>) {
		let key: Arc<str> = Arc::from(key);
		let (tx, rx) = watch::channel(None);
		calls.insert(key.clone(), rx.clone());
		let call = Call {
			flight: self.clone(),
			key,
			tx,
		};
		(call, rx)
	}

	pub fn contains(&self, key: &str) -> bool {
		self.calls.lock().contains_key(key)
	}

	#[cfg(test)]
	pub fn len(&self) -> usize {
		self.calls.lock().len()
	}
}

/// Leadership of one in-flight load.
///
/// Dropping a call without completing it (the leader panicked) wakes every
/// waiter with [`Error::LoadAbandoned`].
pub(crate) struct Call<V> {
	flight: Arc<InFlight<V>>,
	key: Arc<str>,
	tx: watch::Sender<Option<Outcome<V>>>,
}

impl<V> Call<V> {
	pub fn key(&self) -> &str {
		&self.key
	}

	/// Publish the outcome to every waiter and retire the registry entry.
	pub fn complete(self, outcome: Outcome<V>) {
		self.tx.send_replace(Some(outcome));
	}
}

impl<V> Drop for Call<V> {
	fn drop(&mut self) {
		self.flight.calls.lock().remove(&self.key);
	}
}

/// Wait for the outcome published on `slot`.
pub(crate) async fn wait<V: Clone>(mut slot: Slot<V>, key: &str) -> Outcome<V> {
	match slot.wait_for(Option::is_some).await {
		Ok(outcome) => match &*outcome {
			Some(outcome) => outcome.clone(),
			None => Err(Error::LoadAbandoned {
				key: key.to_owned(),
			}),
		},
		Err(_) => Err(Error::LoadAbandoned {
			key: key.to_owned(),
		}),
	}
}

/// Like [`wait`], giving up with [`Error::Cancelled`] once `token` fires.
pub(crate) async fn wait_cancellable<V: Clone>(
	slot: Slot<V>,
	key: &str,
	token: &CancellationToken,
) -> Outcome<V> {
	tokio::select! {
		outcome = wait(slot, key) => outcome,
		() = token.cancelled() => Err(Error::Cancelled {
			key: key.to_owned(),
		}),
	}
}
