//! Generic resource pool.
//!
//! Every resource handed out by a [`Pool`] is in exactly one of four sets:
//!
//! - **idle**: available for checkout.
//! - **checked out**: in use, counted against `max_size`.
//! - **overflow**: created while the pool was full. Not counted against
//!   `max_size`; absorbed into idle on return if there is room, destroyed
//!   otherwise.
//! - **pending close**: slated for destruction but possibly still referenced by
//!   a caller. Destroyed by a background sweep once it has waited `max_usage`.
//!
//! All four sets live behind one lock so a move between sets is atomic. The lock
//! is never held while a factory, health check or destructor runs.
//!
//! # Background maintenance
//!
//! Three ticker tasks run for the life of the pool when it is built inside a
//! tokio runtime: the idle health check (only with a health checker), the
//! overdue-checkout reclaim, and the pending-close sweep. They hold only a weak
//! reference to the pool and stop on [`Pool::close`] or when the last handle is
//! dropped. Callbacks run on the blocking thread pool.
//!
//! # Abandoned checkouts
//!
//! The reclaim task returns any checked-out or overflow resource whose last
//! checkout is older than `max_usage`, on the assumption that the caller forgot
//! to return it. A caller that is merely slow can therefore have its resource
//! handed to someone else mid-use. Disable with
//! [`PoolBuilder::reclaim_abandoned`] if callers may legitimately hold
//! resources that long.

use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::builder::PoolBuilder;
use crate::error::{BoxError, Error, Result};

/// Creates a new resource.
pub type Factory<T> = Arc<dyn Fn() -> Result<T, BoxError> + Send + Sync>;

/// Health check or destructor for a resource.
pub type Hook<T> = Arc<dyn Fn(&T) -> Result<(), BoxError> + Send + Sync>;

type Id = Arc<str>;
type Set<T> = HashMap<Id, Resource<T>, ahash::RandomState>;

/// A pooled resource.
///
/// Cloning the handle does not clone the resource. Return it with
/// [`Pool::put`] when done; returning the same handle twice is harmless.
pub struct Resource<T> {
	slot: Arc<Slot<T>>,
}

struct Slot<T> {
	id: Id,
	payload: T,
	created_at: Instant,
	last_used: Mutex<Instant>,
	destroyed: AtomicBool,
}

impl<T> Resource<T> {
	fn new(payload: T) -> Self {
		let now = Instant::now();
		Self {
			slot: Arc::new(Slot {
				id: Arc::from(uuid::Uuid::new_v4().to_string()),
				payload,
				created_at: now,
				last_used: Mutex::new(now),
				destroyed: AtomicBool::new(false),
			}),
		}
	}

	/// Unique identifier of this resource.
	pub fn id(&self) -> &str {
		&self.slot.id
	}

	pub fn get(&self) -> &T {
		&self.slot.payload
	}

	pub fn created_at(&self) -> Instant {
		self.slot.created_at
	}

	/// When this resource was last checked out.
	pub fn last_used(&self) -> Instant {
		*self.slot.last_used.lock()
	}

	/// Whether the destructor has run (or is running) for this resource.
	pub fn is_destroyed(&self) -> bool {
		self.slot.destroyed.load(Ordering::Acquire)
	}

	fn touch(&self, now: Instant) {
		*self.slot.last_used.lock() = now;
	}

	fn key(&self) -> Id {
		self.slot.id.clone()
	}

	/// Claim the right to destroy this resource. True exactly once.
	fn mark_destroyed(&self) -> bool {
		!self.slot.destroyed.swap(true, Ordering::AcqRel)
	}
}

impl<T> Clone for Resource<T> {
	fn clone(&self) -> Self {
		Self {
			slot: self.slot.clone(),
		}
	}
}

impl<T> Deref for Resource<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.slot.payload
	}
}

impl<T: fmt::Debug> fmt::Debug for Resource<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Resource")
			.field("id", &self.slot.id)
			.field("payload", &self.slot.payload)
			.field("destroyed", &self.is_destroyed())
			.finish()
	}
}

/// Point-in-time size of each pool set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
	pub idle: usize,
	pub checked_out: usize,
	pub overflow: usize,
	pub pending_close: usize,
}

impl PoolStats {
	/// Resources that have not been destroyed yet.
	pub fn live(&self) -> usize {
		self.idle + self.checked_out + self.overflow + self.pending_close
	}
}

/// How to dispose of a resource that leaves the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disposal {
	/// Run the destructor now.
	Immediate,
	/// Park in pending close until the sweep destroys it.
	Delayed,
}

struct Sets<T> {
	/// Insertion-ordered so checkout can take the most recently returned.
	idle: IndexMap<Id, Resource<T>, ahash::RandomState>,
	checked_out: Set<T>,
	overflow: Set<T>,
	/// Resource and the time it entered pending close.
	pending_close: HashMap<Id, (Resource<T>, Instant), ahash::RandomState>,
	closed: bool,
}

impl<T> Sets<T> {
	fn new() -> Self {
		Self {
			idle: IndexMap::with_hasher(ahash::RandomState::new()),
			checked_out: HashMap::with_hasher(ahash::RandomState::new()),
			overflow: HashMap::with_hasher(ahash::RandomState::new()),
			pending_close: HashMap::with_hasher(ahash::RandomState::new()),
			closed: false,
		}
	}
}

pub(crate) struct PoolConfig<T> {
	pub factory: Factory<T>,
	pub max_size: usize,
	pub max_usage: Duration,
	pub health_check: Option<Hook<T>>,
	pub destroy: Option<Hook<T>>,
	pub health_check_interval: Duration,
	pub reclaim_interval: Duration,
	pub close_sweep_interval: Duration,
	pub reclaim_abandoned: bool,
}

struct Inner<T> {
	sets: Mutex<Sets<T>>,
	config: PoolConfig<T>,
	shutdown: CancellationToken,
}

impl<T> Drop for Inner<T> {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

/// A bounded pool of reusable resources.
///
/// `get` never waits for capacity: when `max_size` resources are already checked
/// out, a fresh overflow resource is created instead.
///
/// # Example
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use cachepool::Pool;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> cachepool::Result<()> {
/// let next = AtomicUsize::new(0);
/// let pool = Pool::builder(move || Ok::<_, std::io::Error>(next.fetch_add(1, Ordering::Relaxed)))
///     .max_size(2)
///     .build();
///
/// let conn = pool.get()?;
/// assert_eq!(*conn, 0);
/// pool.put(conn);
///
/// let doubled = pool.exec(|conn| Ok::<_, cachepool::Error>(*conn * 2))?;
/// assert_eq!(doubled, 0);
///
/// pool.close();
/// # Ok(())
/// # }
/// ```
pub struct Pool<T> {
	inner: Arc<Inner<T>>,
}

impl<T> Clone for Pool<T> {
	fn clone(&self) -> Self {
		Self {
			inner: self.inner.clone(),
		}
	}
}

impl<T: Send + Sync + 'static> Pool<T> {
	/// Start configuring a pool around `factory`.
	pub fn builder<F, E>(factory: F) -> PoolBuilder<T>
	where
		F: Fn() -> std::result::Result<T, E> + Send + Sync + 'static,
		E: Into<BoxError>,
	{
		PoolBuilder::new(factory)
	}

	pub(crate) fn from_config(config: PoolConfig<T>) -> Self {
		let inner = Arc::new(Inner {
			sets: Mutex::new(Sets::new()),
			config,
			shutdown: CancellationToken::new(),
		});

		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				let config = &inner.config;
				if config.health_check.is_some() {
					spawn_ticker(&runtime, &inner, "health_check", config.health_check_interval, Inner::check_idle);
				}
				if config.reclaim_abandoned {
					spawn_ticker(&runtime, &inner, "reclaim", config.reclaim_interval, Inner::reclaim_overdue);
				}
				spawn_ticker(&runtime, &inner, "close_sweep", config.close_sweep_interval, Inner::sweep_pending_close);
			}
			Err(_) => warn!("pool built outside a tokio runtime, background maintenance is disabled"),
		}

		Self {
			inner,
		}
	}

	/// Check out a resource.
	///
	/// Takes the most recently returned idle resource, or creates one. Fails only
	/// if the factory fails or the pool is closed.
	pub fn get(&self) -> Result<Resource<T>> {
		{
			let mut sets = self.inner.sets.lock();
			if sets.closed {
				return Err(Error::PoolClosed);
			}
			if let Some((id, resource)) = sets.idle.pop() {
				resource.touch(Instant::now());
				sets.checked_out.insert(id, resource.clone());
				return Ok(resource);
			}
		}

		let resource = self.inner.create()?;

		let mut sets = self.inner.sets.lock();
		if sets.closed {
			drop(sets);
			self.inner.destroy(&resource);
			return Err(Error::PoolClosed);
		}
		if sets.checked_out.len() >= self.inner.config.max_size {
			trace!(id = resource.id(), "pool full, handing out overflow resource");
			sets.overflow.insert(resource.key(), resource.clone());
		} else {
			sets.checked_out.insert(resource.key(), resource.clone());
		}
		Ok(resource)
	}

	/// Return a resource to the pool.
	///
	/// An overflow resource is kept only if the pool has room for it; otherwise
	/// it is destroyed. Returning a resource that is already idle, or that the pool
	/// no longer tracks and has destroyed, does nothing.
	pub fn put(&self, resource: Resource<T>) {
		self.inner.put(resource, Disposal::Immediate);
	}

	/// Remove a broken resource from the pool.
	///
	/// The resource is destroyed by the pending-close sweep after `max_usage`, so
	/// other holders of the handle are not cut off mid-use.
	pub fn discard(&self, resource: Resource<T>) {
		{
			let mut sets = self.inner.sets.lock();
			let id = resource.id();
			sets.idle.shift_remove(id);
			sets.checked_out.remove(id);
			sets.overflow.remove(id);
		}
		self.inner.dispose(resource, Disposal::Delayed);
	}

	/// Check out a resource, run `f` on it and return it on every exit path,
	/// including a panic in `f`.
	pub fn exec<R, E>(&self, f: impl FnOnce(&T) -> std::result::Result<R, E>) -> std::result::Result<R, E>
	where
		E: From<Error>,
	{
		let lease = Lease::new(self, self.get()?);
		f(lease.resource().get())
	}

	/// Async form of [`exec`](Pool::exec). The resource is also returned if the
	/// future is dropped before completing.
	pub async fn exec_async<F, Fut, R, E>(&self, f: F) -> std::result::Result<R, E>
	where
		F: FnOnce(Resource<T>) -> Fut,
		Fut: Future<Output = std::result::Result<R, E>>,
		E: From<Error>,
	{
		let lease = Lease::new(self, self.get()?);
		f(lease.resource().clone()).await
	}

	/// Destroy every resource and stop background maintenance.
	///
	/// Idempotent. Every later `get` fails with [`Error::PoolClosed`]; resources
	/// returned after this are dropped.
	pub fn close(&self) {
		let doomed: Vec<Resource<T>> = {
			let mut sets = self.inner.sets.lock();
			if sets.closed {
				return;
			}
			sets.closed = true;
			let mut doomed = Vec::with_capacity(
				sets.idle.len() + sets.checked_out.len() + sets.overflow.len() + sets.pending_close.len(),
			);
			doomed.extend(sets.idle.drain(..).map(|(_, resource)| resource));
			doomed.extend(sets.checked_out.drain().map(|(_, resource)| resource));
			doomed.extend(sets.overflow.drain().map(|(_, resource)| resource));
			doomed.extend(sets.pending_close.drain().map(|(_, (resource, _))| resource));
			doomed
		};

		self.inner.shutdown.cancel();
		debug!(resources = doomed.len(), "closing pool");
		for resource in &doomed {
			self.inner.destroy(resource);
		}
	}

	pub fn is_closed(&self) -> bool {
		self.inner.sets.lock().closed
	}

	pub fn stats(&self) -> PoolStats {
		let sets = self.inner.sets.lock();
		PoolStats {
			idle: sets.idle.len(),
			checked_out: sets.checked_out.len(),
			overflow: sets.overflow.len(),
			pending_close: sets.pending_close.len(),
		}
	}

	pub fn max_size(&self) -> usize {
		self.inner.config.max_size
	}

	pub fn max_usage(&self) -> Duration {
		self.inner.config.max_usage
	}

	#[cfg(test)]
	fn run_health_check(&self) {
		self.inner.check_idle();
	}

	#[cfg(test)]
	fn run_reclaim(&self) {
		self.inner.reclaim_overdue();
	}

	#[cfg(test)]
	fn run_close_sweep(&self) {
		self.inner.sweep_pending_close();
	}
}

impl<T> Inner<T> {
	fn create(&self) -> Result<Resource<T>> {
		let payload = (self.config.factory)().map_err(Error::create)?;
		let resource = Resource::new(payload);
		trace!(id = resource.id(), "created resource");
		Ok(resource)
	}

	fn put(&self, resource: Resource<T>, disposal: Disposal) {
		let id = resource.key();
		{
			let mut sets = self.sets.lock();
			if sets.closed {
				drop(sets);
				self.destroy(&resource);
				return;
			}
			if let Some(resource) = sets.checked_out.remove(&id) {
				sets.idle.insert(id, resource);
				return;
			}
			if let Some(resource) = sets.overflow.remove(&id) {
				if sets.idle.len() + sets.checked_out.len() < self.config.max_size {
					sets.idle.insert(id, resource);
					return;
				}
			} else if sets.idle.contains_key(&id) || sets.pending_close.contains_key(&id) {
				return;
			}
		}

		trace!(id = &*id, "pool over capacity, dropping returned resource");
		self.dispose(resource, disposal);
	}

	fn dispose(&self, resource: Resource<T>, disposal: Disposal) {
		if disposal == Disposal::Delayed {
			let mut sets = self.sets.lock();
			if !sets.closed {
				sets.pending_close.insert(resource.key(), (resource, Instant::now()));
				return;
			}
		}
		self.destroy(&resource);
	}

	/// Run the destructor, at most once per resource.
	fn destroy(&self, resource: &Resource<T>) {
		if !resource.mark_destroyed() {
			return;
		}
		if let Some(destroy) = &self.config.destroy
			&& let Err(error) = destroy(resource.get())
		{
			warn!(id = resource.id(), %error, "failed to destroy resource");
			return;
		}
		trace!(id = resource.id(), "destroyed resource");
	}

	/// Replace idle resources that fail the health check.
	///
	/// A failed resource is kept if no replacement can be created.
	fn check_idle(&self) {
		let Some(check) = &self.config.health_check else {
			return;
		};
		let idle: Vec<Resource<T>> = self.sets.lock().idle.values().cloned().collect();

		for resource in idle {
			let Err(error) = check(resource.get()) else {
				continue;
			};
			warn!(id = resource.id(), %error, "idle resource failed health check");

			let replacement = match self.create() {
				Ok(replacement) => replacement,
				Err(error) => {
					warn!(id = resource.id(), %error, "failed to create replacement resource");
					continue;
				}
			};

			let replaced = {
				let mut sets = self.sets.lock();
				match sets.idle.get_index_of(resource.id()) {
					Some(index) if !sets.closed => {
						let (last, _) = sets.idle.insert_full(replacement.key(), replacement.clone());
						sets.idle.swap_indices(index, last);
						sets.idle.pop();
						true
					}
					_ => false,
				}
			};

			// Checked out (or closed) while the check ran.
			if replaced {
				self.destroy(&resource);
			} else {
				self.destroy(&replacement);
			}
		}
	}

	/// Return checkouts older than `max_usage` to the pool.
	fn reclaim_overdue(&self) {
		let now = Instant::now();
		let max_usage = self.config.max_usage;
		let overdue: Vec<Resource<T>> = {
			let sets = self.sets.lock();
			sets.checked_out
				.values()
				.chain(sets.overflow.values())
				.filter(|resource| now.saturating_duration_since(resource.last_used()) > max_usage)
				.cloned()
				.collect()
		};

		for resource in overdue {
			debug!(id = resource.id(), "reclaiming resource held longer than max usage");
			self.put(resource, Disposal::Delayed);
		}
	}

	/// Destroy pending-close resources that have waited longer than `max_usage`.
	fn sweep_pending_close(&self) {
		let now = Instant::now();
		let max_usage = self.config.max_usage;
		let mut due = Vec::new();
		self.sets.lock().pending_close.retain(|_, (resource, since)| {
			if now.saturating_duration_since(*since) > max_usage {
				due.push(resource.clone());
				false
			} else {
				true
			}
		});

		for resource in &due {
			self.destroy(resource);
		}
	}
}

fn spawn_ticker<T: Send + Sync + 'static>(
	runtime: &tokio::runtime::Handle,
	inner: &Arc<Inner<T>>,
	task: &'static str,
	period: Duration,
	run: fn(&Inner<T>),
) {
	let weak: Weak<Inner<T>> = Arc::downgrade(inner);
	let shutdown = inner.shutdown.clone();
	let period = period.max(Duration::from_millis(1));

	runtime.spawn(async move {
		let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = ticker.tick() => {}
			}
			let Some(inner) = weak.upgrade() else {
				break;
			};
			if let Err(error) = tokio::task::spawn_blocking(move || run(&inner)).await {
				warn!(task, %error, "pool maintenance task failed");
			}
		}
		trace!(task, "pool maintenance task stopped");
	});
}

/// Returns a checked-out resource when dropped.
struct Lease<'a, T: Send + Sync + 'static> {
	pool: &'a Pool<T>,
	resource: Resource<T>,
}

impl<'a, T: Send + Sync + 'static> Lease<'a, T> {
	fn new(pool: &'a Pool<T>, resource: Resource<T>) -> Self {
		Self {
			pool,
			resource,
		}
	}

	fn resource(&self) -> &Resource<T> {
		&self.resource
	}
}

impl<T: Send + Sync + 'static> Drop for Lease<'_, T> {
	fn drop(&mut self) {
		self.pool.put(self.resource.clone());
	}
}
