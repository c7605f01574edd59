use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use cachepool::{BoxError, Error, Pool, PoolBuilder, PoolStats};

#[derive(Debug)]
struct Conn {
	id: usize,
	healthy: AtomicBool,
}

#[derive(Default)]
struct Tracker {
	created: AtomicUsize,
	destroyed: AtomicUsize,
}

fn pool_with(tracker: &Arc<Tracker>, configure: impl FnOnce(PoolBuilder<Conn>) -> PoolBuilder<Conn>) -> Pool<Conn> {
	let created = tracker.clone();
	let destroyed = tracker.clone();
	let builder = Pool::builder(move || {
		Ok::<_, BoxError>(Conn {
			id: created.created.fetch_add(1, Ordering::SeqCst),
			healthy: AtomicBool::new(true),
		})
	})
	.health_check(|conn: &Conn| {
		if conn.healthy.load(Ordering::SeqCst) {
			Ok(())
		} else {
			Err(std::io::Error::other("connection reset"))
		}
	})
	.destroy(move |_: &Conn| {
		destroyed.destroyed.fetch_add(1, Ordering::SeqCst);
		Ok::<_, BoxError>(())
	});
	configure(builder).build()
}

fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.with_test_writer()
		.try_init();
}

/// Poll until `condition` holds, letting paused time advance between checks.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
	for _ in 0..100 {
		if condition() {
			return true;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	condition()
}

#[test]
fn test_capacity_and_overflow() {
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| builder.max_size(2));

	let resources: Vec<_> = std::thread::scope(|scope| {
		let handles: Vec<_> = (0..3).map(|_| scope.spawn(|| pool.get().unwrap())).collect();
		handles.into_iter().map(|handle| handle.join().unwrap()).collect()
	});

	assert_eq!(
		pool.stats(),
		PoolStats {
			checked_out: 2,
			overflow: 1,
			..Default::default()
		}
	);

	std::thread::scope(|scope| {
		for resource in resources {
			let pool = &pool;
			scope.spawn(move || pool.put(resource));
		}
	});

	let stats = pool.stats();
	assert!(stats.idle <= pool.max_size());
	assert_eq!(stats.checked_out + stats.overflow + stats.pending_close, 0);
	assert_eq!(stats.idle + tracker.destroyed.load(Ordering::SeqCst), 3);
}

#[test]
fn test_get_never_blocks_when_full() {
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| builder.max_size(1));

	let held: Vec<_> = (0..5).map(|_| pool.get().unwrap()).collect();

	assert_eq!(held.len(), 5);
	assert_eq!(pool.stats().checked_out, 1);
	assert_eq!(pool.stats().overflow, 4);
}

#[test]
fn test_factory_error_is_returned_verbatim() {
	let pool: Pool<u32> = Pool::builder(|| Err::<u32, _>(std::io::Error::other("too many connections"))).build();

	let err = pool.get().unwrap_err();

	assert!(matches!(err, Error::Create(_)));
	assert_eq!(err.to_string(), "too many connections");
	assert_eq!(pool.stats(), PoolStats::default());
}

#[test]
fn test_exec_propagates_callback_error() {
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| builder);

	let result: Result<usize, BoxError> = pool.exec(|conn| {
		if conn.id == 0 {
			Err("query failed".into())
		} else {
			Ok(conn.id)
		}
	});

	assert_eq!(result.unwrap_err().to_string(), "query failed");
	assert_eq!(pool.stats().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn test_exec_async_returns_resource_when_cancelled() {
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| builder);

	let timed_out = tokio::time::timeout(
		Duration::from_millis(10),
		pool.exec_async(|_conn| async {
			tokio::time::sleep(Duration::from_secs(1)).await;
			Ok::<_, Error>(())
		}),
	)
	.await;

	assert!(timed_out.is_err());
	assert_eq!(pool.stats().idle, 1);
	assert_eq!(pool.stats().checked_out, 0);
}

#[tokio::test(start_paused = true)]
async fn test_delayed_close_waits_for_grace_period() {
	init_tracing();
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| {
		builder.max_usage(Duration::from_millis(100)).close_sweep_interval(Duration::from_millis(10))
	});

	let conn = pool.get().unwrap();
	pool.discard(conn.clone());

	tokio::time::sleep(Duration::from_millis(50)).await;
	assert!(!conn.is_destroyed());
	assert_eq!(pool.stats().pending_close, 1);

	tokio::time::sleep(Duration::from_millis(60)).await;
	assert!(eventually(|| conn.is_destroyed()).await);
	assert_eq!(tracker.destroyed.load(Ordering::SeqCst), 1);
	assert_eq!(pool.stats().live(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_checkout_is_reclaimed() {
	init_tracing();
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| {
		builder.max_usage(Duration::from_millis(50)).reclaim_interval(Duration::from_millis(10))
	});

	let _forgotten = pool.get().unwrap();

	tokio::time::sleep(Duration::from_millis(60)).await;
	assert!(eventually(|| pool.stats().idle == 1).await);
	assert_eq!(pool.stats().checked_out, 0);
}

#[tokio::test(start_paused = true)]
async fn test_reclaim_can_be_disabled() {
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| {
		builder
			.max_usage(Duration::from_millis(50))
			.reclaim_interval(Duration::from_millis(10))
			.reclaim_abandoned(false)
	});

	let _held = pool.get().unwrap();
	tokio::time::sleep(Duration::from_millis(200)).await;

	assert_eq!(pool.stats().checked_out, 1);
	assert_eq!(pool.stats().idle, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_idle_resource_is_replaced() {
	init_tracing();
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| builder.health_check_interval(Duration::from_millis(10)));

	let conn = pool.get().unwrap();
	conn.healthy.store(false, Ordering::SeqCst);
	pool.put(conn.clone());

	assert!(eventually(|| conn.is_destroyed()).await);
	assert_eq!(pool.stats().idle, 1);
	assert_eq!(tracker.created.load(Ordering::SeqCst), 2);

	let replacement = pool.get().unwrap();
	assert_eq!(replacement.id, 1);
	assert_ne!(replacement.id(), conn.id());
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_resource_kept_when_replacement_fails() {
	init_tracing();
	let created = Arc::new(AtomicUsize::new(0));
	let factory_up = Arc::new(AtomicBool::new(true));
	let destroyed = Arc::new(AtomicUsize::new(0));

	let pool = {
		let created = created.clone();
		let factory_up = factory_up.clone();
		let destroyed = destroyed.clone();
		Pool::builder(move || {
			if !factory_up.load(Ordering::SeqCst) {
				return Err::<Conn, BoxError>("server unreachable".into());
			}
			Ok(Conn {
				id: created.fetch_add(1, Ordering::SeqCst),
				healthy: AtomicBool::new(true),
			})
		})
		.health_check(|conn: &Conn| {
			if conn.healthy.load(Ordering::SeqCst) {
				Ok(())
			} else {
				Err(std::io::Error::other("connection reset"))
			}
		})
		.destroy(move |_: &Conn| {
			destroyed.fetch_add(1, Ordering::SeqCst);
			Ok::<_, BoxError>(())
		})
		.health_check_interval(Duration::from_millis(10))
		.build()
	};

	let conn = pool.get().unwrap();
	factory_up.store(false, Ordering::SeqCst);
	conn.healthy.store(false, Ordering::SeqCst);
	pool.put(conn.clone());

	tokio::time::sleep(Duration::from_millis(100)).await;
	assert!(!conn.is_destroyed());
	assert_eq!(destroyed.load(Ordering::SeqCst), 0);
	assert_eq!(pool.stats().idle, 1);
	assert_eq!(created.load(Ordering::SeqCst), 1);

	factory_up.store(true, Ordering::SeqCst);
	assert!(eventually(|| conn.is_destroyed()).await);
	assert_eq!(pool.stats().idle, 1);
	assert_eq!(pool.get().unwrap().id, 1);
}

#[tokio::test]
async fn test_close_destroys_all_and_rejects_gets() {
	let tracker = Arc::new(Tracker::default());
	let pool = pool_with(&tracker, |builder| builder.max_size(1));

	let first = pool.get().unwrap();
	let overflow = pool.get().unwrap();
	pool.put(first);
	let reused = pool.get().unwrap();
	let _ = pool.get().unwrap();
	assert_eq!(tracker.created.load(Ordering::SeqCst), 3);

	pool.close();

	assert!(pool.is_closed());
	assert_eq!(pool.stats(), PoolStats::default());
	assert_eq!(tracker.destroyed.load(Ordering::SeqCst), tracker.created.load(Ordering::SeqCst));
	assert!(matches!(pool.get(), Err(Error::PoolClosed)));

	pool.put(reused);
	pool.put(overflow);
	assert_eq!(tracker.destroyed.load(Ordering::SeqCst), tracker.created.load(Ordering::SeqCst));
}
