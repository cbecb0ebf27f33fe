//! Reference counting, open cancellation and close hooks of one resource.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{Gate, Probe, connection, eventually, init_tracing};
use parking_lot::Mutex;
use refshare::{CancellationToken, Closable, Error, Phase, RefCounted};

fn ready(probe: &Arc<Probe>) -> RefCounted<String> {
	connection(probe, &Gate::open(), "conn")
}

#[tokio::test]
async fn test_count_tracks_live_handles() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let pool = ready(&probe);

	let a = pool.open().await.unwrap();
	let b = pool.open().await.unwrap();
	assert_eq!(pool.snapshot().count, 2);
	assert_eq!(pool.snapshot().phase, Phase::Open);

	a.close().await.unwrap();
	assert_eq!(pool.snapshot().count, 1);

	b.close().await.unwrap();
	eventually(|| pool.snapshot().phase == Phase::Idle).await;
	assert_eq!(pool.snapshot().count, 0);
	assert_eq!(probe.opens(), 1);
	assert_eq!(probe.closes(), 1);
}

#[tokio::test]
async fn test_second_close_does_not_decrement() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let pool = ready(&probe);

	let a = pool.open().await.unwrap();
	let b = pool.open().await.unwrap();

	a.close().await.unwrap();
	let err = a.close().await.unwrap_err();

	assert!(matches!(err, Error::AlreadyClosed));
	assert_eq!(pool.snapshot().count, 1);
	assert_eq!(probe.closes(), 0);
	b.close().await.unwrap();
}

#[tokio::test]
async fn test_open_token_aborted_after_success() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let pool = ready(&probe);

	let handle = pool.open().await.unwrap();

	assert!(probe.token(0).is_aborted());
	assert_eq!(pool.snapshot().phase, Phase::Open);
	handle.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_waiter_unwinds_only_itself() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let gate = Gate::new();
	let pool = connection(&probe, &gate, "conn");

	let cancel = CancellationToken::new();
	let quitter = tokio::spawn({
		let pool = pool.clone();
		let cancel = cancel.clone();
		async move { pool.open_with(&cancel).await }
	});
	let stayer = tokio::spawn({
		let pool = pool.clone();
		async move { pool.open().await }
	});
	eventually(|| pool.snapshot().count == 2).await;

	cancel.cancel();
	let err = quitter.await.unwrap().unwrap_err();
	assert!(matches!(err, Error::Aborted));
	assert_eq!(pool.snapshot().count, 1);
	assert!(!probe.token(0).is_aborted());

	gate.release();
	let handle = stayer.await.unwrap().unwrap();
	assert_eq!(handle.as_str(), "conn");
	assert_eq!(probe.opens(), 1);
	handle.close().await.unwrap();
}

#[tokio::test]
async fn test_last_waiter_cancelling_aborts_open() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let gate = Gate::new();
	let pool = connection(&probe, &gate, "conn");

	let cancel = CancellationToken::new();
	let waiter = tokio::spawn({
		let pool = pool.clone();
		let cancel = cancel.clone();
		async move { pool.open_with(&cancel).await }
	});
	eventually(|| probe.opens() == 1).await;

	cancel.abort(Error::failed("user left"));
	let err = waiter.await.unwrap().unwrap_err();
	assert_eq!(err.to_string(), "user left");

	assert_eq!(probe.token(0).reason().unwrap().to_string(), "user left");
	assert_eq!(pool.snapshot().count, 0);
	gate.release();
}

#[tokio::test]
async fn test_late_value_is_closed_when_nobody_waits() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let gate = Gate::new();
	let pool = connection(&probe, &gate, "conn");

	let cancel = CancellationToken::new();
	let waiter = tokio::spawn({
		let pool = pool.clone();
		let cancel = cancel.clone();
		async move { pool.open_with(&cancel).await }
	});
	eventually(|| probe.opens() == 1).await;
	cancel.cancel();
	waiter.await.unwrap().unwrap_err();

	// The opener ignores its token and still produces a value.
	gate.release();

	eventually(|| probe.closes() == 1).await;
	eventually(|| pool.snapshot().phase == Phase::Idle).await;

	let handle = pool.open().await.unwrap();
	assert_eq!(probe.opens(), 2);
	handle.close().await.unwrap();
}

#[tokio::test]
async fn test_late_value_kept_when_rejoined() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let gate = Gate::new();
	let pool = connection(&probe, &gate, "conn");

	let cancel = CancellationToken::new();
	let waiter = tokio::spawn({
		let pool = pool.clone();
		let cancel = cancel.clone();
		async move { pool.open_with(&cancel).await }
	});
	eventually(|| probe.opens() == 1).await;
	cancel.cancel();
	waiter.await.unwrap().unwrap_err();

	let rejoined = tokio::spawn({
		let pool = pool.clone();
		async move { pool.open().await }
	});
	eventually(|| pool.snapshot().count == 1).await;
	gate.release();

	let handle = rejoined.await.unwrap().unwrap();
	assert_eq!(probe.opens(), 1);
	assert_eq!(probe.closes(), 0);
	handle.close().await.unwrap();
	assert_eq!(probe.closes(), 1);
}

#[tokio::test]
async fn test_dropped_open_future_releases_reference() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let gate = Gate::new();
	let pool = connection(&probe, &gate, "conn");

	let waiter = tokio::spawn({
		let pool = pool.clone();
		async move { pool.open().await }
	});
	eventually(|| pool.snapshot().count == 1).await;

	waiter.abort();
	let _ = waiter.await;

	assert_eq!(pool.snapshot().count, 0);
	assert!(matches!(probe.token(0).reason(), Some(Error::Aborted)));
	gate.release();
}

#[tokio::test]
async fn test_dropped_handle_closes_in_background() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let pool = ready(&probe);

	let handle = pool.open().await.unwrap();
	drop(handle);

	eventually(|| probe.closes() == 1).await;
	eventually(|| pool.snapshot().phase == Phase::Idle).await;
	assert_eq!(pool.snapshot().count, 0);
}

#[tokio::test]
async fn test_closed_handle_drop_is_noop() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let pool = ready(&probe);

	let keep = pool.open().await.unwrap();
	let other = pool.open().await.unwrap();
	other.close().await.unwrap();
	drop(other);

	assert_eq!(pool.snapshot().count, 1);
	keep.close().await.unwrap();
}

#[tokio::test]
async fn test_close_failure_reaches_releasing_caller() {
	init_tracing();
	let opens = Arc::new(AtomicUsize::new(0));
	let pool: RefCounted<usize> = RefCounted::new({
		let opens = Arc::clone(&opens);
		move |_| {
			let n = opens.fetch_add(1, Ordering::SeqCst);
			async move { Ok(Closable::new(n, |_| async { Err(Error::failed("flush failed")) })) }
		}
	});

	let handle = pool.open().await.unwrap();
	let err = handle.close().await.unwrap_err();
	assert_eq!(err.to_string(), "flush failed");

	eventually(|| pool.snapshot().phase == Phase::Idle).await;
	let handle = pool.open().await.unwrap();
	assert_eq!(**handle.value(), 1);
	let _ = handle.close().await;
}

#[tokio::test]
async fn test_close_receives_reason() {
	init_tracing();
	let seen = Arc::new(Mutex::new(None));
	let pool: RefCounted<()> = RefCounted::new({
		let seen = Arc::clone(&seen);
		move |_| {
			let seen = Arc::clone(&seen);
			async move {
				Ok(Closable::new((), move |request| {
					*seen.lock() = request.reason().map(ToString::to_string);
					async { Ok(()) }
				}))
			}
		}
	});

	let handle = pool.open().await.unwrap();
	handle
		.close_with(Some(Error::failed("idle timeout")))
		.await
		.unwrap();

	assert_eq!(seen.lock().as_deref(), Some("idle timeout"));
}

#[tokio::test]
async fn test_hook_second_acquire_is_rejected() {
	init_tracing();
	let second = Arc::new(Mutex::new(None));
	let pool: RefCounted<()> = RefCounted::new({
		let second = Arc::clone(&second);
		move |_| {
			let second = Arc::clone(&second);
			async move {
				Ok(Closable::new((), move |request| {
					let second = Arc::clone(&second);
					async move {
						let hook = request.acquire_hook()?;
						*second.lock() = Some(request.acquire_hook().map(|_| ()));
						hook.resolve();
						Ok(())
					}
				}))
			}
		}
	});

	let handle = pool.open().await.unwrap();
	handle.close().await.unwrap();

	let second = second.lock().take().unwrap();
	assert!(matches!(second, Err(Error::HookReentrancy)));
	eventually(|| pool.snapshot().phase == Phase::Idle).await;
}

#[tokio::test]
async fn test_hook_after_close_settled_is_expired() {
	init_tracing();
	let (request_tx, request_rx) = tokio::sync::oneshot::channel();
	let request_tx = Arc::new(Mutex::new(Some(request_tx)));
	let pool: RefCounted<()> = RefCounted::new(move |_| {
		let request_tx = Arc::clone(&request_tx);
		async move {
			Ok(Closable::new((), move |request| {
				if let Some(tx) = request_tx.lock().take() {
					let _ = tx.send(request);
				}
				async { Ok(()) }
			}))
		}
	});

	let handle = pool.open().await.unwrap();
	handle.close().await.unwrap();

	let request = request_rx.await.unwrap();
	assert!(matches!(request.acquire_hook(), Err(Error::HookExpired)));
}

#[tokio::test]
async fn test_hook_rejection_is_reported_not_returned() {
	init_tracing();
	let reports = Arc::new(Mutex::new(Vec::new()));
	let pool: RefCounted<()> = RefCounted::builder(|_| async {
		Ok(Closable::new((), |request| {
			let hook = request.acquire_hook();
			async move {
				let hook = hook?;
				tokio::spawn(async move {
					tokio::task::yield_now().await;
					hook.reject(Error::failed("socket reset during shutdown"));
				});
				Ok(())
			}
		}))
	})
	.name("socket")
	.on_unreported({
		let reports = Arc::clone(&reports);
		move |name, err| reports.lock().push(format!("{name}: {err}"))
	})
	.build();

	let handle = pool.open().await.unwrap();
	handle.close().await.unwrap();

	eventually(|| !reports.lock().is_empty()).await;
	assert_eq!(
		*reports.lock(),
		vec!["socket: socket reset during shutdown".to_string()]
	);
	eventually(|| pool.snapshot().phase == Phase::Idle).await;
}

#[tokio::test]
async fn test_dropped_hook_without_abort_is_reported() {
	init_tracing();
	let reports = Arc::new(AtomicUsize::new(0));
	let pool: RefCounted<()> = RefCounted::builder(|_| async {
		Ok(Closable::new((), |request| {
			let hook = request.acquire_hook();
			async move {
				drop(hook?);
				Ok(())
			}
		}))
	})
	.on_unreported({
		let reports = Arc::clone(&reports);
		move |_, _| {
			reports.fetch_add(1, Ordering::SeqCst);
		}
	})
	.build();

	let handle = pool.open().await.unwrap();
	handle.close().await.unwrap();

	eventually(|| reports.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test]
async fn test_snapshot_phases() {
	init_tracing();
	let probe = Arc::new(Probe::default());
	let gate = Gate::new();
	let pool = connection(&probe, &gate, "conn");
	assert_eq!(pool.snapshot().phase, Phase::Idle);

	let waiter = tokio::spawn({
		let pool = pool.clone();
		async move { pool.open().await }
	});
	eventually(|| probe.opens() == 1).await;
	assert_eq!(pool.snapshot().phase, Phase::Opening);

	gate.release();
	let handle = waiter.await.unwrap().unwrap();
	assert_eq!(pool.snapshot().phase, Phase::Open);

	handle.close().await.unwrap();
	eventually(|| pool.snapshot().phase == Phase::Idle).await;
}
