//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use refshare::{CancellationToken, Closable, RefCounted};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; `RUST_LOG=refshare=debug` shows
/// the lifecycle events.
pub fn init_tracing() {
	let _ = tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
		.with_test_writer()
		.try_init();
}

/// Counts opener runs and completed closes, and keeps the token each opener
/// run was given.
#[derive(Default)]
pub struct Probe {
	opens: AtomicUsize,
	closes: AtomicUsize,
	tokens: Mutex<Vec<CancellationToken>>,
}

impl Probe {
	pub fn opens(&self) -> usize {
		self.opens.load(Ordering::SeqCst)
	}

	pub fn closes(&self) -> usize {
		self.closes.load(Ordering::SeqCst)
	}

	/// Token handed to the `attempt`-th opener run.
	pub fn token(&self, attempt: usize) -> CancellationToken {
		self.tokens.lock()[attempt].clone()
	}
}

/// Holds openers back until released.
#[derive(Clone)]
pub struct Gate {
	tx: Arc<watch::Sender<bool>>,
}

impl Gate {
	pub fn new() -> Self {
		let (tx, _) = watch::channel(false);
		Self { tx: Arc::new(tx) }
	}

	pub fn open() -> Self {
		let gate = Self::new();
		gate.release();
		gate
	}

	pub fn release(&self) {
		self.tx.send_replace(true);
	}

	pub async fn wait(&self) {
		let mut rx = self.tx.subscribe();
		let _ = rx.wait_for(|open| *open).await;
	}
}

/// A resource whose opener yields `value` once `gate` is released.
pub fn connection(probe: &Arc<Probe>, gate: &Gate, value: &'static str) -> RefCounted<String> {
	let probe = Arc::clone(probe);
	let gate = gate.clone();
	RefCounted::builder(move |token| {
		let probe = Arc::clone(&probe);
		let gate = gate.clone();
		async move {
			probe.tokens.lock().push(token);
			probe.opens.fetch_add(1, Ordering::SeqCst);
			gate.wait().await;
			let closer = Arc::clone(&probe);
			Ok(Closable::new(value.to_string(), move |_request| {
				let probe = Arc::clone(&closer);
				async move {
					probe.closes.fetch_add(1, Ordering::SeqCst);
					Ok(())
				}
			}))
		}
	})
	.name(value)
	.build()
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
	tokio::time::timeout(Duration::from_secs(5), async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(1)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}
