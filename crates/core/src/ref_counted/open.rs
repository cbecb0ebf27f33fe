//! Open lifecycle: one opener run per episode, shared by every caller.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use refshare_runtime::{CancellationToken, Error, Result};
use tracing::debug;

use super::Inner;
use crate::closable::CloseFn;

/// The opened resource of one episode.
pub(crate) struct Opened<T> {
	pub(crate) value: Arc<T>,
	pub(crate) close: CloseFn,
	pub(crate) episode: u64,
}

pub(crate) type OpenResult<T> = Result<Arc<Opened<T>>>;

/// In-flight or completed open of the current episode.
pub(crate) struct OpenSlot<T> {
	pub(crate) episode: u64,
	/// Handed to the opener; aborted once the open settles.
	pub(crate) token: CancellationToken,
	pub(crate) result: Shared<BoxFuture<'static, OpenResult<T>>>,
}

impl<T> Clone for OpenSlot<T> {
	fn clone(&self) -> Self {
		Self {
			episode: self.episode,
			token: self.token.clone(),
			result: self.result.clone(),
		}
	}
}

/// Spawns the opener for a new episode.
///
/// The opener runs on its own task, so it keeps going even when every caller
/// that was polling the shared result has been dropped.
pub(crate) fn start<T: Send + Sync + 'static>(inner: &Arc<Inner<T>>, episode: u64) -> OpenSlot<T> {
	let token = CancellationToken::new();
	debug!(name = %inner.name, episode, "opening");

	let task = tokio::spawn(run(Arc::clone(inner), episode, token.clone()));
	let result = task
		.map(|joined| joined.unwrap_or_else(|err| Err(Error::failed(err))))
		.boxed()
		.shared();

	OpenSlot {
		episode,
		token,
		result,
	}
}

async fn run<T: Send + Sync + 'static>(
	inner: Arc<Inner<T>>,
	episode: u64,
	token: CancellationToken,
) -> OpenResult<T> {
	let opener = Arc::clone(&inner.opener);
	let attempt = token.clone();
	let result = AssertUnwindSafe(async move { opener(attempt).await })
		.catch_unwind()
		.await
		.unwrap_or_else(|_| Err(Error::failed("opener panicked")));

	// Releases whatever the opener held only for the duration of opening.
	token.cancel();

	match result {
		Ok(closable) => {
			debug!(name = %inner.name, episode, "opened");
			Ok(Arc::new(Opened {
				value: Arc::new(closable.value),
				close: closable.close,
				episode,
			}))
		}
		Err(err) => {
			inner.clear_failed_open(episode);
			debug!(name = %inner.name, episode, error = %err, "open failed");
			Err(err)
		}
	}
}

impl<T: Send + Sync + 'static> Inner<T> {
	/// Forgets a failed open so the next caller starts a fresh attempt.
	///
	/// Runs before any waiter observes the failure.
	fn clear_failed_open(&self, episode: u64) {
		let mut state = self.state.lock();
		if state
			.open
			.as_ref()
			.is_some_and(|slot| slot.episode == episode)
		{
			state.open = None;
		}
	}
}
