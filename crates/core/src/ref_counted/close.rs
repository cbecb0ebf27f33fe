//! Close lifecycle: runs once per 0-transition of the reference count.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use refshare_runtime::{CancellationToken, Error, Result};
use tokio::sync::oneshot;
use tracing::debug;

use super::{Inner, Opened, State};
use crate::hook::{CloseRequest, HookSlot};

/// The close in flight.
pub(crate) struct CloseSlot {
	pub(crate) id: u64,
	/// Aborted with [`Error::Superseded`] when an open arrives mid-close.
	pub(crate) token: CancellationToken,
	/// Completes once the close has settled and the state is cleaned up.
	pub(crate) settled: Shared<BoxFuture<'static, ()>>,
}

/// Starts closing `opened`. Must be called with the state locked and the
/// count at zero.
///
/// Returns the close operation's own outcome, which is what the releasing
/// caller gets to see.
pub(crate) fn begin<T: Send + Sync + 'static>(
	inner: &Arc<Inner<T>>,
	state: &mut State<T>,
	opened: Arc<Opened<T>>,
	reason: Option<Error>,
) -> BoxFuture<'static, Result<()>> {
	debug_assert_eq!(state.count, 0);
	debug_assert!(state.close.is_none());

	let id = state.next_id();
	let token = CancellationToken::new();
	let (direct_tx, direct_rx) = oneshot::channel();
	debug!(name = %inner.name, episode = opened.episode, close = id, "closing");

	let task = tokio::spawn(run(
		Arc::clone(inner),
		opened,
		id,
		token.clone(),
		reason,
		direct_tx,
	));
	state.close = Some(CloseSlot {
		id,
		token,
		settled: task.map(|_| ()).boxed().shared(),
	});

	async move {
		direct_rx
			.await
			.unwrap_or_else(|_| Err(Error::failed("close task dropped")))
	}
	.boxed()
}

async fn run<T: Send + Sync + 'static>(
	inner: Arc<Inner<T>>,
	opened: Arc<Opened<T>>,
	id: u64,
	token: CancellationToken,
	reason: Option<Error>,
	direct_tx: oneshot::Sender<Result<()>>,
) {
	let (hook, hook_rx) = HookSlot::new();
	let request = CloseRequest::new(reason, token.clone(), Arc::clone(&hook));
	let close = Arc::clone(&opened.close);
	let direct = AssertUnwindSafe(async move { close(request).await })
		.catch_unwind()
		.await
		.unwrap_or_else(|_| Err(Error::failed("close operation panicked")));

	let hooked = hook.seal();
	// The releasing caller may have stopped waiting.
	let _ = direct_tx.send(direct.clone());

	// Once the hook is taken it decides when teardown is over, even if the
	// close operation itself failed.
	let outcome = if hooked {
		let outcome = hook_rx
			.await
			.unwrap_or_else(|_| Err(Error::failed("close hook dropped before settling")));
		if let Err(err) = &outcome {
			if !is_superseded(&token, err) {
				inner.report(err);
			}
		}
		outcome
	} else {
		direct
	};

	let superseded = matches!(&outcome, Err(err) if is_superseded(&token, err));
	inner.finish_close(id, opened.episode, superseded);
}

/// A close that gave up because an open superseded it, leaving the resource
/// alive.
fn is_superseded(token: &CancellationToken, err: &Error) -> bool {
	token.is_aborted() && err.is_superseded()
}

impl<T: Send + Sync + 'static> Inner<T> {
	fn finish_close(self: &Arc<Self>, id: u64, episode: u64, superseded: bool) {
		let mut state = self.state.lock();
		if state.close.as_ref().is_some_and(|close| close.id == id) {
			state.close = None;
		}

		if superseded {
			debug!(name = %self.name, episode, close = id, "close superseded, keeping resource");
			// Every open that superseded it may have given up in the meantime.
			self.close_if_unused(&mut state, None);
			return;
		}

		if state
			.open
			.as_ref()
			.is_some_and(|slot| slot.episode == episode)
		{
			state.open = None;
		}
		debug!(name = %self.name, episode, close = id, "closed");
	}
}
