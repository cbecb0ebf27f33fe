//! Close requests and the deferred-completion hook.
//!
//! A close operation normally completes when its own future settles. By
//! calling [`CloseRequest::acquire_hook`] it can instead hand completion to a
//! [`CloseHook`] and settle it later, out of band. The future the close
//! operation returns is still what the releasing caller awaits; the hook only
//! decides when the close lifecycle as a whole is over.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use refshare_runtime::{CancellationToken, Error, Result};
use tokio::sync::oneshot;

enum HookState {
	Available(oneshot::Sender<Result<()>>),
	Acquired,
	Expired,
}

/// Single-shot slot the hook is taken from.
pub(crate) struct HookSlot {
	state: Mutex<HookState>,
}

impl HookSlot {
	pub(crate) fn new() -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
		let (tx, rx) = oneshot::channel();
		let slot = Arc::new(Self {
			state: Mutex::new(HookState::Available(tx)),
		});
		(slot, rx)
	}

	fn acquire(&self, token: &CancellationToken) -> Result<CloseHook> {
		let mut state = self.state.lock();
		match std::mem::replace(&mut *state, HookState::Acquired) {
			HookState::Available(tx) => Ok(CloseHook {
				tx: Some(tx),
				token: token.clone(),
			}),
			HookState::Acquired => Err(Error::HookReentrancy),
			HookState::Expired => {
				*state = HookState::Expired;
				Err(Error::HookExpired)
			}
		}
	}

	/// Stops handing out the hook. Returns true if it was acquired.
	pub(crate) fn seal(&self) -> bool {
		let mut state = self.state.lock();
		match *state {
			HookState::Acquired => true,
			HookState::Expired => false,
			HookState::Available(_) => {
				*state = HookState::Expired;
				false
			}
		}
	}
}

/// Passed to a resource's close operation.
pub struct CloseRequest {
	reason: Option<Error>,
	token: CancellationToken,
	hook: Arc<HookSlot>,
}

impl fmt::Debug for CloseRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CloseRequest")
			.field("reason", &self.reason)
			.field("token", &self.token)
			.finish_non_exhaustive()
	}
}

impl CloseRequest {
	pub(crate) fn new(reason: Option<Error>, token: CancellationToken, hook: Arc<HookSlot>) -> Self {
		Self {
			reason,
			token,
			hook,
		}
	}

	/// Why the resource is being closed, if the releasing caller said.
	pub fn reason(&self) -> Option<&Error> {
		self.reason.as_ref()
	}

	/// Aborted with [`Error::Superseded`] when a new open arrives mid-close.
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	/// Takes over completion of this close.
	///
	/// Can be called once per close, and only before the close operation's
	/// own future settles. A second call fails with [`Error::HookReentrancy`],
	/// a late call with [`Error::HookExpired`].
	pub fn acquire_hook(&self) -> Result<CloseHook> {
		self.hook.acquire(&self.token)
	}
}

/// Deferred completion of a close.
///
/// Settle it with [`resolve`](Self::resolve) or [`reject`](Self::reject).
/// Dropping it unsettled rejects with the close token's abort reason, or with
/// a failure if the token was never aborted.
pub struct CloseHook {
	tx: Option<oneshot::Sender<Result<()>>>,
	token: CancellationToken,
}

impl fmt::Debug for CloseHook {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CloseHook")
			.field("settled", &self.tx.is_none())
			.field("token", &self.token)
			.finish()
	}
}

impl CloseHook {
	/// Same token as [`CloseRequest::token`].
	pub fn token(&self) -> &CancellationToken {
		&self.token
	}

	/// Reports that the resource is fully closed.
	pub fn resolve(mut self) {
		self.settle(Ok(()));
	}

	/// Reports that closing failed or was abandoned.
	///
	/// Rejecting with [`Error::Superseded`] after the token aborted means the
	/// resource was kept alive for the superseding open.
	pub fn reject(mut self, err: Error) {
		self.settle(Err(err));
	}

	fn settle(&mut self, outcome: Result<()>) {
		if let Some(tx) = self.tx.take() {
			// The close lifecycle may already be gone; nobody is left to tell.
			let _ = tx.send(outcome);
		}
	}
}

impl Drop for CloseHook {
	fn drop(&mut self) {
		if self.tx.is_some() {
			let reason = self
				.token
				.reason()
				.unwrap_or_else(|| Error::failed("close hook dropped before settling"));
			self.settle(Err(reason));
		}
	}
}
