//! Cooperative cancellation tokens.
//!
//! A [`CancellationToken`] is either pending or aborted with a reason. Aborting
//! only records the request and wakes observers; the operation holding the
//! token decides how (and whether) to stop early.
//!
//! Tokens form a tree: [`CancellationToken::child`] and
//! [`CancellationToken::any`] derive a token that aborts as soon as any of its
//! parents aborts, with the parent's reason. Parents only hold weak references
//! to their children, and a dropped child unregisters itself from its
//! parents, so deriving from a long-lived token does not accumulate state.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

use crate::error::Error;

type Callback = Box<dyn FnOnce(&Error) + Send>;

/// Identifies a callback registered with [`CancellationToken::on_abort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Observable state of a token.
#[derive(Debug, Clone)]
pub enum TokenState {
	/// Not aborted yet.
	Pending,
	/// Aborted with the given reason.
	Aborted(Error),
}

struct TokenShared {
	reason: Option<Error>,
	callbacks: Vec<(CallbackId, Callback)>,
	next_callback: u64,
	/// Callbacks this token registered on the tokens it was derived from.
	parents: Vec<(Weak<TokenInner>, CallbackId)>,
	/// Dropping this stops the deadline task.
	deadline: Option<oneshot::Sender<()>>,
}

struct TokenInner {
	state: Mutex<TokenShared>,
	notify: Notify,
}

impl TokenInner {
	fn remove_callback(&self, id: CallbackId) -> bool {
		let mut state = self.state.lock();
		let before = state.callbacks.len();
		state.callbacks.retain(|(registered, _)| *registered != id);
		state.callbacks.len() != before
	}
}

impl Drop for TokenInner {
	fn drop(&mut self) {
		for (parent, id) in self.state.get_mut().parents.drain(..) {
			if let Some(parent) = parent.upgrade() {
				parent.remove_callback(id);
			}
		}
	}
}

/// Clonable handle to a cooperative abort signal.
///
/// Clones observe and control the same signal.
#[derive(Clone)]
pub struct CancellationToken {
	inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Debug for CancellationToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CancellationToken")
			.field("state", &self.state())
			.finish()
	}
}

impl CancellationToken {
	/// Creates an independent, pending token.
	pub fn new() -> Self {
		Self {
			inner: Arc::new(TokenInner {
				state: Mutex::new(TokenShared {
					reason: None,
					callbacks: Vec::new(),
					next_callback: 0,
					parents: Vec::new(),
					deadline: None,
				}),
				notify: Notify::new(),
			}),
		}
	}

	/// Creates a token that aborts with [`Error::TimedOut`] after `duration`.
	///
	/// Must be called from within a Tokio runtime.
	pub fn timeout(duration: Duration) -> Self {
		Self::new().with_timeout(duration)
	}

	/// Derives a token that aborts when this one aborts.
	pub fn child(&self) -> Self {
		Self::any([self])
	}

	/// Derives a token that aborts when any of `parents` aborts.
	///
	/// If a parent is already aborted the derived token starts aborted with
	/// that parent's reason.
	pub fn any<'a, I>(parents: I) -> Self
	where
		I: IntoIterator<Item = &'a CancellationToken>,
	{
		let derived = Self::new();
		for parent in parents {
			let weak = Arc::downgrade(&derived.inner);
			let registered = parent.on_abort(move |reason| {
				if let Some(token) = Self::upgrade(&weak) {
					token.abort(reason.clone());
				}
			});
			match registered {
				Some(id) => derived
					.inner
					.state
					.lock()
					.parents
					.push((Arc::downgrade(&parent.inner), id)),
				None => break,
			}
		}
		derived
	}

	/// Derives a token that aborts with this token, or with
	/// [`Error::TimedOut`] once `duration` has elapsed.
	///
	/// Must be called from within a Tokio runtime. The timer stops early once
	/// the token aborts or is dropped.
	pub fn with_timeout(&self, duration: Duration) -> Self {
		let token = self.child();
		let (stop_tx, stop_rx) = oneshot::channel::<()>();
		let armed = {
			let mut state = token.inner.state.lock();
			let pending = state.reason.is_none();
			if pending {
				state.deadline = Some(stop_tx);
			}
			pending
		};
		if !armed {
			return token;
		}

		let weak = Arc::downgrade(&token.inner);
		tokio::spawn(async move {
			tokio::select! {
				_ = tokio::time::sleep(duration) => {}
				_ = stop_rx => return,
			}
			if let Some(token) = Self::upgrade(&weak) {
				if token.abort(Error::TimedOut) {
					tracing::debug!(?duration, "cancellation deadline elapsed");
				}
			}
		});
		token
	}

	fn upgrade(weak: &Weak<TokenInner>) -> Option<Self> {
		weak.upgrade().map(|inner| Self { inner })
	}

	/// Aborts the token with `reason`.
	///
	/// Registered callbacks run synchronously on the calling thread and every
	/// [`aborted`](Self::aborted) future wakes. Only the first abort takes
	/// effect; returns false if the token was already aborted.
	pub fn abort(&self, reason: Error) -> bool {
		let callbacks = {
			let mut state = self.inner.state.lock();
			if state.reason.is_some() {
				return false;
			}
			state.reason = Some(reason.clone());
			state.deadline = None;
			std::mem::take(&mut state.callbacks)
		};

		for (_, callback) in callbacks {
			callback(&reason);
		}
		self.inner.notify.notify_waiters();
		true
	}

	/// Aborts the token with [`Error::Aborted`].
	pub fn cancel(&self) -> bool {
		self.abort(Error::Aborted)
	}

	/// Returns the current state.
	pub fn state(&self) -> TokenState {
		match self.reason() {
			Some(reason) => TokenState::Aborted(reason),
			None => TokenState::Pending,
		}
	}

	/// Returns true once the token has been aborted.
	pub fn is_aborted(&self) -> bool {
		self.inner.state.lock().reason.is_some()
	}

	/// Returns the abort reason, if aborted.
	pub fn reason(&self) -> Option<Error> {
		self.inner.state.lock().reason.clone()
	}

	/// Registers `callback` to run when the token aborts.
	///
	/// If the token is already aborted the callback runs immediately and
	/// `None` is returned.
	pub fn on_abort<F>(&self, callback: F) -> Option<CallbackId>
	where
		F: FnOnce(&Error) + Send + 'static,
	{
		let mut state = self.inner.state.lock();
		if let Some(reason) = state.reason.clone() {
			drop(state);
			callback(&reason);
			return None;
		}

		let id = CallbackId(state.next_callback);
		state.next_callback += 1;
		state.callbacks.push((id, Box::new(callback)));
		Some(id)
	}

	/// Unregisters a callback. Returns false if it already ran or was removed.
	pub fn remove_callback(&self, id: CallbackId) -> bool {
		self.inner.remove_callback(id)
	}

	#[cfg(test)]
	fn callback_count(&self) -> usize {
		self.inner.state.lock().callbacks.len()
	}

	/// Resolves with the abort reason once the token aborts.
	pub async fn aborted(&self) -> Error {
		loop {
			// Register before checking so an abort in between is not lost.
			let notified = self.inner.notify.notified();

			if let Some(reason) = self.reason() {
				return reason;
			}

			notified.await;
		}
	}
}
