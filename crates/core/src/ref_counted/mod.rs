//! Reference-counted sharing of one lazily opened resource.
//!
//! # Lifecycle
//!
//! ```text
//!            open()                     last Handle::close()
//!   Idle ───────────► Opening ──► Open ─────────────────────► Closing
//!    ▲                   │                                      │
//!    │   opener failed   │        close settled                 │
//!    ├───────────────────┘◄─────────────────────────────────────┤
//!    │                                                          │
//!    │            open() arrives: close token aborted,          │
//!    │            waits for settlement, then reuses the value   │
//!    └──────── if the close abandoned teardown ◄────────────────┘
//! ```
//!
//! All state lives in one mutex that is only held for synchronous steps.
//! User code (the opener and close operations) never runs under it: it runs
//! in spawned tasks, so shared work keeps going regardless of which caller's
//! future happens to be dropped.

mod close;
mod open;


use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use refshare_runtime::{CancellationToken, Error, Reporter, Result, race};
use tracing::debug;

use self::close::CloseSlot;
use self::open::OpenSlot;
pub(crate) use self::open::Opened;
use crate::closable::Closable;
use crate::handle::Handle;

pub(crate) type Opener<T> =
	Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<Closable<T>>> + Send + Sync>;

/// Coarse lifecycle position of a [`RefCounted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	/// Nothing opened, nothing in flight.
	Idle,
	/// The opener is running.
	Opening,
	/// The resource is open (possibly with no references left).
	Open,
	/// A close is in flight.
	Closing,
}

/// Point-in-time view of a [`RefCounted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
	/// Live handles plus callers still waiting on the shared open.
	pub count: usize,
	pub phase: Phase,
}

pub(crate) struct State<T> {
	pub(crate) count: usize,
	/// Opens waiting for a close they superseded to settle.
	pub(crate) superseding: usize,
	pub(crate) open: Option<OpenSlot<T>>,
	pub(crate) close: Option<CloseSlot>,
	next_id: u64,
}

impl<T> State<T> {
	fn next_id(&mut self) -> u64 {
		self.next_id += 1;
		self.next_id
	}
}

pub(crate) struct Inner<T> {
	pub(crate) name: Cow<'static, str>,
	pub(crate) opener: Opener<T>,
	pub(crate) reporter: Reporter,
	pub(crate) state: Mutex<State<T>>,
}

/// Shares one lazily opened resource between many handles.
///
/// The first [`open`](Self::open) runs the opener; callers arriving while it
/// runs share its outcome. Each successful open returns a [`Handle`], and the
/// resource is closed when the last handle is released. Cloning a
/// `RefCounted` shares the same resource.
pub struct RefCounted<T: Send + Sync + 'static> {
	inner: Arc<Inner<T>>,
}

impl<T: Send + Sync + 'static> Clone for RefCounted<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

impl<T: Send + Sync + 'static> fmt::Debug for RefCounted<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("RefCounted")
			.field("name", &self.inner.name)
			.field("snapshot", &self.snapshot())
			.finish()
	}
}

/// Configures a [`RefCounted`] before it is built.
pub struct Builder<T: Send + Sync + 'static> {
	opener: Opener<T>,
	name: Cow<'static, str>,
	reporter: Reporter,
}

impl<T: Send + Sync + 'static> Builder<T> {
	/// Label attached to log events and reports of this instance.
	pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
		self.name = name.into();
		self
	}

	/// Where failures that no caller owns are delivered.
	///
	/// Defaults to [`Reporter::tracing`].
	pub fn reporter(mut self, reporter: Reporter) -> Self {
		self.reporter = reporter;
		self
	}

	/// Shorthand for [`reporter`](Self::reporter) with a closure.
	pub fn on_unreported<F>(self, sink: F) -> Self
	where
		F: Fn(&str, &Error) + Send + Sync + 'static,
	{
		self.reporter(Reporter::new(sink))
	}

	pub fn build(self) -> RefCounted<T> {
		RefCounted {
			inner: Arc::new(Inner {
				name: self.name,
				opener: self.opener,
				reporter: self.reporter,
				state: Mutex::new(State {
					count: 0,
					superseding: 0,
					open: None,
					close: None,
					next_id: 0,
				}),
			}),
		}
	}
}

impl<T: Send + Sync + 'static> RefCounted<T> {
	/// Creates an instance with default configuration.
	pub fn new<F, Fut>(opener: F) -> Self
	where
		F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Closable<T>>> + Send + 'static,
	{
		Self::builder(opener).build()
	}

	/// Starts configuring an instance.
	///
	/// The opener receives a token that is aborted once the open settles, or
	/// earlier when every caller waiting on it gave up.
	pub fn builder<F, Fut>(opener: F) -> Builder<T>
	where
		F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<Closable<T>>> + Send + 'static,
	{
		Builder {
			opener: Arc::new(move |token| opener(token).boxed()),
			name: Cow::Borrowed("resource"),
			reporter: Reporter::default(),
		}
	}

	/// Opens (or joins) the shared resource.
	pub async fn open(&self) -> Result<Handle<T>> {
		self.open_with(&CancellationToken::new()).await
	}

	/// Opens (or joins) the shared resource, giving up when `cancel` aborts.
	///
	/// Waits out any close in flight first. Giving up only unwinds this
	/// caller's reference; other callers sharing the open are unaffected.
	pub async fn open_with(&self, cancel: &CancellationToken) -> Result<Handle<T>> {
		let mut waiting: Option<Superseding<'_, T>> = None;
		let slot = loop {
			let (id, token, settled) = {
				let mut state = self.inner.state.lock();
				if let Some(waiting) = waiting.take() {
					waiting.rejoin(&mut state);
				}
				let in_flight = state
					.close
					.as_ref()
					.map(|close| (close.id, close.token.clone(), close.settled.clone()));
				match in_flight {
					Some(close) => {
						state.superseding += 1;
						close
					}
					None => break self.inner.join_open(&mut state),
				}
			};
			waiting = Some(Superseding::new(&self.inner));

			// Abort callbacks are user code; run them outside the lock.
			if token.abort(Error::Superseded) {
				debug!(name = %self.inner.name, close = id, "superseding close");
			}
			race(settled.map(Ok), cancel).await?;
		};

		let mut pending = PendingOpen::new(&self.inner, &slot);
		match race(slot.result.clone(), cancel).await {
			Ok(opened) => {
				pending.complete();
				Ok(Handle::new(Arc::clone(&self.inner), opened))
			}
			Err(err) => {
				pending.release(err.clone());
				Err(err)
			}
		}
	}

	/// Returns the current count and lifecycle phase.
	pub fn snapshot(&self) -> Snapshot {
		let state = self.inner.state.lock();
		let phase = match (&state.close, &state.open) {
			(Some(_), _) => Phase::Closing,
			(None, None) => Phase::Idle,
			(None, Some(slot)) => match slot.result.peek() {
				Some(Ok(_)) => Phase::Open,
				_ => Phase::Opening,
			},
		};
		Snapshot {
			count: state.count,
			phase,
		}
	}

	/// Label given at construction.
	pub fn name(&self) -> &str {
		&self.inner.name
	}
}

impl<T: Send + Sync + 'static> Inner<T> {
	/// Takes a reference and returns the shared open, starting it if needed.
	fn join_open(self: &Arc<Self>, state: &mut State<T>) -> OpenSlot<T> {
		state.count += 1;
		let slot = match state.open.clone() {
			Some(slot) => slot,
			None => {
				let episode = state.next_id();
				let slot = open::start(self, episode);
				state.open = Some(slot.clone());
				slot
			}
		};
		debug!(name = %self.name, episode = slot.episode, count = state.count, "reference taken");
		slot
	}

	/// Drops a reference taken by [`join_open`](Self::join_open) whose wait
	/// did not produce a handle.
	fn release_pending(self: &Arc<Self>, slot: &OpenSlot<T>, reason: Error) {
		let last = {
			let mut state = self.state.lock();
			state.count -= 1;
			debug!(name = %self.name, episode = slot.episode, count = state.count, "open abandoned");
			state.count == 0
		};
		if !last {
			return;
		}

		// Nobody else is waiting on this open.
		slot.token.abort(reason.clone());
		if matches!(slot.result.peek(), Some(Err(_))) {
			return;
		}

		let Ok(runtime) = tokio::runtime::Handle::try_current() else {
			return;
		};
		let inner = Arc::clone(self);
		let slot = slot.clone();
		runtime.spawn(async move {
			if let Ok(opened) = slot.result.await {
				inner.close_orphan(opened.episode, reason);
			}
		});
	}

	/// Drops a handle's reference. Starts the close lifecycle on the
	/// 0-transition and returns the close operation's own outcome.
	pub(crate) fn release(
		self: &Arc<Self>,
		opened: &Arc<Opened<T>>,
		reason: Option<Error>,
	) -> Option<BoxFuture<'static, Result<()>>> {
		let mut state = self.state.lock();
		state.count -= 1;
		debug!(name = %self.name, episode = opened.episode, count = state.count, "reference released");
		if state.count > 0 {
			return None;
		}
		Some(close::begin(self, &mut state, Arc::clone(opened), reason))
	}

	/// Drops a handle's reference without closing, for when no runtime is
	/// available to run the close lifecycle on.
	pub(crate) fn release_detached(&self, opened: &Opened<T>) {
		let mut state = self.state.lock();
		state.count -= 1;
		if state.count == 0 {
			tracing::warn!(
				name = %self.name,
				episode = opened.episode,
				"last handle dropped outside a runtime; resource left open"
			);
		}
	}

	/// Closes a value that finished opening after every caller gave up.
	fn close_orphan(self: &Arc<Self>, episode: u64, reason: Error) {
		let mut state = self.state.lock();
		let current = state
			.open
			.as_ref()
			.is_some_and(|slot| slot.episode == episode);
		if current {
			self.close_if_unused(&mut state, Some(reason));
		}
	}

	/// Closes the cached value if nothing references it, no open is waiting to
	/// reuse it and no close is already running. The close runs in the
	/// background and its direct failure is reported.
	pub(crate) fn close_if_unused(self: &Arc<Self>, state: &mut State<T>, reason: Option<Error>) {
		if state.count > 0 || state.superseding > 0 || state.close.is_some() {
			return;
		}
		let Some(Some(Ok(opened))) = state.open.as_ref().map(|slot| slot.result.peek().cloned()) else {
			return;
		};
		if tokio::runtime::Handle::try_current().is_err() {
			tracing::warn!(name = %self.name, episode = opened.episode, "no runtime to close unreferenced value on");
			return;
		}

		tracing::warn!(name = %self.name, episode = opened.episode, "closing value nobody references");
		let direct = close::begin(self, state, opened, reason);
		let inner = Arc::clone(self);
		tokio::spawn(async move {
			if let Err(err) = direct.await {
				inner.report(&err);
			}
		});
	}

	pub(crate) fn report(&self, err: &Error) {
		self.reporter.report(&self.name, err);
	}
}

/// A reference taken while waiting on the shared open.
///
/// If the waiting future is dropped before the open settles, the reference is
/// released as if the caller had been cancelled.
struct PendingOpen<'a, T: Send + Sync + 'static> {
	inner: &'a Arc<Inner<T>>,
	slot: &'a OpenSlot<T>,
	completed: bool,
}

impl<'a, T: Send + Sync + 'static> PendingOpen<'a, T> {
	fn new(inner: &'a Arc<Inner<T>>, slot: &'a OpenSlot<T>) -> Self {
		Self {
			inner,
			slot,
			completed: false,
		}
	}

	/// The reference now belongs to a handle.
	fn complete(&mut self) {
		self.completed = true;
	}

	fn release(&mut self, reason: Error) {
		self.completed = true;
		self.inner.release_pending(self.slot, reason);
	}
}

impl<T: Send + Sync + 'static> Drop for PendingOpen<'_, T> {
	fn drop(&mut self) {
		if !self.completed {
			self.release(Error::Aborted);
		}
	}
}

/// An open waiting for the close it superseded to settle.
///
/// Keeps the cached value from being closed under it. If the wait ends without
/// the open going on to take a reference, the value is closed when nobody else
/// is left to use it.
struct Superseding<'a, T: Send + Sync + 'static> {
	inner: &'a Arc<Inner<T>>,
	done: bool,
}

impl<'a, T: Send + Sync + 'static> Superseding<'a, T> {
	fn new(inner: &'a Arc<Inner<T>>) -> Self {
		Self { inner, done: false }
	}

	/// The wait is over and the open retries under the same lock.
	fn rejoin(mut self, state: &mut State<T>) {
		self.done = true;
		state.superseding -= 1;
	}
}

impl<T: Send + Sync + 'static> Drop for Superseding<'_, T> {
	fn drop(&mut self) {
		if self.done {
			return;
		}
		let mut state = self.inner.state.lock();
		state.superseding -= 1;
		self.inner.close_if_unused(&mut state, None);
	}
}
