//! Per-caller handles to the shared resource.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use refshare_runtime::{Error, Result};

use crate::ref_counted::{Inner, Opened};

/// One reference to the shared resource.
///
/// Every handle of an episode points at the same value. Release it with
/// [`close`](Self::close); dropping an unclosed handle releases it too, in
/// the background.
pub struct Handle<T: Send + Sync + 'static> {
	inner: Arc<Inner<T>>,
	opened: Arc<Opened<T>>,
	closed: AtomicBool,
}

impl<T: Send + Sync + 'static> Handle<T> {
	pub(crate) fn new(inner: Arc<Inner<T>>, opened: Arc<Opened<T>>) -> Self {
		Self {
			inner,
			opened,
			closed: AtomicBool::new(false),
		}
	}

	/// The shared value.
	pub fn value(&self) -> &Arc<T> {
		&self.opened.value
	}

	/// Returns true once [`close`](Self::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	/// Releases this reference.
	///
	/// Releasing the last reference closes the resource and returns the close
	/// operation's own outcome. Fails with [`Error::AlreadyClosed`] when called
	/// again on the same handle.
	pub async fn close(&self) -> Result<()> {
		self.close_with(None).await
	}

	/// Like [`close`](Self::close), passing `reason` to the close operation if
	/// this is the last reference.
	pub async fn close_with(&self, reason: Option<Error>) -> Result<()> {
		if self.closed.swap(true, Ordering::SeqCst) {
			return Err(Error::AlreadyClosed);
		}

		match self.inner.release(&self.opened, reason) {
			Some(direct) => direct.await,
			None => Ok(()),
		}
	}
}

impl<T: Send + Sync + 'static> Deref for Handle<T> {
	type Target = T;

	fn deref(&self) -> &T {
		&self.opened.value
	}
}

impl<T: Send + Sync + 'static> fmt::Debug for Handle<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Handle")
			.field("name", &self.inner.name)
			.field("episode", &self.opened.episode)
			.field("closed", &self.is_closed())
			.finish()
	}
}

impl<T: Send + Sync + 'static> Drop for Handle<T> {
	fn drop(&mut self) {
		if *self.closed.get_mut() {
			return;
		}

		if tokio::runtime::Handle::try_current().is_err() {
			self.inner.release_detached(&self.opened);
			return;
		}

		if let Some(direct) = self.inner.release(&self.opened, None) {
			let inner = Arc::clone(&self.inner);
			tokio::spawn(async move {
				if let Err(err) = direct.await {
					inner.report(&err);
				}
			});
		}
	}
}
