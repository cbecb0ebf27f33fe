//! Error types shared by the cancellation primitives and the ref-counted
//! resource.

use std::sync::Arc;

use thiserror::Error;

/// Result type alias for refshare operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Type-erased, cheaply clonable error source.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by refshare.
///
/// `Error` is `Clone` so that one outcome of a shared operation can be handed
/// to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum Error {
	/// `acquire_hook` was called more than once for a single close.
	#[error("close hook already acquired for this close")]
	HookReentrancy,

	/// `acquire_hook` was called after the close operation itself settled.
	#[error("close hook acquired after the close operation settled")]
	HookExpired,

	/// `close` was called on a handle that is already closed.
	#[error("handle already closed")]
	AlreadyClosed,

	/// A cancellation token was aborted without a more specific reason.
	#[error("operation aborted")]
	Aborted,

	/// A deadline-bound cancellation token expired.
	#[error("operation timed out")]
	TimedOut,

	/// An in-flight close was aborted because a new open arrived.
	#[error("close superseded by a new open")]
	Superseded,

	/// Opener or close failure.
	#[error("{0}")]
	Failed(SharedError),
}

impl Error {
	/// Wraps any error (or message) as [`Error::Failed`].
	///
	/// `Error::failed("boom").to_string()` is `"boom"`.
	pub fn failed<E>(err: E) -> Self
	where
		E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
	{
		let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = err.into();
		Error::Failed(Arc::from(boxed))
	}

	/// Returns true for the reasons cancellation tokens abort with.
	pub fn is_cancellation(&self) -> bool {
		matches!(self, Error::Aborted | Error::TimedOut | Error::Superseded)
	}

	/// Returns true if this is a supersession abort.
	pub fn is_superseded(&self) -> bool {
		matches!(self, Error::Superseded)
	}

	/// Returns true if this is a contract violation by the caller.
	pub fn is_violation(&self) -> bool {
		matches!(
			self,
			Error::HookReentrancy | Error::HookExpired | Error::AlreadyClosed
		)
	}
}
