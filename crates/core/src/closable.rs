//! The value an opener produces, paired with the operation that tears it down.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use refshare_runtime::Result;

use crate::hook::CloseRequest;

/// Boxed future returned by a close operation.
pub type CloseFuture = BoxFuture<'static, Result<()>>;

pub(crate) type CloseFn = Arc<dyn Fn(CloseRequest) -> CloseFuture + Send + Sync>;

/// An opened resource: the shared value plus its close operation.
///
/// The close operation may run more than once over the lifetime of a value:
/// a close that is superseded by a new open and abandons teardown leaves the
/// value cached, and the next release closes it again.
pub struct Closable<T> {
	pub(crate) value: T,
	pub(crate) close: CloseFn,
}

impl<T> Closable<T> {
	/// Pairs `value` with its close operation.
	pub fn new<F, Fut>(value: T, close: F) -> Self
	where
		F: Fn(CloseRequest) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = Result<()>> + Send + 'static,
	{
		Self {
			value,
			close: Arc::new(move |request| close(request).boxed()),
		}
	}

	/// Wraps a value that needs no teardown.
	pub fn without_close(value: T) -> Self {
		Self::new(value, |_| async { Ok(()) })
	}

	/// Returns the wrapped value.
	pub fn value(&self) -> &T {
		&self.value
	}
}

impl<T: fmt::Debug> fmt::Debug for Closable<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Closable")
			.field("value", &self.value)
			.finish_non_exhaustive()
	}
}
