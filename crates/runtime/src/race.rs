//! Racing an operation against a cancellation token.

use std::future::Future;

use crate::cancel::CancellationToken;
use crate::error::Result;

/// Awaits `operation` unless `token` aborts first.
///
/// Returns the operation's outcome, or `Err(reason)` when the token aborts
/// before the operation settles. A token that is already aborted wins without
/// polling the operation at all.
///
/// Only this caller's copy of `operation` is dropped when the token wins. Work
/// shared with other callers (a spawned task, a `Shared` future) keeps making
/// progress for them.
pub async fn race<F, T>(operation: F, token: &CancellationToken) -> Result<T>
where
	F: Future<Output = Result<T>>,
{
	if let Some(reason) = token.reason() {
		return Err(reason);
	}

	tokio::select! {
		biased;
		reason = token.aborted() => Err(reason),
		result = operation => result,
	}
}
