//! Side channel for failures that no caller owns.
//!
//! Some failures settle after the call that caused them has already returned
//! (a close completed through its hook, a late value closed after its open was
//! abandoned). They are handed to a [`Reporter`] instead of being returned.

use std::fmt;
use std::sync::Arc;

use crate::error::Error;

type ReportFn = dyn Fn(&str, &Error) + Send + Sync;

/// Sink for unreported failures.
///
/// The first argument is the name of the instance the failure belongs to.
#[derive(Clone)]
pub struct Reporter {
	sink: Arc<ReportFn>,
}

impl Default for Reporter {
	fn default() -> Self {
		Self::tracing()
	}
}

impl fmt::Debug for Reporter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Reporter").finish_non_exhaustive()
	}
}

impl Reporter {
	/// Reporter that logs through `tracing::error!`.
	pub fn tracing() -> Self {
		Self::new(|name, err| {
			tracing::error!(name, error = %err, "unreported failure");
		})
	}

	/// Reporter backed by a custom sink.
	pub fn new<F>(sink: F) -> Self
	where
		F: Fn(&str, &Error) + Send + Sync + 'static,
	{
		Self {
			sink: Arc::new(sink),
		}
	}

	/// Delivers `err` to the sink.
	pub fn report(&self, name: &str, err: &Error) {
		(self.sink)(name, err);
	}
}
