//! refshare runtime - cancellation, racing and error plumbing
//!
//! Low-level building blocks used by the `refshare` crate:
//!
//! - **Cancellation**: cooperative [`CancellationToken`]s with child/any
//!   derivation, abort callbacks and deadlines
//! - **Racing**: [`race`] an operation against a token
//! - **Errors**: the clonable [`Error`] shared by every waiter of one outcome
//! - **Reporting**: the [`Reporter`] side channel for failures no caller owns

pub mod cancel;
pub mod error;
pub mod race;
pub mod report;

pub use cancel::{CallbackId, CancellationToken, TokenState};
pub use error::{Error, Result, SharedError};
pub use race::race;
pub use report::Reporter;
