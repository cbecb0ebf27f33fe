//! refshare - share one lazily opened async resource between many handles
//!
//! [`RefCounted`] opens a resource on first demand, hands out a [`Handle`] to
//! every caller, and closes the resource when the last handle is released:
//!
//! - **Single-flight open**: concurrent callers share one opener run and its
//!   outcome; a failed open is forgotten so the next caller retries
//! - **Close on last release**: the close operation runs exactly once per
//!   drop to zero references, optionally completing later through a
//!   [`CloseHook`]
//! - **Supersession**: an open arriving mid-close aborts the close's token and
//!   waits for it to settle, so no caller ever sees a half-closed resource
//! - **Cancellable waits**: every wait races the caller's own
//!   [`CancellationToken`]; giving up only unwinds that caller's reference
//!
//! ```ignore
//! let pool = RefCounted::new(|_token| async {
//!     let conn = Connection::connect("db:5432").await.map_err(Error::failed)?;
//!     let closer = conn.clone();
//!     Ok(Closable::new(conn, move |_request| {
//!         let conn = closer.clone();
//!         async move { conn.shutdown().await.map_err(Error::failed) }
//!     }))
//! });
//!
//! let handle = pool.open().await?;
//! handle.query("select 1").await?;
//! handle.close().await?;
//! ```

pub mod closable;
pub mod handle;
pub mod hook;
pub mod ref_counted;

pub use closable::{Closable, CloseFuture};
pub use handle::Handle;
pub use hook::{CloseHook, CloseRequest};
pub use ref_counted::{Builder, Phase, RefCounted, Snapshot};
pub use refshare_runtime::{
	CallbackId, CancellationToken, Error, Reporter, Result, SharedError, TokenState, race,
};
