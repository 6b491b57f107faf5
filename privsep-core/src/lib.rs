//! Privilege separation for long-running services: an unprivileged client
//! delegates a narrow, explicitly registered set of operations to a
//! co-resident privileged helper over a Unix-domain socket, instead of
//! running the whole process as root.
//!
//! The pieces:
//!
//! - [`capability`] — raw `capset`/`capget`/`prctl` bindings for dropping
//!   Linux capabilities down to an explicit allow-list.
//! - [`wire`] — the msgpack-based frame codec shared by both ends of the
//!   channel.
//! - [`channel`] — the multiplexed request/response transport built on top
//!   of it.
//! - [`context`] — [`context::Context`], the type applications register
//!   entry-points against and call through.
//! - [`bootstrap`] — the two ways to bring up the helper process (fork or
//!   rootwrap/sudo).
//! - [`daemon`] — the helper-side request loop that runs once bootstrap has
//!   produced a connected channel.
//! - [`logbridge`] — out-of-band log forwarding from helper to client.
//! - [`error`] — [`error::PrivsepError`], the error type threaded through
//!   all of the above.

pub mod bootstrap;
pub mod capability;
pub mod channel;
pub mod context;
pub mod daemon;
pub mod error;
pub mod logbridge;
pub mod wire;

pub use context::{Context, Method, RemoteError};
pub use error::PrivsepError;
