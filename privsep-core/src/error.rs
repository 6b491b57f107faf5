//! The error domain for every fallible operation in this crate.
//!
//! Mirrors the `SwitchError` shape used elsewhere in this codebase: one
//! `thiserror` enum with a stable message per variant, `#[source]` fields
//! wrapping the lower-level errors callers actually hit, and enough context
//! in each variant to write a useful log line without walking back up the
//! call stack.

use std::io;

use thiserror::Error;

/// Top-level error for the capability layer, channel, registry, and
/// bootstrap.
#[derive(Debug, Error)]
pub enum PrivsepError {
    /// A `capset`/`capget`/`prctl` call failed. `context` names the syscall.
    #[error("capability syscall failed ({context}): {source}")]
    Capability {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Privilege drop (`setuid`/`setgid`/`setgroups`) did not take effect —
    /// detected by reading the ids back and finding they did not change.
    #[error("failed to drop privileges: {detail}")]
    FailedToDropPrivileges { detail: String },

    /// The peer sent a frame that does not fit the wire protocol: wrong
    /// message tag, malformed correlation id, truncated payload shape.
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// A call's `oneshot` reply did not arrive within its timeout.
    #[error("privsep call `{entry_point}` timed out after {timeout_ms}ms")]
    Timeout {
        entry_point: String,
        timeout_ms: u64,
    },

    /// The wire named an entry-point that either does not exist or does not
    /// belong to the context the channel was started for.
    #[error("`{name}` is not a registered entry-point")]
    NotEntryPoint { name: String },

    /// Transport-level failure: socket read/write, accept, connect, or an
    /// unexpected peer disconnect.
    #[error("transport error during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: io::Error,
    },

    /// An entry-point raised an application error. `type_identifier` is the
    /// name the remote's [`crate::context::RemoteError`] registration was
    /// keyed under; `args` are its reconstruction arguments, still msgpack
    /// `Value`s because the client may not have that error type registered.
    #[error("remote error `{type_identifier}`: {display}")]
    Remote {
        type_identifier: String,
        display: String,
        args: Vec<rmpv::Value>,
    },

    /// The helper process exited (or was never spawned) before the
    /// handshake completed.
    #[error("helper process unavailable: {detail}")]
    HelperUnavailable { detail: String },
}

impl PrivsepError {
    /// Fills in which call timed out. `send_recv` only knows a call's name
    /// once it's back in [`crate::channel::ClientChannel::remote_call`], so
    /// the bare timeout it raises gets patched with context here.
    pub(crate) fn with_call_context(self, entry_point: &str, timeout_ms: u64) -> Self {
        match self {
            PrivsepError::Timeout { .. } => PrivsepError::Timeout {
                entry_point: entry_point.to_owned(),
                timeout_ms,
            },
            other => other,
        }
    }
}
