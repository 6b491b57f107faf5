//! Entry-point registry and the `Context` applications declare entry-points
//! against and call through.
//!
//! Python can stash an attribute directly on a function object to mark it as
//! belonging to a particular `PrivContext`; Rust has no equivalent runtime
//! handle on an arbitrary callable. This registry is keyed by the
//! entry-point's fully-qualified name instead — which the wire protocol
//! already carries on every `CALL` frame, so nothing is lost by keying on it
//! rather than on identity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use rmpv::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::capability::CapabilityName;
use crate::channel::ClientChannel;
use crate::error::PrivsepError;

/// How the helper process is brought up. See `bootstrap` for the
/// implementations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// `fork()` the current (already-privileged) process.
    Fork,
    /// Spawn `sudo privsep-helper ...` and accept its connection back.
    Rootwrap,
}

/// An application-level error raised inside an entry-point, in a form that
/// can cross the wire without shipping a stack trace or arbitrary code.
pub trait RemoteError: std::fmt::Display + Send + Sync + 'static {
    /// Stable name this error type is registered under, e.g.
    /// `"demos.errors.QuotaExceeded"`.
    const TYPE_IDENTIFIER: &'static str;

    /// Reconstruction arguments, msgpack-encodable.
    fn to_args(&self) -> Vec<Value>;

    /// Renders `args` (as produced by some remote `to_args()`) back into a
    /// display string, without needing the concrete error type on this side.
    fn render(args: &[Value]) -> String;
}

/// Object-safe view of [`RemoteError`], used so entry-point handlers can
/// return a boxed error without the caller knowing its concrete type.
pub trait AnyRemoteError: std::fmt::Display + Send + Sync + 'static {
    fn type_identifier(&self) -> &'static str;
    fn to_args(&self) -> Vec<Value>;
}

impl<E: RemoteError> AnyRemoteError for E {
    fn type_identifier(&self) -> &'static str {
        E::TYPE_IDENTIFIER
    }

    fn to_args(&self) -> Vec<Value> {
        RemoteError::to_args(self)
    }
}

type Renderer = fn(&[Value]) -> String;

fn renderer_registry() -> &'static SyncMutex<HashMap<&'static str, Renderer>> {
    static REGISTRY: OnceLock<SyncMutex<HashMap<&'static str, Renderer>>> = OnceLock::new();
    REGISTRY.get_or_init(|| SyncMutex::new(HashMap::new()))
}

/// Registers `E` so that an `ERR` frame naming `E::TYPE_IDENTIFIER` can be
/// rendered back into readable text on a client that links this crate but
/// never constructs `E` itself — the "dynamic dispatch by string name,
/// without dynamic code loading" pattern.
pub fn register_remote_error<E: RemoteError>() {
    renderer_registry()
        .lock()
        .insert(E::TYPE_IDENTIFIER, E::render);
}

/// Turns a wire `ERR` frame into a [`PrivsepError::Remote`], using a
/// registered renderer if one is available, or a generic fallback.
pub(crate) fn render_remote_error(type_identifier: String, args: Vec<Value>) -> PrivsepError {
    let display = renderer_registry()
        .lock()
        .get(type_identifier.as_str())
        .map(|render| render(&args))
        .unwrap_or_else(|| {
            let parts: Vec<String> = args.iter().map(|v| v.to_string()).collect();
            format!("{type_identifier}({})", parts.join(", "))
        });
    PrivsepError::Remote {
        type_identifier,
        display,
        args,
    }
}

/// A registered entry-point: the context that owns it, the handler itself,
/// and its per-call timeout.
struct EntryPointRegistration {
    context_id: u64,
    handler: Arc<dyn Fn(Vec<Value>, Value) -> Result<Value, Box<dyn AnyRemoteError>> + Send + Sync>,
    timeout: Option<Duration>,
}

fn entry_points() -> &'static SyncMutex<HashMap<String, EntryPointRegistration>> {
    static REGISTRY: OnceLock<SyncMutex<HashMap<String, EntryPointRegistration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| SyncMutex::new(HashMap::new()))
}

fn next_context_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

fn named_contexts() -> &'static SyncMutex<HashMap<String, Arc<Context>>> {
    static REGISTRY: OnceLock<SyncMutex<HashMap<String, Arc<Context>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| SyncMutex::new(HashMap::new()))
}

/// Publishes `context` under `name` so a rootwrap-exec'd helper process can
/// find it again by the string the original process put in
/// `--privsep_context`. Stands in for the upstream's
/// `importutils.import_class(pypath)`, which relies on Python's ability to
/// import an arbitrary module by dotted name at runtime — something Rust has
/// no equivalent of. Applications that use [`Method::Rootwrap`] must call
/// this for every context before their helper binary's `main` parses
/// arguments; see `privsep-daemon`'s `helper_main`.
pub fn register_named_context(name: impl Into<String>, context: Arc<Context>) {
    named_contexts().lock().insert(name.into(), context);
}

/// Looks a context up by the name it was published under with
/// [`register_named_context`].
pub fn lookup_named_context(name: &str) -> Option<Arc<Context>> {
    named_contexts().lock().get(name).cloned()
}

/// A privilege-separation context: a module prefix, a capability set, and
/// the collection of entry-points registered under it. One process may hold
/// several independent contexts, each with its own helper.
pub struct Context {
    id: u64,
    prefix: String,
    capabilities: Vec<CapabilityName>,
    user: Option<String>,
    group: Option<String>,
    pypath: Option<String>,
    helper_command_override: Option<Vec<String>>,
    pool_size: usize,
    client_mode: AtomicBool,
    channel: AsyncMutex<Option<ClientChannel>>,
}

impl Context {
    /// `prefix` bounds which entry-point names may register against this
    /// context (e.g. `"demos::priv"`). `capabilities` is the set the helper
    /// retains after dropping privileges — an empty set is legal and means
    /// "no capabilities at all", matching the upstream behaviour that there
    /// is intentionally no spelling for "keep everything".
    pub fn new(prefix: impl Into<String>, capabilities: Vec<CapabilityName>) -> Self {
        Context {
            id: next_context_id(),
            prefix: prefix.into(),
            capabilities,
            user: None,
            group: None,
            pypath: None,
            helper_command_override: None,
            pool_size: 8,
            client_mode: AtomicBool::new(true),
            channel: AsyncMutex::new(None),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// The name under which a rootwrap-started helper process can look this
    /// context back up (see [`crate::bootstrap`]). Required for
    /// [`Method::Rootwrap`]; unused for [`Method::Fork`].
    pub fn with_pypath(mut self, pypath: impl Into<String>) -> Self {
        self.pypath = Some(pypath.into());
        self
    }

    pub fn with_helper_command(mut self, command: Vec<String>) -> Self {
        self.helper_command_override = Some(command);
        self
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn capabilities(&self) -> &[CapabilityName] {
        &self.capabilities
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn is_client_mode(&self) -> bool {
        self.client_mode.load(Ordering::SeqCst)
    }

    /// The daemon loop calls this once, immediately after taking over the
    /// helper side of a freshly forked or exec'd process: entry-points
    /// invoked through `self` from now on run locally instead of over the
    /// wire.
    pub fn set_client_mode(&self, enabled: bool) {
        self.client_mode.store(enabled, Ordering::SeqCst);
    }

    /// Registers `name` as an entry-point of this context. `name` must sit
    /// below this context's prefix, and must not already be registered —
    /// by this context or any other. Re-registering the same name, even
    /// under the same context, is a programming error and is rejected
    /// rather than silently overwriting the existing handler.
    pub fn entrypoint<F>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        handler: F,
    ) -> Result<(), PrivsepError>
    where
        F: Fn(Vec<Value>, Value) -> Result<Value, Box<dyn AnyRemoteError>> + Send + Sync + 'static,
    {
        if !name.starts_with(&self.prefix) {
            return Err(PrivsepError::Protocol {
                detail: format!(
                    "entrypoint `{name}` must be below prefix `{}`",
                    self.prefix
                ),
            });
        }

        let mut registry = entry_points().lock();
        if registry.contains_key(name) {
            return Err(PrivsepError::Protocol {
                detail: format!("`{name}` is already a registered entry-point"),
            });
        }
        registry.insert(
            name.to_owned(),
            EntryPointRegistration {
                context_id: self.id,
                handler: Arc::new(handler),
                timeout,
            },
        );
        Ok(())
    }

    /// Whether `name` is a registered entry-point of this specific context.
    pub fn is_entrypoint(&self, name: &str) -> bool {
        entry_points()
            .lock()
            .get(name)
            .is_some_and(|reg| reg.context_id == self.id)
    }

    fn entrypoint_timeout(&self, name: &str) -> Option<Duration> {
        entry_points().lock().get(name).and_then(|reg| reg.timeout)
    }

    /// Calls the named entry-point, over the wire in client mode or locally
    /// once the daemon has taken over (see [`Context::set_client_mode`]).
    /// `kwargs` must be a msgpack map; pass [`crate::wire::empty_kwargs`] for
    /// calls that have none.
    pub async fn invoke(
        &self,
        name: &str,
        args: Vec<Value>,
        kwargs: Value,
    ) -> Result<Value, PrivsepError> {
        if self.is_client_mode() {
            let timeout = self.entrypoint_timeout(name);
            let guard = self.channel.lock().await;
            let channel = guard.as_ref().ok_or_else(|| PrivsepError::HelperUnavailable {
                detail: "call Context::start() before invoking entry-points".to_owned(),
            })?;
            channel.remote_call(name, args, kwargs, timeout).await
        } else {
            dispatch_local(self.id, name, args, kwargs)
        }
    }

    /// Starts the privileged helper using `method`, unless already running.
    pub async fn start(&self, method: Method) -> Result<(), PrivsepError> {
        let mut guard = self.channel.lock().await;
        if guard.is_some() {
            tracing::warn!("privsep daemon already running for context {}", self.id);
            return Ok(());
        }
        let channel = match method {
            Method::Fork => crate::bootstrap::start_fork(self).await?,
            Method::Rootwrap => crate::bootstrap::start_rootwrap(self).await?,
        };
        *guard = Some(channel);
        Ok(())
    }

    /// Shuts the helper channel down, if one is running.
    pub async fn stop(&self) -> Result<(), PrivsepError> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.take() {
            channel.close().await?;
        }
        Ok(())
    }

    /// Builds the argv used to launch the rootwrap helper, following the
    /// upstream ordering exactly: deployments pin this in sudoers/rootwrap
    /// filters, so reordering arguments is a breaking change.
    pub fn helper_command(&self, sock_path: &str) -> Result<Vec<String>, PrivsepError> {
        let pypath = self.pypath.as_deref().ok_or_else(|| PrivsepError::Protocol {
            detail: "helper_command requires a context pypath (see Context::with_pypath)"
                .to_owned(),
        })?;

        let mut cmd = match &self.helper_command_override {
            Some(custom) => custom.clone(),
            None => vec!["sudo".to_owned(), "privsep-helper".to_owned()],
        };

        cmd.push("--privsep_context".to_owned());
        cmd.push(pypath.to_owned());
        cmd.push("--privsep_sock_path".to_owned());
        cmd.push(sock_path.to_owned());
        Ok(cmd)
    }
}

/// Mirrors the upstream's `str(context)` (its `PrivContext.__repr__`, which
/// Python falls back on for `str()` absent an explicit `__str__`): forwarded
/// log records stamp this as their originating process name.
impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context(prefix={})", self.prefix)
    }
}

pub(crate) fn dispatch_local(
    context_id: u64,
    name: &str,
    args: Vec<Value>,
    kwargs: Value,
) -> Result<Value, PrivsepError> {
    let handler = {
        let registry = entry_points().lock();
        let reg = registry
            .get(name)
            .filter(|reg| reg.context_id == context_id)
            .ok_or_else(|| PrivsepError::NotEntryPoint {
                name: name.to_owned(),
            })?;
        reg.handler.clone()
    };
    handler(args, kwargs)
        .map_err(|boxed| render_remote_error(boxed.type_identifier().to_owned(), boxed.to_args()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DemoError(String);

    impl std::fmt::Display for DemoError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "demo failure: {}", self.0)
        }
    }

    impl RemoteError for DemoError {
        const TYPE_IDENTIFIER: &'static str = "privsep_core::tests::DemoError";

        fn to_args(&self) -> Vec<Value> {
            vec![Value::from(self.0.as_str())]
        }

        fn render(args: &[Value]) -> String {
            let reason = args.first().and_then(|v| v.as_str()).unwrap_or("?");
            format!("demo failure: {reason}")
        }
    }

    #[test]
    fn entrypoint_rejects_names_outside_prefix() {
        let ctx = Context::new("ctxtest::alpha", vec![]);
        let err = ctx
            .entrypoint("ctxtest::beta::op", None, |_, _| Ok(Value::Nil))
            .unwrap_err();
        assert!(matches!(err, PrivsepError::Protocol { .. }));
    }

    #[test]
    fn entrypoint_registers_and_is_recognised() {
        let ctx = Context::new("ctxtest::gamma", vec![]);
        ctx.entrypoint("ctxtest::gamma::op", None, |args, _kwargs| {
            Ok(args.into_iter().next().unwrap_or(Value::Nil))
        })
        .unwrap();
        assert!(ctx.is_entrypoint("ctxtest::gamma::op"));
        assert!(!ctx.is_entrypoint("ctxtest::gamma::unregistered"));
    }

    #[test]
    fn entrypoint_rejects_reregistration_under_the_same_context() {
        let ctx = Context::new("ctxtest::epsilon", vec![]);
        ctx.entrypoint("ctxtest::epsilon::op", None, |_, _| Ok(Value::Nil))
            .unwrap();
        let err = ctx
            .entrypoint("ctxtest::epsilon::op", None, |_, _| Ok(Value::Nil))
            .unwrap_err();
        assert!(matches!(err, PrivsepError::Protocol { .. }));
    }

    #[test]
    fn remote_error_round_trips_through_registry() {
        register_remote_error::<DemoError>();
        let rendered = render_remote_error(
            DemoError::TYPE_IDENTIFIER.to_owned(),
            RemoteError::to_args(&DemoError("disk full".to_owned())),
        );
        match rendered {
            PrivsepError::Remote { display, .. } => {
                assert_eq!(display, "demo failure: disk full");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn local_dispatch_returns_not_entry_point_for_unknown_name() {
        let err = dispatch_local(
            u64::MAX,
            "ctxtest::does_not_exist",
            vec![],
            crate::wire::empty_kwargs(),
        )
        .unwrap_err();
        assert!(matches!(err, PrivsepError::NotEntryPoint { .. }));
    }

    #[test]
    fn local_dispatch_rejects_entrypoint_owned_by_another_context() {
        let ctx = Context::new("ctxtest::delta", vec![]);
        ctx.entrypoint("ctxtest::delta::op", None, |_, _| Ok(Value::Nil))
            .unwrap();
        let err = dispatch_local(
            ctx.id().wrapping_add(1),
            "ctxtest::delta::op",
            vec![],
            crate::wire::empty_kwargs(),
        )
        .unwrap_err();
        assert!(matches!(err, PrivsepError::NotEntryPoint { .. }));
    }
}
