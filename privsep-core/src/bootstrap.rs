//! The two ways of bringing up a privileged helper process.
//!
//! Both end with the caller holding a [`ClientChannel`] connected to a
//! daemon loop running [`crate::daemon::run`]; they differ in how that
//! daemon comes to exist.
//!
//! `fork` assumes the calling process already holds every capability the
//! context will ever need and is about to give most of them up — the
//! simplest and most secure option when it applies. `rootwrap` covers the
//! more common case of starting out fully unprivileged and using `sudo` (or
//! any `rootwrap`-style wrapper) to gain privilege in a freshly exec'd
//! process instead.
//!
//! Security-relevant detail carried over unchanged from the original: for
//! the rootwrap path, the **unprivileged** side listens and the
//! **privileged** side connects. That way the listening socket is never
//! reachable from a context that already has elevated rights, which is the
//! wrong direction to expose an attack surface on.

use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};

use crate::channel::ClientChannel;
use crate::context::{Context, Method};
use crate::error::PrivsepError;
use crate::logbridge::TracingLogSink;

fn set_cloexec(fd: RawFd) -> Result<(), PrivsepError> {
    // Raw `fcntl` rather than a `nix` wrapper: avoids pinning this module to
    // whichever fd-ownership convention the linked `nix` version currently
    // uses for this call, matching how `capability.rs` goes straight to
    // `libc` for the same reason.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(PrivsepError::Transport {
            operation: "fcntl(F_GETFD)",
            source: std::io::Error::last_os_error(),
        });
    }
    if flags & libc::FD_CLOEXEC == 0 {
        let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
        if ret < 0 {
            return Err(PrivsepError::Transport {
                operation: "fcntl(F_SETFD, FD_CLOEXEC)",
                source: std::io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}

/// Starts the helper by forking the current process. Must be called before
/// the embedding application has spun up a multi-threaded async runtime:
/// `fork()` only duplicates the calling thread, so anything another thread
/// held a lock on (allocator arenas, `tokio`'s own worker state) is
/// unrecoverable in the child. The child builds its own fresh
/// single-threaded runtime after forking rather than reusing the parent's.
pub async fn start_fork(context: &Context) -> Result<ClientChannel, PrivsepError> {
    let (sock_a, sock_b) = nix::sys::socket::socketpair(
        nix::sys::socket::AddressFamily::Unix,
        nix::sys::socket::SockType::Stream,
        None,
        nix::sys::socket::SockFlag::empty(),
    )
    .map_err(|e| PrivsepError::Transport {
        operation: "socketpair",
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    set_cloexec(sock_a.as_raw_fd())?;
    set_cloexec(sock_b.as_raw_fd())?;

    // Flush anything buffered so neither side double-writes it post-fork.
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    // Build everything the child needs to run standalone before forking:
    // std::process::Command-free std::os fork via `nix` does not let the
    // child inherit a tokio runtime, so the child constructs its own.
    let capabilities = context.capabilities().to_vec();
    let user = context.user().map(str::to_owned);
    let group = context.group().map(str::to_owned);
    let pool_size = context.pool_size();
    let prefix = context.prefix().to_owned();

    // SAFETY: forking a process that has not yet started a multi-threaded
    // tokio runtime is async-signal-safe for the narrow set of calls the
    // child makes before building its own runtime.
    match unsafe { nix::unistd::fork() } {
        Ok(nix::unistd::ForkResult::Child) => {
            drop(sock_a);
            run_forked_child(sock_b.as_raw_fd(), prefix, capabilities, user, group, pool_size)
        }
        Ok(nix::unistd::ForkResult::Parent { .. }) => {
            drop(sock_b);
            let stream = unix_stream_from_fd(sock_a.as_raw_fd())?;
            std::mem::forget(sock_a);
            ClientChannel::connect(stream, Arc::new(TracingLogSink)).await
        }
        Err(e) => Err(PrivsepError::FailedToDropPrivileges {
            detail: format!("fork() failed: {e}"),
        }),
    }
}

fn unix_stream_from_fd(fd: RawFd) -> Result<UnixStream, PrivsepError> {
    use std::os::unix::io::FromRawFd;
    let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
    std_stream
        .set_nonblocking(true)
        .map_err(|source| PrivsepError::Transport {
            operation: "set_nonblocking",
            source,
        })?;
    UnixStream::from_std(std_stream).map_err(|source| PrivsepError::Transport {
        operation: "UnixStream::from_std",
        source,
    })
}

/// Runs entirely inside the forked child: builds the standalone `Context`
/// the daemon loop dispatches against, a fresh single-threaded runtime, and
/// never returns.
fn run_forked_child(
    sock_fd: RawFd,
    prefix: String,
    capabilities: Vec<crate::capability::CapabilityName>,
    user: Option<String>,
    group: Option<String>,
    pool_size: usize,
) -> ! {
    let mut context = Context::new(prefix, capabilities).with_pool_size(pool_size);
    if let Some(user) = user {
        context = context.with_user(user);
    }
    if let Some(group) = group {
        context = context.with_group(group);
    }
    let context = Arc::new(context);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(_) => std::process::exit(1),
    };

    let exit_code = runtime.block_on(async move {
        let stream = match unix_stream_from_fd(sock_fd) {
            Ok(stream) => stream,
            Err(_) => return 1,
        };
        let channel = crate::channel::ServerChannel::new(stream);
        match crate::daemon::run(channel, context).await {
            Ok(()) => 0,
            Err(_) => 1,
        }
    });

    std::process::exit(exit_code);
}

/// Starts the helper via `sudo`/rootwrap: listens on a private Unix socket,
/// execs the helper command, and accepts its connection back.
pub async fn start_rootwrap(context: &Context) -> Result<ClientChannel, PrivsepError> {
    let tmpdir = tempdir()?;
    let sock_path = tmpdir.join("privsep.sock");

    let listener = UnixListener::bind(&sock_path).map_err(|source| PrivsepError::Transport {
        operation: "bind rootwrap socket",
        source,
    })?;

    let argv = context.helper_command(sock_path.to_string_lossy().as_ref())?;
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| PrivsepError::Protocol {
            detail: "helper_command produced an empty argv".to_owned(),
        })?;

    tracing::info!(command = ?argv, "running privsep helper");
    let status = tokio::process::Command::new(program)
        .args(rest)
        .status()
        .await
        .map_err(|source| PrivsepError::Transport {
            operation: "spawn privsep helper",
            source,
        })?;

    let cleanup = || {
        let _ = std::fs::remove_file(&sock_path);
        let _ = std::fs::remove_dir(&tmpdir);
    };

    if !status.success() {
        cleanup();
        return Err(PrivsepError::FailedToDropPrivileges {
            detail: format!("privsep helper command exited non-zero ({status})"),
        });
    }

    let accept_result = listener.accept().await;
    cleanup();
    let (stream, _addr) = accept_result.map_err(|source| PrivsepError::Transport {
        operation: "accept rootwrap connection",
        source,
    })?;

    tracing::info!("spawned new privsep daemon via rootwrap");
    ClientChannel::connect(stream, Arc::new(TracingLogSink)).await
}

fn tempdir() -> Result<std::path::PathBuf, PrivsepError> {
    let base = std::env::temp_dir();
    let unique = format!("privsep-{}", uuid::Uuid::new_v4());
    let path = base.join(unique);
    std::fs::create_dir(&path).map_err(|source| PrivsepError::Transport {
        operation: "mkdtemp",
        source,
    })?;
    // NB: created 0700 by default umask on a fresh directory owned by us;
    // tightened explicitly since the umask may have been loosened upstream.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700));
    }
    Ok(path)
}

/// Convenience used by applications that want one call to pick the method.
pub async fn start(context: &Context, method: Method) -> Result<ClientChannel, PrivsepError> {
    match method {
        Method::Fork => start_fork(context).await,
        Method::Rootwrap => start_rootwrap(context).await,
    }
}
