//! The privileged helper's request loop: privilege drop, dispatch, and the
//! bounded worker pool backing it.
//!
//! `run()` performs the same four steps as the original `Daemon.run()` in
//! the exact order that matters for security (`chdir` and `umask` first, so
//! a dropped-privilege process never briefly inherits a dangerous working
//! directory; capabilities last, after uid/gid are already gone).

use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::capability;
use crate::channel::{ServerChannel, ServerWriter};
use crate::context::{dispatch_local, Context};
use crate::error::PrivsepError;
use crate::logbridge::LogRecord;
use crate::wire::Frame;

/// Runs the privileged side of one channel to completion. Returns once the
/// client disconnects (or a reply write hits a broken pipe), exactly like
/// the upstream loop falling out of its `for msgid, msg in self.channel`.
///
/// Callers are responsible for having already forked or been exec'd into the
/// privileged process — this function never forks.
pub async fn run(channel: ServerChannel, context: Arc<Context>) -> Result<(), PrivsepError> {
    prepare_environment()?;
    drop_privileges(&context)?;

    let writer = channel.writer();
    let _log_guard = install_log_forwarding(writer.clone(), context.clone());

    context.set_client_mode(false);
    tracing::info!(context_id = context.id(), "privsep daemon running");

    loop_requests(channel, context, writer).await
}

fn prepare_environment() -> Result<(), PrivsepError> {
    nix::unistd::chdir("/").map_err(|e| PrivsepError::FailedToDropPrivileges {
        detail: format!("chdir(\"/\") failed: {e}"),
    })?;
    nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    Ok(())
}

fn resolve_uid(spec: &str) -> Result<nix::unistd::Uid, PrivsepError> {
    if let Ok(raw) = spec.parse::<u32>() {
        return Ok(nix::unistd::Uid::from_raw(raw));
    }
    nix::unistd::User::from_name(spec)
        .map_err(|e| PrivsepError::FailedToDropPrivileges {
            detail: format!("uid lookup for `{spec}` failed: {e}"),
        })?
        .map(|user| user.uid)
        .ok_or_else(|| PrivsepError::FailedToDropPrivileges {
            detail: format!("no such user `{spec}`"),
        })
}

fn resolve_gid(spec: &str) -> Result<nix::unistd::Gid, PrivsepError> {
    if let Ok(raw) = spec.parse::<u32>() {
        return Ok(nix::unistd::Gid::from_raw(raw));
    }
    nix::unistd::Group::from_name(spec)
        .map_err(|e| PrivsepError::FailedToDropPrivileges {
            detail: format!("gid lookup for `{spec}` failed: {e}"),
        })?
        .map(|group| group.gid)
        .ok_or_else(|| PrivsepError::FailedToDropPrivileges {
            detail: format!("no such group `{spec}`"),
        })
}

/// Drops to the context's configured user/group and capability set.
/// `set_keepcaps` must stay enabled across the `setuid` call or the kernel
/// clears every capability set the moment the uid changes away from root.
fn drop_privileges(context: &Context) -> Result<(), PrivsepError> {
    capability::set_keepcaps(true)?;

    let switch_result = (|| -> Result<(), PrivsepError> {
        if context.group().is_some() {
            nix::unistd::setgroups(&[]).map_err(|e| PrivsepError::FailedToDropPrivileges {
                detail: format!("failed to remove supplemental groups: {e}"),
            })?;
        }
        if let Some(user) = context.user() {
            let uid = resolve_uid(user)?;
            if !uid.is_root() {
                nix::unistd::setuid(uid).map_err(|e| PrivsepError::FailedToDropPrivileges {
                    detail: format!("failed to set uid {uid}: {e}"),
                })?;
            }
        }
        if let Some(group) = context.group() {
            let gid = resolve_gid(group)?;
            if !gid.is_root() {
                nix::unistd::setgid(gid).map_err(|e| PrivsepError::FailedToDropPrivileges {
                    detail: format!("failed to set gid {gid}: {e}"),
                })?;
            }
        }
        Ok(())
    })();

    // Always clear keepcaps before propagating any error above.
    capability::set_keepcaps(false)?;
    switch_result?;

    tracing::info!(
        uid = nix::unistd::getuid().as_raw(),
        gid = nix::unistd::getgid().as_raw(),
        "privsep process running with dropped uid/gid"
    );

    let caps: Vec<u8> = context.capabilities().iter().map(|c| c.index()).collect();
    capability::drop_all_caps_except(&caps, &caps, &[])?;

    let (eff, prm, inh) = capability::get_caps()?;
    tracing::info!(
        effective = ?eff,
        permitted = ?prm,
        inheritable = ?inh,
        "privsep process capability sets after drop"
    );

    Ok(())
}

trait UidGidExt {
    fn is_root(&self) -> bool;
}

impl UidGidExt for nix::unistd::Uid {
    fn is_root(&self) -> bool {
        self.as_raw() == 0
    }
}

impl UidGidExt for nix::unistd::Gid {
    fn is_root(&self) -> bool {
        self.as_raw() == 0
    }
}

/// Whether a failed reply write should end the dispatch loop quietly (the
/// peer is simply gone) or propagate as a fatal error out of [`run`].
fn is_broken_pipe(error: &PrivsepError) -> bool {
    matches!(
        error,
        PrivsepError::Transport { source, .. } if source.kind() == std::io::ErrorKind::BrokenPipe
    )
}

async fn loop_requests(
    mut channel: ServerChannel,
    context: Arc<Context>,
    writer: ServerWriter,
) -> Result<(), PrivsepError> {
    let pool = Arc::new(Semaphore::new(context.pool_size()));
    // Per-call tasks report their reply-write outcome back here so the loop
    // can react to a dead write side instead of spinning on `recv` forever.
    let (outcome_tx, mut outcome_rx) = tokio::sync::mpsc::unbounded_channel::<PrivsepError>();

    loop {
        tokio::select! {
            biased;

            outcome = outcome_rx.recv() => {
                let Some(error) = outcome else {
                    unreachable!("outcome_tx is held by this function's own spawned tasks");
                };
                if is_broken_pipe(&error) {
                    tracing::debug!("privsep reply write hit a broken pipe, shutting down daemon");
                    return Ok(());
                }
                return Err(error);
            }

            request = channel.recv() => {
                let (msgid, frame) = match request? {
                    Some(request) => request,
                    None => {
                        tracing::debug!("privsep channel closed, shutting down daemon");
                        return Ok(());
                    }
                };

                let permit = pool.clone().acquire_owned().await.expect("semaphore never closed");
                let context = context.clone();
                let writer = writer.clone();
                let outcome_tx = outcome_tx.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    // Entry-points are plain synchronous functions and may
                    // block (disk I/O, a deliberate sleep in a test
                    // fixture); running them via `spawn_blocking` keeps one
                    // slow call from starving the runtime's async worker
                    // threads.
                    let reply = tokio::task::spawn_blocking(move || process_request(&context, frame))
                        .await
                        .unwrap_or_else(|_| Frame::Err {
                            type_identifier: "privsep.InternalError".to_owned(),
                            args: vec![rmpv::Value::from("entry-point task panicked")],
                        });
                    if let Err(e) = writer.send(msgid, reply).await {
                        tracing::warn!("failed to send privsep reply: {e}");
                        let _ = outcome_tx.send(e);
                    }
                });
            }
        }
    }
}

fn process_request(context: &Context, frame: Frame) -> Frame {
    match frame {
        Frame::Ping => Frame::Pong,
        Frame::Call { name, args, kwargs } => {
            if !context.is_entrypoint(&name) {
                return Frame::Err {
                    type_identifier: "privsep.NotEntryPoint".to_owned(),
                    args: vec![rmpv::Value::from(name)],
                };
            }
            match dispatch_local(context.id(), &name, args, kwargs) {
                Ok(value) => Frame::Ret { value },
                Err(PrivsepError::Remote {
                    type_identifier,
                    args,
                    ..
                }) => Frame::Err {
                    type_identifier,
                    args,
                },
                Err(other) => Frame::Err {
                    type_identifier: "privsep.InternalError".to_owned(),
                    args: vec![rmpv::Value::from(other.to_string())],
                },
            }
        }
        other => Frame::Err {
            type_identifier: "privsep.ProtocolError".to_owned(),
            args: vec![rmpv::Value::from(format!("unexpected request frame: {other:?}"))],
        },
    }
}

/// Installs a `tracing_subscriber::Layer` that forwards every event emitted
/// on the privileged side back to the client as an out-of-band `LOG` frame.
/// The returned guard keeps the layer registered for as long as it's held.
fn install_log_forwarding(
    writer: ServerWriter,
    context: Arc<Context>,
) -> tracing::subscriber::DefaultGuard {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    let process_name = context.to_string();
    let layer = PrivsepLogLayer { writer, process_name };
    let subscriber = Registry::default().with(layer);
    tracing::subscriber::set_default(subscriber)
}

struct PrivsepLogLayer {
    writer: ServerWriter,
    process_name: String,
}

impl<S> tracing_subscriber::Layer<S> for PrivsepLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = crate::logbridge::RecordVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            level: crate::logbridge::LevelOrDefault(*event.metadata().level()),
            target: event.metadata().target().to_owned(),
            message: visitor.message,
            fields: visitor.fields,
            process_name: self.process_name.clone(),
            exc_text: visitor.exc_text,
        };

        let writer = self.writer.clone();
        tokio::spawn(async move {
            let _ = writer.send(None::<Uuid>, Frame::Log { record }).await;
        });
    }
}
