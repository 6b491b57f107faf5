//! `helper_main`: the entry point a rootwrap-exec'd process runs to become
//! the privileged side of a privsep channel.
//!
//! This crate cannot know, at compile time, which application's
//! entry-points it needs to serve — that depends on which context the
//! embedding application registered under which name (see
//! [`privsep_core::context::register_named_context`]). `privsep-helper`
//! (this crate's own binary) is therefore only useful for applications with
//! no entry-points of their own, which in practice means: it's a smoke-test
//! vehicle. Real applications, like `demos` in this workspace, build their
//! own thin binary that registers its contexts and then calls
//! [`helper_main`] exactly the way `privsep-helper`'s `main` does.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Args;
use privsep_core::channel::ServerChannel;
use privsep_core::context::lookup_named_context;

/// Command-line surface of the privileged helper process.
///
/// `--config-file`/`--config-dir` are accepted and ignored by this crate —
/// they exist so that a `helper_command` built from the unprivileged side
/// can pass through whatever configuration discovery flags the embedding
/// application's own config loader expects to see, without this crate
/// needing an opinion about config file formats.
#[derive(Args, Debug)]
pub struct HelperArgs {
    /// Name a context was published under via `register_named_context`.
    #[arg(long)]
    pub privsep_context: String,

    /// Path to the Unix socket the unprivileged process is listening on.
    #[arg(long)]
    pub privsep_sock_path: String,

    /// Accepted and forwarded only; parsing is the embedding application's
    /// responsibility.
    #[arg(long = "config-file")]
    pub config_file: Vec<String>,

    /// Accepted and forwarded only; parsing is the embedding application's
    /// responsibility.
    #[arg(long = "config-dir")]
    pub config_dir: Vec<String>,
}

/// Connects to the unprivileged side's listening socket, resolves the named
/// context, and runs the daemon loop until the channel closes.
pub async fn helper_main(args: HelperArgs) -> ExitCode {
    let context = match lookup_named_context(&args.privsep_context) {
        Some(context) => context,
        None => {
            tracing::error!(
                context = %args.privsep_context,
                "--privsep_context must name a context registered with register_named_context"
            );
            return ExitCode::FAILURE;
        }
    };

    let stream = match tokio::net::UnixStream::connect(&args.privsep_sock_path).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(path = %args.privsep_sock_path, error = %e, "failed to connect to privsep socket");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(pid = std::process::id(), "privsep daemon starting");
    let channel = ServerChannel::new(stream);

    match privsep_core::daemon::run(channel, Arc::clone(&context)).await {
        Ok(()) => {
            tracing::debug!("privsep daemon exiting");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "privsep daemon exiting on error");
            ExitCode::FAILURE
        }
    }
}

/// Installs a `tracing-subscriber` `fmt` layer on stderr, honoring
/// `RUST_LOG`. Called before privilege drop so setup failures are visible.
pub fn install_default_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
