//! Manual smoke-test harness for `privsep-core`: drives the fork and
//! rootwrap bootstrap paths end to end against the entry-points in
//! [`entrypoints`].

mod entrypoints;
mod errors;

use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use privsep_core::Method;
use privsep_daemon::HelperArgs;

#[derive(Parser, Debug)]
#[command(name = "privsep-demo")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the helper with the chosen bootstrap method and runs a few
    /// calls through it.
    Client {
        #[arg(long, value_enum, default_value = "fork")]
        method: MethodArg,
    },
    /// Becomes the privileged side of a rootwrap-started channel. Invoked
    /// as `sudo privsep-demo helper --privsep_context ... --privsep_sock_path ...`
    /// via the context's `helper_command`.
    Helper(HelperArgs),
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MethodArg {
    Fork,
    Rootwrap,
}

// `Command::Client { method: Fork }` calls `Context::start(Method::Fork)`,
// whose precondition is that `fork()` happens before the embedding process
// has a multi-threaded async runtime (see `bootstrap::start_fork`) —
// `current_thread` keeps that true, matching `privsep-daemon`'s own binary.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    privsep_daemon::install_default_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Client { method } => run_client(method).await,
        Command::Helper(args) => {
            entrypoints::build_context();
            privsep_daemon::helper_main(args).await
        }
    }
}

async fn run_client(method: MethodArg) -> ExitCode {
    let context = entrypoints::build_context();

    let method = match method {
        MethodArg::Fork => Method::Fork,
        MethodArg::Rootwrap => Method::Rootwrap,
    };

    if let Err(e) = context.start(method).await {
        tracing::error!(error = %e, "failed to start privsep daemon");
        return ExitCode::FAILURE;
    }

    let result = entrypoints::run_smoke_test(&context).await;

    if let Err(e) = context.stop().await {
        tracing::warn!(error = %e, "failed to stop privsep daemon cleanly");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "smoke test failed");
            ExitCode::FAILURE
        }
    }
}
