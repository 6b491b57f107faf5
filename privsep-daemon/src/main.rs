use std::process::ExitCode;

use clap::Parser;
use privsep_daemon::{helper_main, install_default_logging, HelperArgs};

#[derive(Parser, Debug)]
#[command(name = "privsep-helper", about = "Privilege-separation daemon helper")]
struct Cli {
    #[command(flatten)]
    args: HelperArgs,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    install_default_logging();
    let cli = Cli::parse();
    helper_main(cli.args).await
}
