mod handlers;

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};
use vboxcore::{
    cli::{AnsiStyles, VboxcoreArgs},
    ErrorKind,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let args = VboxcoreArgs::parse();
    init_tracing(args.verbose);

    match handlers::run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.kind() == ErrorKind::Invariant {
                tracing::error!(error = ?e, "command failed");
            } else {
                tracing::debug!(error = ?e, "command failed");
            }
            eprintln!("{}", e.report().error());
            ExitCode::from(e.exit_code())
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Logs to stderr. `RUST_LOG` wins over `--verbose`.
fn init_tracing(verbose: bool) {
    let default = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::WARN
    };

    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
