//! dlmcore: distributed lock manager core.
//!
//! This is the main entry point for the `dlmcore` CLI. It parses arguments,
//! installs the logger, dispatches to the appropriate command handler, and
//! handles errors with proper exit codes.

use dlmcore::cli::Cli;
use dlmcore::{commands, exit_codes};
use std::process::ExitCode;

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_logging(cli.verbose);

    match commands::dispatch(cli.command) {
        Ok(()) => ExitCode::from(exit_codes::SUCCESS as u8),
        Err(err) => {
            // Print user-actionable error message to stderr
            eprintln!("Error: {}", err);

            // Return appropriate exit code
            ExitCode::from(err.exit_code() as u8)
        }
    }
}
