//! Command implementations for dlmcore.
//!
//! This module provides the dispatcher that routes CLI commands to their
//! implementations.

mod config_cmd;
mod simulate;

use crate::cli::{Command, ConfigAction, ConfigCommand};
use crate::error::Result;

/// Dispatch a command to its implementation.
pub fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Simulate(args) => simulate::cmd_simulate(args),
        Command::Config(config_cmd) => dispatch_config(config_cmd),
    }
}

/// Dispatch config subcommands.
fn dispatch_config(config_cmd: ConfigCommand) -> Result<()> {
    match config_cmd.action {
        ConfigAction::Check(args) => config_cmd::cmd_config_check(args),
        ConfigAction::Defaults => config_cmd::cmd_config_defaults(),
    }
}
