//! CLI argument parsing for dlmcore.
//!
//! Uses clap derive macros for declarative argument definitions.
//! This module defines the command structure; actual implementations
//! are in the `commands` module.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;

/// dlmcore: distributed lock manager core.
///
/// Runs scripted multi-node locking scenarios on an in-process cluster and
/// checks node configuration files.
#[derive(Parser, Debug)]
#[command(name = "dlmcore")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Log more (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands for dlmcore.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a scenario script.
    ///
    /// Starts one lock manager per cluster member, runs the script's steps
    /// in order, checks each step's expected outcome, and prints the final
    /// lock state of every live node.
    Simulate(SimulateArgs),

    /// Node configuration utilities.
    Config(ConfigCommand),
}

/// Arguments for the `simulate` command.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Path to the scenario YAML file.
    pub script: PathBuf,

    /// Print the report as JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

/// Config subcommands.
#[derive(Parser, Debug)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

/// Available config actions.
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate a node config file.
    Check(ConfigCheckArgs),

    /// Print the default config as YAML.
    Defaults,
}

/// Arguments for the `config check` command.
#[derive(Parser, Debug)]
pub struct ConfigCheckArgs {
    /// Path to the node config YAML file.
    pub path: PathBuf,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
