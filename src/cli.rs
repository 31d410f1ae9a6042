//! CLI argument parsing for the offboarding workflow.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "offboard",
    version,
    about = "Offboard a Mac from directory, device management and FileVault",
    after_help = "Commands:\n  run      Execute the offboarding workflow (requires root)\n  check    Validate the configuration and print the resolved settings\n  status   Report binding, accounts, encryption and enrollment without changing anything\n\nExamples:\n  sudo offboard run --config /Library/Application\\ Support/Acme/offboard.json\n  offboard check --config ./offboard.json\n  sudo offboard status --json",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Check(CheckArgs),
    Status(StatusArgs),
}

/// Run command inputs.
#[derive(Parser, Debug)]
#[command(about = "Execute the offboarding workflow")]
pub struct RunArgs {
    /// Config file (defaults to $OFFBOARD_CONFIG, then the user config dir)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log debug detail, including every command run
    #[arg(long)]
    pub verbose: bool,

    /// Emit the run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Validate the configuration and print it with secrets redacted")]
pub struct CheckArgs {
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Status command inputs.
#[derive(Parser, Debug)]
#[command(about = "Read-only probe of the offboarding-relevant state")]
pub struct StatusArgs {
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Emit machine-readable JSON output
    #[arg(long)]
    pub json: bool,
}
