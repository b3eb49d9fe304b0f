// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use clap::{ArgAction, Parser, Subcommand};
use kiln_common::error::Result;
use kiln_common::Config;

pub mod deps;
pub mod info;
pub mod install;
pub mod list;
pub mod reinstall;
pub mod status;
pub mod uninstall;

use crate::cli::deps::Deps;
use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;
use crate::cli::reinstall::ReinstallArgs;
use crate::cli::uninstall::Uninstall;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    /// Increase log verbosity (-v debug, -vv trace); also logs to <root>/kiln_logs
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build and install packages and their dependencies
    Install(InstallArgs),
    /// Rebuild installed packages, optionally with different options
    Reinstall(ReinstallArgs),
    /// Remove installed packages
    Uninstall(Uninstall),
    /// List installed packages
    List(List),
    /// Show a formula's options, dependencies, bottles and caveats
    Info(Info),
    /// Show the resolved dependency order for a formula
    Deps(Deps),
}

impl Command {
    pub async fn run(&self, config: &Config) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config).await,
            Self::Reinstall(command) => command.run(config).await,
            Self::Uninstall(command) => command.run(config),
            Self::List(command) => command.run(config),
            Self::Info(command) => command.run(config),
            Self::Deps(command) => command.run(config),
        }
    }
}
