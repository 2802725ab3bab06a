//! Strata CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

use strata_common::telemetry::LogFormat;

/// Strata - Cluster API infrastructure provisioning
#[derive(Parser, Debug)]
#[command(name = "strata")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate an install config
    Validate(commands::validate::ValidateArgs),
    /// Patch load balancer addresses into bootstrap and master Ignition
    EditIgnition(commands::edit_ignition::EditIgnitionArgs),
    /// Provision cluster infrastructure through a Cluster API reconciler
    Provision(commands::provision::ProvisionArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Validate(args) => commands::validate::run(args),
            Commands::EditIgnition(args) => commands::edit_ignition::run(args),
            Commands::Provision(args) => commands::provision::run(args).await,
        }
    }
}
