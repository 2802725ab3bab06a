//! Strata CLI
//!
//! Tooling around Cluster API provisioning.

use clap::Parser;

use strata::{Cli, Result};
use strata_common::telemetry::init_logging;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format)?;
    cli.run().await
}
