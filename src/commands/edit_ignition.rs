//! Edit-ignition command
//!
//! Runs the load balancer Ignition edit offline against rendered files, for
//! installs where the LB addresses are known up front.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Args;
use tracing::info;

use strata_ignition::{edit_ignition, EditIgnitionInput, IgnitionOutput};

use super::{load_install_config, load_root_ca, read_file, write_file};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct EditIgnitionArgs {
    /// Rendered bootstrap Ignition
    #[arg(long)]
    pub bootstrap: PathBuf,

    /// Rendered master pointer Ignition
    #[arg(long)]
    pub master: PathBuf,

    /// Install config the Ignition was rendered from
    #[arg(long)]
    pub install_config: PathBuf,

    /// Root CA certificate (PEM) signing the machine-config server cert
    #[arg(long)]
    pub root_ca_cert: PathBuf,

    /// Root CA key (PEM)
    #[arg(long)]
    pub root_ca_key: PathBuf,

    /// Public API load balancer address (repeatable)
    #[arg(long = "public-ip")]
    pub public_ips: Vec<IpAddr>,

    /// Internal API load balancer address (repeatable)
    #[arg(long = "private-ip")]
    pub private_ips: Vec<IpAddr>,

    /// Directory for the edited Ignition and the LB override manifest
    #[arg(long)]
    pub out_dir: PathBuf,
}

pub fn run(args: EditIgnitionArgs) -> Result<()> {
    let output = edit(&args)?;
    let bootstrap = args.out_dir.join("bootstrap.ign");
    let master = args.out_dir.join("master.ign");
    write_file(&bootstrap, &output.bootstrap)?;
    write_file(&master, &output.master)?;
    info!(
        bootstrap = %bootstrap.display(),
        master = %master.display(),
        "Wrote edited ignition"
    );
    Ok(())
}

fn edit(args: &EditIgnitionArgs) -> Result<IgnitionOutput> {
    if args.public_ips.is_empty() && args.private_ips.is_empty() {
        return Err(Error::invalid_argument(
            "at least one --public-ip or --private-ip is required",
        ));
    }

    let config = load_install_config(&args.install_config)?;
    let root_ca = load_root_ca(&args.root_ca_cert, &args.root_ca_key)?;

    let bootstrap = read_file(&args.bootstrap)?;
    let master = read_file(&args.master)?;
    let cluster_domain = config.cluster_domain();
    std::fs::create_dir_all(&args.out_dir).map_err(|source| Error::Write {
        path: args.out_dir.clone(),
        source,
    })?;

    let public: Vec<String> = args.public_ips.iter().map(ToString::to_string).collect();
    let private: Vec<String> = args.private_ips.iter().map(ToString::to_string).collect();
    let output = edit_ignition(
        &EditIgnitionInput {
            bootstrap: &bootstrap,
            master: &master,
            cluster_domain: &cluster_domain,
            asset_dir: &args.out_dir,
            cert_reissuer: &root_ca,
        },
        config.platform.kind()?,
        &public,
        &private,
    )?;
    Ok(output)
}
