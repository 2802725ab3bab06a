//! Provision command
//!
//! Drives one provisioning run against a running Cluster API reconciler:
//! applies the rendered manifests, waits for the control plane endpoint,
//! runs the platform hooks and writes every applied object back out.
//!
//! Only hookless platforms can be provisioned from here. The AWS, Azure,
//! GCP and OpenStack providers need cloud clients, which the installer
//! wires in when it embeds this crate.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strata_capi::{
    create_provider, load_manifests, CloudClients, InfraProvider, KubeSystem, ProvisionAssets,
    Provider,
};
use strata_common::{ClusterId, InstallConfig};
use strata_ignition::InstallInfo;

use super::{load_install_config, load_root_ca, read_file, write_file};
use crate::{Error, Result};

#[derive(Args, Debug)]
pub struct ProvisionArgs {
    /// Install config the assets were rendered from
    #[arg(long)]
    pub install_config: PathBuf,

    /// Kubeconfig of the Cluster API reconciler's API server
    #[arg(long)]
    pub kubeconfig: PathBuf,

    /// Directory of Cluster API manifests to apply
    #[arg(long)]
    pub manifests_dir: PathBuf,

    /// Rendered bootstrap Ignition
    #[arg(long)]
    pub bootstrap: PathBuf,

    /// Rendered master pointer Ignition
    #[arg(long)]
    pub master: PathBuf,

    /// Admin kubeconfig of the new cluster
    #[arg(long)]
    pub admin_kubeconfig: PathBuf,

    /// Infrastructure id threaded through resource names
    #[arg(long)]
    pub infra_id: String,

    /// Root CA certificate (PEM) signing the machine-config server cert
    #[arg(long)]
    pub root_ca_cert: PathBuf,

    /// Root CA key (PEM)
    #[arg(long)]
    pub root_ca_key: PathBuf,

    /// Control-plane nodes accept regular workloads
    #[arg(long)]
    pub masters_schedulable: bool,

    /// Number of worker MachineSets rendered for the install
    #[arg(long, default_value = "0")]
    pub worker_machine_sets: usize,

    /// Installer working directory; applied objects are written here
    #[arg(long)]
    pub out_dir: PathBuf,
}

pub async fn run(args: ProvisionArgs) -> Result<()> {
    let assets = load_assets(&args)?;
    let provider = select_provider(&assets.install_config)?;
    let root_ca = load_root_ca(&args.root_ca_cert, &args.root_ca_key)?;
    std::fs::create_dir_all(&args.out_dir).map_err(|source| Error::Write {
        path: args.out_dir.clone(),
        source,
    })?;

    let infra = InfraProvider::new(
        provider,
        Arc::new(KubeSystem::new(&args.kubeconfig)),
        Arc::new(root_ca),
        &args.out_dir,
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, tearing down the reconciler");
            interrupt.cancel();
        }
    });

    let result = infra.provision(&assets, cancel.clone()).await;
    cancel.cancel();
    let files = result?;

    for file in &files {
        write_file(&args.out_dir.join(&file.filename), &file.data)?;
    }
    let state = infra.provider_state();
    info!(
        files = files.len(),
        out_dir = %args.out_dir.display(),
        create_firewall_rules = ?state.create_firewall_rules,
        image_gallery = ?state.images.as_ref().map(|i| i.gallery.as_str()),
        "Provisioning complete"
    );
    Ok(())
}

fn load_assets(args: &ProvisionArgs) -> Result<ProvisionAssets> {
    if args.infra_id.is_empty() {
        return Err(Error::invalid_argument("--infra-id must not be empty"));
    }
    let install_config = load_install_config(&args.install_config)?;
    let cluster_id = ClusterId::new(&args.infra_id, &install_config.metadata.name);
    Ok(ProvisionAssets {
        cluster_id,
        manifests: load_manifests(&args.manifests_dir)?,
        bootstrap_ignition: read_file(&args.bootstrap)?,
        master_ignition: read_file(&args.master)?,
        admin_kubeconfig: read_file(&args.admin_kubeconfig)?,
        masters_schedulable: args.masters_schedulable,
        worker_machine_sets: args.worker_machine_sets,
        install_info: InstallInfo::default(),
        install_config,
    })
}

fn select_provider(config: &InstallConfig) -> Result<Box<dyn Provider>> {
    Ok(create_provider(config.platform.kind()?, CloudClients::default())?)
}
