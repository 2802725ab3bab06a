//! Provisioning orchestrator
//!
//! [`InfraProvider::provision`] drives one install through these states, in
//! order, aborting on the first error:
//!
//! 1. prepare manifests (Ignition secrets, install provenance)
//! 2. pre-provision hook
//! 3. start the reconciler, with teardown on cancellation
//! 4. apply manifests
//! 5. publish the kubeconfig secret
//! 6. wait for a valid control-plane endpoint
//! 7. infra-ready hook
//! 8. Ignition hook, rewriting the Ignition secrets
//! 9. post-provision hook, once every Machine reports infrastructure ready
//! 10. re-read every applied manifest into output files
//!
//! Nothing created before a failure is rolled back; cluster destroy owns
//! that cleanup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use strata_common::retry::{poll_until, Backoff};
use strata_common::{
    ClusterId, Error, InstallConfig, Result, ResultExt, CAPI_NAMESPACE, CLUSTER_NAME_LABEL,
};
use strata_ignition::{inject_install_info, CertReissuer, InstallInfo};

use crate::client::ManifestStore;
use crate::constants::{
    bootstrap_machine_name, ignition_secret_name, kubeconfig_secret_name, BOOTSTRAP_ROLE,
    CAPI_CLUSTER_API_VERSION, IGNITION_FORMAT, KUBECONFIG_SECRET_TYPE, MASTER_ROLE,
    SECRET_FORMAT_KEY, SECRET_VALUE_KEY,
};
use crate::manifest::{Manifest, ObjectKey};
use crate::provider::{
    IgnitionInput, InfraReadyInput, PostProvisionInput, PreProvisionInput, Provider,
    ProviderState,
};
use crate::system::{ReconcilerSystem, SystemState};

/// A file produced by provisioning
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputFile {
    /// File name, `{Kind}-{Namespace}-{Name}.yaml` for manifests
    pub filename: String,
    /// File contents
    pub data: Vec<u8>,
}

/// Everything provisioning consumes, produced by earlier install phases
#[derive(Clone, Debug)]
pub struct ProvisionAssets {
    /// Cluster identity
    pub cluster_id: ClusterId,
    /// Install configuration
    pub install_config: InstallConfig,
    /// Cluster API manifests to apply
    pub manifests: Vec<Manifest>,
    /// Rendered bootstrap Ignition
    pub bootstrap_ignition: Vec<u8>,
    /// Rendered master pointer Ignition
    pub master_ignition: Vec<u8>,
    /// Admin kubeconfig of the new cluster
    pub admin_kubeconfig: Vec<u8>,
    /// Whether control-plane nodes accept regular workloads
    pub masters_schedulable: bool,
    /// Number of worker MachineSets rendered
    pub worker_machine_sets: usize,
    /// Provenance recorded in the bootstrap Ignition
    pub install_info: InstallInfo,
}

/// Read every `*.yaml`/`*.yml` manifest in a directory, sorted by file name
pub fn load_manifests(dir: &Path) -> Result<Vec<Manifest>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read manifest directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            matches!(
                p.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    paths.sort();

    paths
        .iter()
        .map(|path| {
            let yaml = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read manifest {}", path.display()))?;
            Manifest::from_yaml(&yaml)
                .with_context(|| format!("failed to parse manifest {}", path.display()))
        })
        .collect()
}

/// Secret carrying a role's Ignition for the bootstrap provider
pub fn ignition_secret(infra_id: &str, role: &str, ignition: &[u8]) -> Manifest {
    Manifest::secret(
        ignition_secret_name(infra_id, role),
        CAPI_NAMESPACE,
        BTreeMap::from([
            (SECRET_FORMAT_KEY.to_string(), IGNITION_FORMAT.as_bytes().to_vec()),
            (SECRET_VALUE_KEY.to_string(), ignition.to_vec()),
        ]),
    )
    .with_label(CLUSTER_NAME_LABEL, infra_id)
}

/// Kubeconfig secret for a Cluster, owned by it when it has a uid
pub fn kubeconfig_secret(cluster: &Manifest, kubeconfig: &[u8]) -> Manifest {
    let mut secret = Manifest::secret(
        kubeconfig_secret_name(cluster.name()),
        cluster.namespace(),
        BTreeMap::from([(SECRET_VALUE_KEY.to_string(), kubeconfig.to_vec())]),
    )
    .with_type(KUBECONFIG_SECRET_TYPE)
    .with_label(CLUSTER_NAME_LABEL, cluster.name());

    if let Some(uid) = cluster.metadata.uid.as_deref() {
        secret.metadata.owner_references = Some(vec![OwnerReference {
            api_version: cluster.api_version.clone(),
            kind: cluster.kind.clone(),
            name: cluster.name().to_string(),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: None,
        }]);
    }
    secret
}

fn cancelled() -> Error {
    Error::internal_with_context("provision", "provisioning cancelled")
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(cancelled());
    }
    Ok(())
}

/// Drives infrastructure provisioning through the reconciler and a platform
/// provider's hooks
pub struct InfraProvider {
    provider: Box<dyn Provider>,
    system: Arc<dyn ReconcilerSystem>,
    cert_reissuer: Arc<dyn CertReissuer>,
    asset_dir: PathBuf,
    wait: Backoff,
}

impl InfraProvider {
    /// Create an orchestrator
    pub fn new(
        provider: Box<dyn Provider>,
        system: Arc<dyn ReconcilerSystem>,
        cert_reissuer: Arc<dyn CertReissuer>,
        asset_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            provider,
            system,
            cert_reissuer,
            asset_dir: asset_dir.into(),
            wait: Backoff::default(),
        }
    }

    /// Override the readiness backoff
    pub fn with_wait(mut self, wait: Backoff) -> Self {
        self.wait = wait;
        self
    }

    /// The platform provider
    pub fn provider(&self) -> &dyn Provider {
        self.provider.as_ref()
    }

    /// State the provider's hooks recorded during [`Self::provision`]
    pub fn provider_state(&self) -> ProviderState {
        self.provider.state()
    }

    /// Provision the cluster infrastructure
    ///
    /// Cancelling `cancel` tears the reconciler down. The token must be
    /// cancelled eventually, also after success, or the teardown watcher
    /// stays parked.
    pub async fn provision(
        &self,
        assets: &ProvisionAssets,
        cancel: CancellationToken,
    ) -> Result<Vec<OutputFile>> {
        let config = &assets.install_config;
        let cluster_id = &assets.cluster_id;
        config.validate()?;
        info!(
            infra_id = %cluster_id.infra_id,
            provider = self.provider.name(),
            "Provisioning infrastructure"
        );

        let bootstrap_ignition =
            inject_install_info(&assets.bootstrap_ignition, &assets.install_info)
                .context("failed to add install info to bootstrap ignition")?;
        let mut manifests = assets.manifests.clone();
        manifests.push(ignition_secret(
            &cluster_id.infra_id,
            MASTER_ROLE,
            &assets.master_ignition,
        ));
        manifests.push(ignition_secret(
            &cluster_id.infra_id,
            BOOTSTRAP_ROLE,
            &bootstrap_ignition,
        ));

        if let Some(pre) = self.provider.as_pre_provider() {
            info!("Running pre-provision hook");
            pre.pre_provision(&PreProvisionInput {
                cluster_id,
                install_config: config,
                masters_schedulable: assets.masters_schedulable,
                worker_machine_sets: assets.worker_machine_sets,
            })
            .await
            .context("failed during pre-provisioning")?;
        }
        ensure_not_cancelled(&cancel)?;

        self.system
            .run(config)
            .await
            .context("failed to run reconciler system")?;
        let system = self.system.clone();
        let watch = cancel.clone();
        tokio::spawn(async move {
            watch.cancelled().await;
            system.teardown().await;
        });
        let client = self.system.client()?;

        let mut applied = Vec::with_capacity(manifests.len() + 1);
        for mut manifest in manifests {
            ensure_not_cancelled(&cancel)?;
            manifest.set_namespace(CAPI_NAMESPACE);
            let key = manifest.key();
            client
                .create(&manifest)
                .await
                .with_context(|| format!("failed to create manifest {}", key))?;
            debug!(manifest = %key, "Applied manifest");
            applied.push(key);
        }
        info!(count = applied.len(), "Applied manifests");

        let cluster_key = ObjectKey::cluster(CAPI_NAMESPACE, &cluster_id.infra_id);
        let cluster = client
            .get(&cluster_key)
            .await
            .context("failed to get cluster")?;
        let kubeconfig = kubeconfig_secret(&cluster, &assets.admin_kubeconfig);
        client
            .create(&kubeconfig)
            .await
            .context("failed to create kubeconfig secret")?;
        applied.push(kubeconfig.key());

        let cluster = tokio::select! {
            result = self.wait_for_endpoint(client.as_ref(), &cluster_key) => {
                result.context("failed to wait for control plane endpoint")?
            }
            _ = cancel.cancelled() => return Err(cancelled()),
        };
        let endpoint = cluster.control_plane_endpoint();
        if endpoint.host.is_empty() {
            return Err(Error::internal_with_context(
                "provision",
                "control plane endpoint reported valid with an empty host",
            ));
        }
        info!(host = %endpoint.host, port = endpoint.port, "Control plane endpoint available");

        if let Some(hook) = self.provider.as_infra_ready_provider() {
            info!("Running infra-ready hook");
            hook.infra_ready(&InfraReadyInput {
                cluster: &cluster,
                install_config: config,
                client: client.as_ref(),
                cluster_id,
            })
            .await
            .context("failed during infra-ready hook")?;
        }

        if let Some(hook) = self.provider.as_ignition_provider() {
            info!("Running ignition hook");
            let output = hook
                .ignition(&IgnitionInput {
                    client: client.as_ref(),
                    bootstrap_ignition: &bootstrap_ignition,
                    master_ignition: &assets.master_ignition,
                    install_config: config,
                    cluster_id,
                    cert_reissuer: self.cert_reissuer.as_ref(),
                    asset_dir: &self.asset_dir,
                })
                .await
                .context("failed during ignition hook")?;
            for (role, data) in [(BOOTSTRAP_ROLE, &output.bootstrap), (MASTER_ROLE, &output.master)] {
                self.update_ignition_secret(client.as_ref(), &cluster_id.infra_id, role, data)
                    .await?;
            }
        }

        if let Some(hook) = self.provider.as_post_provider() {
            tokio::select! {
                result = self.wait_for_machines(client.as_ref()) => {
                    result.context("failed to wait for machines")?
                }
                _ = cancel.cancelled() => return Err(cancelled()),
            }
            info!("Running post-provision hook");
            hook.post_provision(&PostProvisionInput {
                client: client.as_ref(),
                install_config: config,
                cluster_id,
            })
            .await
            .context("failed during post-provisioning")?;
        }

        let mut files = Vec::with_capacity(applied.len());
        for key in &applied {
            let manifest = client
                .get(key)
                .await
                .with_context(|| format!("failed to get manifest {}", key))?;
            files.push(OutputFile {
                filename: manifest.file_name(),
                data: manifest.to_yaml()?.into_bytes(),
            });
        }
        info!(files = files.len(), "Provisioning complete");
        Ok(files)
    }

    async fn wait_for_endpoint(
        &self,
        client: &dyn ManifestStore,
        key: &ObjectKey,
    ) -> Result<Manifest> {
        poll_until(&self.wait, "control plane endpoint", move || async move {
            match client.get(key).await {
                Ok(cluster) if cluster.control_plane_endpoint().is_valid() => Ok(Some(cluster)),
                Ok(_) => Ok(None),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn wait_for_machines(&self, client: &dyn ManifestStore) -> Result<()> {
        poll_until(&self.wait, "machine infrastructure", move || async move {
            let machines = client
                .list(CAPI_CLUSTER_API_VERSION, "Machine", CAPI_NAMESPACE)
                .await?;
            let pending = machines.iter().filter(|m| !m.infrastructure_ready()).count();
            if machines.is_empty() || pending > 0 {
                debug!(total = machines.len(), pending, "Machines not ready");
                return Ok(None);
            }
            Ok(Some(()))
        })
        .await
    }

    async fn update_ignition_secret(
        &self,
        client: &dyn ManifestStore,
        infra_id: &str,
        role: &str,
        data: &[u8],
    ) -> Result<()> {
        let key = ObjectKey::secret(CAPI_NAMESPACE, &ignition_secret_name(infra_id, role));
        let mut secret = client
            .get(&key)
            .await
            .with_context(|| format!("failed to get {} ignition secret", role))?;
        secret.set_secret_data(SECRET_VALUE_KEY, data);
        client
            .update(&secret)
            .await
            .with_context(|| format!("failed to update {} ignition secret", role))?;
        debug!(role, "Updated ignition secret");
        Ok(())
    }

    /// Delete the bootstrap Machine if the reconciler is running
    ///
    /// A missing Machine counts as deleted.
    pub async fn destroy_bootstrap(&self, cluster_id: &ClusterId) -> Result<()> {
        if self.system.state() != SystemState::Running {
            debug!("Reconciler not running, nothing to destroy");
            return Ok(());
        }
        let client = self.system.client()?;
        let name = bootstrap_machine_name(&cluster_id.infra_id);
        match client.delete(&ObjectKey::machine(CAPI_NAMESPACE, &name)).await {
            Ok(()) => {
                info!(machine = %name, "Deleted bootstrap machine");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(machine = %name, "Bootstrap machine already gone");
                Ok(())
            }
            Err(e) => Err(e.context(format!("failed to delete bootstrap machine {}", name))),
        }
    }

    /// Host addresses for log gathering; none are extracted yet
    pub fn extract_host_addresses(&self, _cluster_id: &ClusterId) -> Result<Vec<String>> {
        warn!("Host address extraction is not implemented for this provisioning flow");
        Ok(Vec::new())
    }
}
