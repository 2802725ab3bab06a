//! Platform provider hooks
//!
//! A platform provider plugs into the provisioning run at fixed points.
//! Each point is an independent trait; a provider implements only the ones
//! it needs and advertises them through the capability accessors on
//! [`Provider`]. The orchestrator skips any hook a provider does not offer.
//!
//! | hook | when |
//! |---|---|
//! | [`PreProvider`] | before any manifest is applied |
//! | [`InfraReadyProvider`] | once the control-plane endpoint is valid |
//! | [`IgnitionProvider`] | after infra-ready, to rewrite bootstrap data |
//! | [`PostProvider`] | after machines report infrastructure ready |
//!
//! Hooks must tolerate re-runs after a crash: every create is preceded by
//! a lookup of the existing resource.

pub mod aws;
pub mod azure;
pub mod gcp;
pub mod openstack;
mod registry;

pub use aws::{AwsApi, AwsProvider};
pub use azure::{AzureApi, AzureProvider, CreatedImages};
pub use gcp::{GcpApi, GcpProvider};
pub use openstack::{OpenStackApi, OpenStackProvider};
pub use registry::{create_provider, CloudClients};

use std::path::Path;

use async_trait::async_trait;

use strata_common::{ClusterId, InstallConfig, Result};
use strata_ignition::{CertReissuer, IgnitionOutput};

use crate::client::ManifestStore;
use crate::manifest::{Manifest, ObjectKey};

/// Input to [`PreProvider::pre_provision`]
pub struct PreProvisionInput<'a> {
    /// Cluster identity
    pub cluster_id: &'a ClusterId,
    /// Install configuration
    pub install_config: &'a InstallConfig,
    /// Whether control-plane nodes accept regular workloads
    pub masters_schedulable: bool,
    /// Number of worker MachineSets rendered for the install
    pub worker_machine_sets: usize,
}

/// Input to [`InfraReadyProvider::infra_ready`]
pub struct InfraReadyInput<'a> {
    /// The Cluster API `Cluster` object with a valid endpoint
    pub cluster: &'a Manifest,
    /// Install configuration
    pub install_config: &'a InstallConfig,
    /// Reconciler client
    pub client: &'a dyn ManifestStore,
    /// Cluster identity
    pub cluster_id: &'a ClusterId,
}

/// Input to [`IgnitionProvider::ignition`]
pub struct IgnitionInput<'a> {
    /// Reconciler client
    pub client: &'a dyn ManifestStore,
    /// Bootstrap Ignition as stored in the bootstrap secret
    pub bootstrap_ignition: &'a [u8],
    /// Master Ignition as stored in the master secret
    pub master_ignition: &'a [u8],
    /// Install configuration
    pub install_config: &'a InstallConfig,
    /// Cluster identity
    pub cluster_id: &'a ClusterId,
    /// Issues the machine-config server certificate
    pub cert_reissuer: &'a dyn CertReissuer,
    /// Installer working directory
    pub asset_dir: &'a Path,
}

impl IgnitionInput<'_> {
    /// Output equal to the input documents
    pub fn unchanged(&self) -> IgnitionOutput {
        IgnitionOutput {
            bootstrap: self.bootstrap_ignition.to_vec(),
            master: self.master_ignition.to_vec(),
        }
    }
}

/// Input to [`PostProvider::post_provision`]
pub struct PostProvisionInput<'a> {
    /// Reconciler client
    pub client: &'a dyn ManifestStore,
    /// Install configuration
    pub install_config: &'a InstallConfig,
    /// Cluster identity
    pub cluster_id: &'a ClusterId,
}

/// Creates out-of-band dependencies before manifests are applied
#[async_trait]
pub trait PreProvider: Send + Sync {
    /// Run before any manifest is applied
    async fn pre_provision(&self, input: &PreProvisionInput<'_>) -> Result<()>;
}

/// Wires DNS, firewalls and LB extras once infrastructure exists
#[async_trait]
pub trait InfraReadyProvider: Send + Sync {
    /// Run once the control-plane endpoint is valid
    async fn infra_ready(&self, input: &InfraReadyInput<'_>) -> Result<()>;
}

/// Rewrites bootstrap/master Ignition with discovered infrastructure facts
#[async_trait]
pub trait IgnitionProvider: Send + Sync {
    /// Return edited bootstrap and master Ignition
    async fn ignition(&self, input: &IgnitionInput<'_>) -> Result<IgnitionOutput>;
}

/// Finishes work that needs running machines
#[async_trait]
pub trait PostProvider: Send + Sync {
    /// Run after machines report infrastructure ready
    async fn post_provision(&self, input: &PostProvisionInput<'_>) -> Result<()>;
}

/// A platform provider and the hooks it offers
pub trait Provider: Send + Sync {
    /// Platform name used in logs and errors
    fn name(&self) -> &'static str;

    /// The pre-provision hook, if offered
    fn as_pre_provider(&self) -> Option<&dyn PreProvider> {
        None
    }

    /// The infra-ready hook, if offered
    fn as_infra_ready_provider(&self) -> Option<&dyn InfraReadyProvider> {
        None
    }

    /// The Ignition hook, if offered
    fn as_ignition_provider(&self) -> Option<&dyn IgnitionProvider> {
        None
    }

    /// The post-provision hook, if offered
    fn as_post_provider(&self) -> Option<&dyn PostProvider> {
        None
    }

    /// Decisions and resources recorded by the hooks so far
    fn state(&self) -> ProviderState {
        ProviderState::default()
    }
}

/// What a provider's hooks decided or created during a run
///
/// Fields stay `None` for platforms that never record them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderState {
    /// Whether the installer may create firewall rules (GCP)
    pub create_firewall_rules: Option<bool>,
    /// Gallery images built from the install VHD (Azure)
    pub images: Option<CreatedImages>,
}

/// Provider for platforms without hooks
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultProvider;

impl Provider for DefaultProvider {
    fn name(&self) -> &'static str {
        "default"
    }
}

/// Fetch the platform's infrastructure cluster object (e.g. `AWSCluster`)
///
/// Named after the infra id in the Cluster object's namespace.
pub(crate) async fn infra_cluster(
    client: &dyn ManifestStore,
    cluster: &Manifest,
    api_version: &str,
    kind: &str,
    infra_id: &str,
) -> Result<Manifest> {
    let key = ObjectKey::new(api_version, kind, cluster.namespace(), infra_id);
    client
        .get(&key)
        .await
        .map_err(|e| e.context(format!("failed to get {}", key)))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixtures shared by provider tests

    use serde_json::json;
    use strata_common::CAPI_NAMESPACE;

    use super::*;
    use crate::constants::CAPI_CLUSTER_API_VERSION;

    pub(crate) const INFRA_ID: &str = "demo-x7k2p";

    pub(crate) fn cluster_id() -> ClusterId {
        ClusterId::new(INFRA_ID, "demo")
    }

    pub(crate) fn install_config(platform_yaml: &str) -> InstallConfig {
        let yaml = format!(
            "metadata: {{name: demo}}\nbaseDomain: example.com\nnetworking: {{machineNetwork: [{{cidr: 10.0.0.0/16}}]}}\ncontrolPlane: {{replicas: 3}}\ncompute: [{{name: worker, replicas: 3}}]\nplatform:\n{}",
            platform_yaml
        );
        InstallConfig::from_yaml(&yaml).unwrap()
    }

    /// Reissuer for tests that never reach certificate reissue
    pub(crate) struct NoCerts;

    impl CertReissuer for NoCerts {
        fn reissue_mcs(
            &self,
            _: &str,
            _: &[std::net::IpAddr],
        ) -> std::result::Result<strata_ignition::CertKeyPair, strata_ignition::PkiError> {
            Err(strata_ignition::PkiError::Generation(
                "unexpected certificate reissue".into(),
            ))
        }
    }

    /// Reissuer that hands back a fixed pair and records the IPs it signed
    #[derive(Default)]
    pub(crate) struct StubCerts {
        pub(crate) ips: parking_lot::Mutex<Vec<std::net::IpAddr>>,
    }

    impl CertReissuer for StubCerts {
        fn reissue_mcs(
            &self,
            _: &str,
            ips: &[std::net::IpAddr],
        ) -> std::result::Result<strata_ignition::CertKeyPair, strata_ignition::PkiError> {
            self.ips.lock().extend_from_slice(ips);
            Ok(strata_ignition::CertKeyPair {
                cert_pem: "stub-cert".to_string(),
                key_pem: "stub-key".to_string(),
            })
        }
    }

    pub(crate) const MASTER_POINTER: &[u8] = br#"{"ignition":{"config":{"merge":[{"source":"https://api-int.demo.example.com:22623/config/master"}]},"version":"3.2.0"}}"#;

    /// Bootstrap Ignition asking for cluster-hosted DNS on `platform`, with
    /// machine-config server TLS files to reissue
    pub(crate) fn cluster_hosted_bootstrap(platform: &str) -> Vec<u8> {
        use strata_ignition::edit::{INFRASTRUCTURE_FILE_PATH, MCS_CERT_PATH, MCS_KEY_PATH};
        use strata_ignition::{File, IgnitionConfig};

        let infra = format!(
            "status:\n  platformStatus:\n    {}:\n      cloudLoadBalancerConfig:\n        dnsType: ClusterHosted\n",
            platform
        );
        let mut config = IgnitionConfig::default();
        config.ignition.version = "3.2.0".to_string();
        config.upsert_file(File::inline(INFRASTRUCTURE_FILE_PATH, infra.as_bytes(), 0o644));
        config.upsert_file(File::inline(MCS_CERT_PATH, b"old-cert", 0o644));
        config.upsert_file(File::inline(MCS_KEY_PATH, b"old-key", 0o600));
        config.to_vec().unwrap()
    }

    /// Decoded contents of a file in an Ignition config
    pub(crate) fn ignition_file(ignition: &[u8], path: &str) -> String {
        let config = strata_ignition::IgnitionConfig::from_slice(ignition).unwrap();
        let data = config.file(path).unwrap().decoded_contents().unwrap();
        String::from_utf8(data).unwrap()
    }

    /// Data of the LB override ConfigMap written under `asset_dir`
    pub(crate) fn lb_config_data(asset_dir: &Path) -> std::collections::BTreeMap<String, String> {
        let path = strata_ignition::lbconfig::lb_config_path(asset_dir);
        let raw = std::fs::read_to_string(path).unwrap();
        let map: k8s_openapi::api::core::v1::ConfigMap = serde_yaml::from_str(&raw).unwrap();
        map.data.unwrap_or_default()
    }

    /// Merge sources of a pointer Ignition
    pub(crate) fn merge_sources(ignition: &[u8]) -> Vec<String> {
        let config = strata_ignition::IgnitionConfig::from_slice(ignition).unwrap();
        config
            .ignition
            .config
            .map(|c| c.merge.into_iter().filter_map(|r| r.source).collect())
            .unwrap_or_default()
    }

    pub(crate) fn capi_cluster() -> Manifest {
        Manifest::new(CAPI_CLUSTER_API_VERSION, "Cluster", INFRA_ID, CAPI_NAMESPACE).with_spec(
            json!({"controlPlaneEndpoint": {"host": "api.demo.example.com", "port": 6443}}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PreOnly;

    #[async_trait]
    impl PreProvider for PreOnly {
        async fn pre_provision(&self, _: &PreProvisionInput<'_>) -> Result<()> {
            Ok(())
        }
    }

    impl Provider for PreOnly {
        fn name(&self) -> &'static str {
            "pre-only"
        }

        fn as_pre_provider(&self) -> Option<&dyn PreProvider> {
            Some(self)
        }
    }

    #[test]
    fn default_provider_offers_no_hooks() {
        let p = DefaultProvider;
        assert!(p.as_pre_provider().is_none());
        assert!(p.as_infra_ready_provider().is_none());
        assert!(p.as_ignition_provider().is_none());
        assert!(p.as_post_provider().is_none());
    }

    #[test]
    fn providers_advertise_only_what_they_implement() {
        let p = PreOnly;
        assert!(p.as_pre_provider().is_some());
        assert!(p.as_infra_ready_provider().is_none());
        assert_eq!(p.name(), "pre-only");
    }
}
