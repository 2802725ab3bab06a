//! Install provenance injected into the bootstrap Ignition
//!
//! The bootstrap node applies everything under `/opt/openshift/manifests`,
//! so dropping a ConfigMap there records who installed the cluster and with
//! which version.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use strata_common::Result;

use crate::config::{File, IgnitionConfig, DEFAULT_FILE_MODE};

/// Path of the provenance manifest inside the bootstrap Ignition
pub const INSTALL_INFO_PATH: &str = "/opt/openshift/manifests/openshift-install-manifests.yaml";
/// Name of the provenance ConfigMap
pub const INSTALL_INFO_NAME: &str = "openshift-install-manifests";
/// Namespace of the provenance ConfigMap
pub const INSTALL_INFO_NAMESPACE: &str = "openshift-config";

/// Who ran the install, and with what
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallInfo {
    /// Tool or user that invoked the install
    pub invoker: String,
    /// Installer version
    pub version: String,
}

impl Default for InstallInfo {
    fn default() -> Self {
        Self {
            invoker: "strata".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl InstallInfo {
    /// The provenance ConfigMap
    pub fn config_map(&self) -> ConfigMap {
        let data = BTreeMap::from([
            ("invoker".to_string(), self.invoker.clone()),
            ("version".to_string(), self.version.clone()),
        ]);
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(INSTALL_INFO_NAME.to_string()),
                namespace: Some(INSTALL_INFO_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }
}

/// Add (or replace) the provenance manifest in a bootstrap Ignition
pub fn inject_install_info(bootstrap: &[u8], info: &InstallInfo) -> Result<Vec<u8>> {
    let mut config = IgnitionConfig::from_slice(bootstrap)?;
    let manifest = serde_yaml::to_string(&info.config_map())?;
    config.upsert_file(File::inline(
        INSTALL_INFO_PATH,
        manifest.as_bytes(),
        DEFAULT_FILE_MODE,
    ));
    debug!(
        invoker = %info.invoker,
        version = %info.version,
        "Injected install info into bootstrap ignition"
    );
    config.to_vec()
}
