//! Load-balancer override manifest
//!
//! When the cluster hosts its own DNS, later install phases need the LB
//! addresses discovered during provisioning. They are persisted as a
//! ConfigMap manifest in the asset directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::info;

use strata_common::{Error, Result};

/// File name of the override manifest, relative to `<assetDir>/openshift`
pub const LB_CONFIG_FILE_NAME: &str = "99_openshift-lbconfig-custom-dns.yaml";
/// Name of the override ConfigMap
pub const LB_CONFIG_NAME: &str = "openshift-lbconfig-custom-dns";
/// Namespace of the override ConfigMap
pub const LB_CONFIG_NAMESPACE: &str = "openshift-infra";
/// Key holding the comma-separated internal API LB addresses
pub const INTERNAL_API_LB_KEY: &str = "internal-api-lb-ip";
/// Key holding the comma-separated external API LB addresses
pub const API_LB_KEY: &str = "api-lb-ip";

/// Path of the override manifest for an asset directory
pub fn lb_config_path(asset_dir: &Path) -> PathBuf {
    asset_dir.join("openshift").join(LB_CONFIG_FILE_NAME)
}

/// Build the override ConfigMap
pub fn lb_config_map(public_ips: &[String], private_ips: &[String]) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(INTERNAL_API_LB_KEY.to_string(), private_ips.join(","));
    if !public_ips.is_empty() {
        data.insert(API_LB_KEY.to_string(), public_ips.join(","));
    }
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(LB_CONFIG_NAME.to_string()),
            namespace: Some(LB_CONFIG_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

/// Write the override manifest under `asset_dir`
pub fn write_lb_config(
    asset_dir: &Path,
    public_ips: &[String],
    private_ips: &[String],
) -> Result<PathBuf> {
    let path = lb_config_path(asset_dir);
    let yaml = serde_yaml::to_string(&lb_config_map(public_ips, private_ips))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::from(e).context(format!("failed to create {}", parent.display()))
        })?;
    }
    std::fs::write(&path, yaml)
        .map_err(|e| Error::from(e).context(format!("failed to write {}", path.display())))?;

    info!(path = %path.display(), "Wrote load balancer config override");
    Ok(path)
}
