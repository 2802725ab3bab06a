//! Common types for strata: errors, install config, retry, and kube helpers

#![deny(missing_docs)]

pub mod error;
pub mod install_config;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ResultExt};
pub use install_config::{ClusterId, InstallConfig, Platform, PlatformKind, Publish};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace the Cluster API manifests for the guest cluster live in
pub const CAPI_NAMESPACE: &str = "openshift-cluster-api-guests";

/// Label key Cluster API uses to tie objects to their Cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Tag/label prefix marking cloud resources as owned by a cluster
pub const CLUSTER_OWNED_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Tag value marking a cloud resource as owned (deleted on destroy)
pub const OWNED_TAG_VALUE: &str = "owned";

/// Port the machine-config server listens on
pub const MACHINE_CONFIG_SERVER_PORT: u16 = 22623;

/// Tag key for an owned cloud resource, e.g. `kubernetes.io/cluster/abc-x7k2p`
pub fn cluster_owned_tag(infra_id: &str) -> String {
    format!("{}{}", CLUSTER_OWNED_TAG_PREFIX, infra_id)
}
