//! Centralized constants for the strata-capi crate

// =============================================================================
// API Versions
// =============================================================================

/// Core Cluster API version (Cluster, Machine)
pub const CAPI_CLUSTER_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// AWS infrastructure API version
pub const AWS_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta2";

/// Azure infrastructure API version
pub const AZURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// GCP infrastructure API version
pub const GCP_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// OpenStack infrastructure API version
pub const OPENSTACK_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";

/// Core Kubernetes API version (Secret, ConfigMap)
pub const CORE_API_VERSION: &str = "v1";

// =============================================================================
// Secrets
// =============================================================================

/// Secret type Cluster API expects for generated kubeconfigs
pub const KUBECONFIG_SECRET_TYPE: &str = "cluster.x-k8s.io/secret";

/// Data key holding the payload of CAPI bootstrap and kubeconfig secrets
pub const SECRET_VALUE_KEY: &str = "value";

/// Data key naming the payload format of bootstrap secrets
pub const SECRET_FORMAT_KEY: &str = "format";

/// Format marker for Ignition bootstrap data
pub const IGNITION_FORMAT: &str = "ignition";

/// Ignition secret role for the bootstrap machine
pub const BOOTSTRAP_ROLE: &str = "bootstrap";

/// Ignition secret role for control-plane machines
pub const MASTER_ROLE: &str = "master";

// =============================================================================
// Names
// =============================================================================

/// Name of the bootstrap Machine for an install
pub fn bootstrap_machine_name(infra_id: &str) -> String {
    format!("{}-{}", infra_id, BOOTSTRAP_ROLE)
}

/// Name of the Ignition secret for a role
pub fn ignition_secret_name(infra_id: &str, role: &str) -> String {
    format!("{}-{}", infra_id, role)
}

/// Name of the kubeconfig secret for a cluster
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{}-kubeconfig", cluster_name)
}
