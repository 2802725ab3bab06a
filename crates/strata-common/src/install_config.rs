//! Install configuration model
//!
//! The install config is the user-supplied description of the cluster. It is
//! read once at the start of a run and never mutated afterwards. Only the
//! fields the provisioning flow actually consumes are modelled; everything
//! else in the document is ignored on load.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identity of one cluster installation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterId {
    /// Short unique id threaded through every resource name and tag
    #[serde(rename = "infraID")]
    pub infra_id: String,
    /// Human cluster name (metadata.name)
    pub cluster_name: String,
}

impl ClusterId {
    /// Create a cluster id
    pub fn new(infra_id: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            infra_id: infra_id.into(),
            cluster_name: cluster_name.into(),
        }
    }
}

/// Top-level install configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallConfig {
    /// Cluster metadata
    #[serde(default)]
    pub metadata: Metadata,
    /// Parent DNS domain, e.g. `example.com`
    #[serde(default)]
    pub base_domain: String,
    /// Whether endpoints are publicly routable
    #[serde(default)]
    pub publish: Publish,
    /// Network CIDRs
    #[serde(default)]
    pub networking: Networking,
    /// Control-plane machine pool
    #[serde(default)]
    pub control_plane: MachinePool,
    /// Compute machine pools
    #[serde(default)]
    pub compute: Vec<MachinePool>,
    /// Cloud platform selection
    #[serde(default)]
    pub platform: Platform,
}

/// Cluster metadata
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Cluster name
    #[serde(default)]
    pub name: String,
}

/// Publishing strategy for cluster endpoints
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Publish {
    /// API and ingress reachable from the internet
    #[default]
    External,
    /// API and ingress only reachable inside the network
    Internal,
}

/// Network configuration
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    /// Networks machines are attached to
    #[serde(default)]
    pub machine_network: Vec<NetworkEntry>,
    /// Pod networks
    #[serde(default)]
    pub cluster_network: Vec<NetworkEntry>,
    /// Service networks
    #[serde(default)]
    pub service_network: Vec<NetworkEntry>,
}

/// One CIDR entry
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkEntry {
    /// CIDR block, e.g. `10.0.0.0/16`
    pub cidr: String,
}

/// A pool of machines
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachinePool {
    /// Pool name
    #[serde(default)]
    pub name: String,
    /// Number of machines; unset means the platform default
    #[serde(default)]
    pub replicas: Option<u32>,
}

/// Whether DNS records are provisioned by the user instead of the installer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserProvisionedDns {
    /// The installer creates DNS records
    #[default]
    Disabled,
    /// The user creates DNS records; the cluster hosts its own DNS
    Enabled,
}

impl UserProvisionedDns {
    /// Check if user-provisioned DNS is on
    pub fn is_enabled(self) -> bool {
        self == UserProvisionedDns::Enabled
    }
}

/// Platform selection. Exactly one field is expected to be set.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Platform {
    /// Amazon Web Services
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPlatform>,
    /// Microsoft Azure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzurePlatform>,
    /// Google Cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpPlatform>,
    /// OpenStack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenStackPlatform>,
    /// IBM Cloud
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ibmcloud: Option<IbmCloudPlatform>,
    /// oVirt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ovirt: Option<OvirtPlatform>,
    /// IBM Power Virtual Server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub powervs: Option<PowerVsPlatform>,
}

impl Platform {
    /// All platforms that are set, in declaration order
    fn configured(&self) -> Vec<PlatformKind> {
        let mut kinds = Vec::new();
        if self.aws.is_some() {
            kinds.push(PlatformKind::Aws);
        }
        if self.azure.is_some() {
            kinds.push(PlatformKind::Azure);
        }
        if self.gcp.is_some() {
            kinds.push(PlatformKind::Gcp);
        }
        if self.openstack.is_some() {
            kinds.push(PlatformKind::OpenStack);
        }
        if self.ibmcloud.is_some() {
            kinds.push(PlatformKind::IbmCloud);
        }
        if self.ovirt.is_some() {
            kinds.push(PlatformKind::Ovirt);
        }
        if self.powervs.is_some() {
            kinds.push(PlatformKind::PowerVs);
        }
        kinds
    }

    /// The selected platform
    ///
    /// Fails if no platform or more than one platform is configured.
    pub fn kind(&self) -> Result<PlatformKind> {
        match self.configured().as_slice() {
            [one] => Ok(*one),
            [] => Err(Error::validation_for_field(
                "platform",
                "no platform configured",
            )),
            many => Err(Error::validation_for_field(
                "platform",
                format!(
                    "exactly one platform must be configured, found {}",
                    many.iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )),
        }
    }

    /// User-provisioned DNS setting of the selected platform
    ///
    /// Platforms without the feature always report `Disabled`.
    pub fn user_provisioned_dns(&self) -> UserProvisionedDns {
        if let Some(aws) = &self.aws {
            return aws.user_provisioned_dns;
        }
        if let Some(azure) = &self.azure {
            return azure.user_provisioned_dns;
        }
        if let Some(gcp) = &self.gcp {
            return gcp.user_provisioned_dns;
        }
        UserProvisionedDns::Disabled
    }
}

/// Supported platform identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlatformKind {
    /// Amazon Web Services
    Aws,
    /// Microsoft Azure
    Azure,
    /// Google Cloud
    Gcp,
    /// OpenStack
    OpenStack,
    /// IBM Cloud
    IbmCloud,
    /// oVirt
    Ovirt,
    /// IBM Power Virtual Server
    PowerVs,
}

impl PlatformKind {
    /// Lowercase platform name as used in the install config
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Aws => "aws",
            PlatformKind::Azure => "azure",
            PlatformKind::Gcp => "gcp",
            PlatformKind::OpenStack => "openstack",
            PlatformKind::IbmCloud => "ibmcloud",
            PlatformKind::Ovirt => "ovirt",
            PlatformKind::PowerVs => "powervs",
        }
    }
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aws" => Ok(PlatformKind::Aws),
            "azure" => Ok(PlatformKind::Azure),
            "gcp" => Ok(PlatformKind::Gcp),
            "openstack" => Ok(PlatformKind::OpenStack),
            "ibmcloud" => Ok(PlatformKind::IbmCloud),
            "ovirt" => Ok(PlatformKind::Ovirt),
            "powervs" => Ok(PlatformKind::PowerVs),
            other => Err(Error::validation(format!("unknown platform: {}", other))),
        }
    }
}

/// AWS platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwsPlatform {
    /// Region to install into
    #[serde(default)]
    pub region: String,
    /// Existing private hosted zone id, if the user supplies one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosted_zone: Option<String>,
    /// Pre-existing AMI to boot from
    #[serde(default, rename = "amiID", skip_serializing_if = "Option::is_none")]
    pub ami_id: Option<String>,
    /// User-provisioned DNS toggle
    #[serde(default, rename = "userProvisionedDNS")]
    pub user_provisioned_dns: UserProvisionedDns,
}

/// Azure cloud environments
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AzureCloud {
    /// Azure public cloud
    #[default]
    AzurePublicCloud,
    /// Azure US Government cloud
    #[serde(rename = "AzureUSGovernmentCloud")]
    AzureUsGovernmentCloud,
    /// Azure China cloud
    AzureChinaCloud,
    /// Azure Stack Hub
    AzureStackCloud,
}

/// Azure platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatform {
    /// Region to install into
    #[serde(default)]
    pub region: String,
    /// Cloud environment
    #[serde(default)]
    pub cloud_name: AzureCloud,
    /// Resource group holding the public base-domain zone
    #[serde(default)]
    pub base_domain_resource_group_name: String,
    /// Existing resource group to install into; defaults to `{infraID}-rg`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group_name: Option<String>,
    /// Location of the RHCOS VHD to upload
    #[serde(default, rename = "imageURL", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Managed identity assigned to cluster machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_assigned_identity: Option<String>,
    /// User-provisioned DNS toggle
    #[serde(default, rename = "userProvisionedDNS")]
    pub user_provisioned_dns: UserProvisionedDns,
}

impl AzurePlatform {
    /// Resource group the cluster resources live in
    pub fn cluster_resource_group(&self, infra_id: &str) -> String {
        self.resource_group_name
            .clone()
            .unwrap_or_else(|| format!("{}-rg", infra_id))
    }
}

/// GCP platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcpPlatform {
    /// Project to install into
    #[serde(default, rename = "projectID")]
    pub project_id: String,
    /// Region to install into
    #[serde(default)]
    pub region: String,
    /// Existing VPC network name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Host project of a shared VPC
    #[serde(
        default,
        rename = "networkProjectID",
        skip_serializing_if = "Option::is_none"
    )]
    pub network_project_id: Option<String>,
    /// User-provisioned DNS toggle
    #[serde(default, rename = "userProvisionedDNS")]
    pub user_provisioned_dns: UserProvisionedDns,
}

impl GcpPlatform {
    /// Project that owns the network (the shared VPC host project if any)
    pub fn network_project(&self) -> &str {
        self.network_project_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(&self.project_id)
    }

    /// Network name, defaulting to `{infraID}-network`
    pub fn network_name(&self, infra_id: &str) -> String {
        self.network
            .clone()
            .unwrap_or_else(|| format!("{}-network", infra_id))
    }
}

/// OpenStack platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenStackPlatform {
    /// Name of the cloud entry in clouds.yaml
    #[serde(default)]
    pub cloud: String,
    /// External network floating IPs are allocated from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_network: Option<String>,
}

/// IBM Cloud platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IbmCloudPlatform {
    /// Region to install into
    #[serde(default)]
    pub region: String,
}

/// oVirt platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvirtPlatform {
    /// Target oVirt cluster id
    #[serde(default, rename = "ovirt_cluster_id")]
    pub cluster_id: String,
}

/// IBM Power Virtual Server platform settings
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PowerVsPlatform {
    /// Zone to install into
    #[serde(default)]
    pub zone: String,
}

impl InstallConfig {
    /// Parse an install config from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization_for_kind("InstallConfig", e.to_string()))
    }

    /// Read and parse an install config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!(
                "failed to read install config {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&contents)
    }

    /// Check the config for errors that must be fixed before any cloud call
    ///
    /// Reports the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.is_empty() {
            return Err(Error::validation_for_field(
                "metadata.name",
                "cluster name must be set",
            ));
        }
        if self.base_domain.is_empty() {
            return Err(Error::validation_for_field(
                "baseDomain",
                "base domain must be set",
            ));
        }
        self.platform.kind()?;
        if self.networking.machine_network.is_empty() {
            return Err(Error::validation_for_field(
                "networking.machineNetwork",
                "at least one machine network is required",
            ));
        }
        if self.networking.machine_network.iter().any(|n| n.cidr.is_empty()) {
            return Err(Error::validation_for_field(
                "networking.machineNetwork",
                "machine network CIDR must not be empty",
            ));
        }
        if self.control_plane.replicas == Some(0) {
            return Err(Error::validation_for_field(
                "controlPlane.replicas",
                "control plane must have at least one replica",
            ));
        }
        Ok(())
    }

    /// The selected platform
    pub fn platform_kind(&self) -> Result<PlatformKind> {
        self.platform.kind()
    }

    /// DNS domain of the cluster: `{name}.{baseDomain}`
    pub fn cluster_domain(&self) -> String {
        format!("{}.{}", self.metadata.name, self.base_domain)
    }

    /// Total requested compute replicas across all pools
    pub fn compute_replicas(&self) -> u32 {
        self.compute.iter().filter_map(|p| p.replicas).sum()
    }

    /// Machine network CIDRs
    pub fn machine_cidrs(&self) -> Vec<String> {
        self.networking
            .machine_network
            .iter()
            .map(|n| n.cidr.clone())
            .collect()
    }

    /// Check if endpoints are published externally
    pub fn is_external(&self) -> bool {
        self.publish == Publish::External
    }
}
