//! Azure provider hooks
//!
//! - pre-provision: role assignment for the cluster identity, then the RHCOS
//!   image pipeline (storage account, page-blob upload, gallery, gen1/gen2
//!   gallery images)
//! - infra-ready: public CNAME `api` and private A `api`/`api-int` records
//! - ignition: LB frontend addresses patched into the bootstrap Ignition when
//!   the cluster hosts its own DNS

pub mod upload;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use strata_common::install_config::AzurePlatform;
use strata_common::retry::{retry_with_backoff_if, RetryConfig};
use strata_common::{ClusterId, Error, InstallConfig, PlatformKind, Result, ResultExt};
use strata_ignition::{edit_ignition, EditIgnitionInput, IgnitionOutput};

use super::{
    infra_cluster, IgnitionInput, IgnitionProvider, InfraReadyInput, InfraReadyProvider,
    PreProvider, PreProvisionInput, Provider, ProviderState,
};
use crate::client::ManifestStore;
use crate::constants::AZURE_API_VERSION;
use crate::manifest::{Manifest, ObjectKey};

pub use upload::{page_ranges, upload_page_blob, PageRange, UploadOptions};

/// Blob container holding the uploaded VHD
pub const IMAGE_CONTAINER: &str = "vhd";

/// Version of the gallery image versions the pipeline creates
pub const IMAGE_VERSION: &str = "1.0.0";

/// Role granted to the cluster identity on its resource group
pub const IDENTITY_ROLE: &str = "Contributor";

/// TTL of created DNS records, in seconds
pub const RECORD_TTL: u32 = 300;

const STORAGE_ACCOUNT_NAME_MAX: usize = 24;

/// Hyper-V generation of a gallery image
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HyperVGeneration {
    /// Generation 1 (BIOS)
    V1,
    /// Generation 2 (UEFI)
    V2,
}

/// A storage account
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageAccount {
    /// Account name
    pub name: String,
    /// Blob service endpoint, e.g. `https://acct.blob.core.windows.net/`
    pub blob_endpoint: String,
}

/// A gallery image definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GalleryImage {
    /// Gallery name
    pub gallery: String,
    /// Image definition name
    pub name: String,
    /// Hyper-V generation
    pub generation: HyperVGeneration,
    /// Publisher/offer/SKU identifier
    pub sku: String,
    /// Location
    pub region: String,
}

/// A gallery image version backed by a VHD blob
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GalleryImageVersion {
    /// Gallery name
    pub gallery: String,
    /// Image definition name
    pub image: String,
    /// Version string
    pub version: String,
    /// URL of the source VHD page blob
    pub source_blob_url: String,
    /// Storage account holding the blob
    pub storage_account: String,
    /// Regions the version is replicated to
    pub target_regions: Vec<String>,
}

/// A public IP address resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublicIp {
    /// Allocated address
    pub address: String,
    /// DNS name assigned to the address
    pub fqdn: String,
}

/// Kind of DNS record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordType {
    /// IPv4 address record
    A,
    /// Alias record
    Cname,
}

/// A DNS record set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordSet {
    /// Record name relative to the zone
    pub name: String,
    /// Record type
    pub record_type: RecordType,
    /// Addresses (A) or one target host (CNAME)
    pub values: Vec<String>,
    /// TTL in seconds
    pub ttl: u32,
}

/// Where a record set lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsZone {
    /// Resource group of the zone
    pub resource_group: String,
    /// Zone name
    pub name: String,
    /// Private DNS zone rather than a public one
    pub private: bool,
}

/// The Azure APIs the hooks use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AzureApi: Send + Sync {
    /// Storage account by name, None if absent
    async fn get_storage_account(
        &self,
        resource_group: &str,
        name: &str,
    ) -> Result<Option<StorageAccount>>;

    /// Create a storage account
    async fn create_storage_account(
        &self,
        resource_group: &str,
        name: &str,
        region: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<StorageAccount>;

    /// Create a blob container unless it exists
    async fn ensure_container(&self, account: &str, container: &str) -> Result<()>;

    /// Size in bytes of the source image
    async fn image_size(&self, source_url: &str) -> Result<u64>;

    /// Read a byte range of the source image
    async fn read_image_range(&self, source_url: &str, offset: u64, length: u64)
        -> Result<Vec<u8>>;

    /// Create (or reset) a page blob of `size` bytes, returning its URL
    async fn create_page_blob(
        &self,
        account: &str,
        container: &str,
        blob: &str,
        size: u64,
    ) -> Result<String>;

    /// Write one page of a page blob
    async fn upload_page(&self, blob_url: &str, offset: u64, data: &[u8]) -> Result<()>;

    /// Check if an image gallery exists
    async fn gallery_exists(&self, resource_group: &str, name: &str) -> Result<bool>;

    /// Create an image gallery
    async fn create_gallery(
        &self,
        resource_group: &str,
        name: &str,
        region: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Create or update a gallery image definition
    async fn create_gallery_image(&self, resource_group: &str, image: &GalleryImage) -> Result<()>;

    /// Create or update a gallery image version
    async fn create_gallery_image_version(
        &self,
        resource_group: &str,
        version: &GalleryImageVersion,
    ) -> Result<()>;

    /// Principal id of a user-assigned identity
    async fn get_identity_principal(&self, resource_group: &str, identity: &str)
        -> Result<String>;

    /// Assign a role to a principal on a resource group
    async fn create_role_assignment(
        &self,
        resource_group: &str,
        principal_id: &str,
        role: &str,
    ) -> Result<()>;

    /// Public IP address by resource name
    async fn get_public_ip(&self, resource_group: &str, name: &str) -> Result<PublicIp>;

    /// Create or update a record set
    async fn create_record_set(&self, zone: &DnsZone, record: &RecordSet) -> Result<()>;
}

/// A new identity's principal is not yet visible to the authorization
/// service; Azure reports this as a 400 until replication catches up.
fn is_principal_not_found(e: &Error) -> bool {
    matches!(e.root(), Error::Cloud { message, .. } if message.contains("PrincipalNotFound"))
}

/// Images created by [`AzureProvider::create_images`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedImages {
    /// Gallery holding the images
    pub gallery: String,
    /// Gen1 image definition name
    pub gen1: String,
    /// Gen2 image definition name
    pub gen2: String,
    /// URL of the uploaded VHD
    pub blob_url: String,
}

/// Where gallery image versions are sourced from
struct ImageSource<'a> {
    resource_group: &'a str,
    region: &'a str,
    gallery: &'a str,
    storage_account: &'a str,
    blob_url: &'a str,
}

/// Storage account for the VHD: `cluster` + infra id without dashes, max 24
pub fn storage_account_name(infra_id: &str) -> String {
    let mut name = format!("cluster{}", infra_id.replace('-', ""));
    name.truncate(STORAGE_ACCOUNT_NAME_MAX);
    name
}

/// Gallery for the cluster images: `gallery_` + infra id with underscores
pub fn gallery_name(infra_id: &str) -> String {
    format!("gallery_{}", infra_id.replace('-', "_"))
}

fn cluster_tags(infra_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(
        format!("kubernetes.io_cluster.{}", infra_id),
        strata_common::OWNED_TAG_VALUE.to_string(),
    )])
}

fn azure_platform(config: &InstallConfig) -> Result<&AzurePlatform> {
    config
        .platform
        .azure
        .as_ref()
        .ok_or_else(|| Error::validation_for_field("platform.azure", "azure platform not configured"))
}

/// Private IP of the first API LB frontend that has one
fn internal_lb_ip(azure_cluster: &Manifest) -> Option<String> {
    frontends(azure_cluster)
        .iter()
        .filter_map(|f| f.pointer("/privateIP").and_then(Value::as_str))
        .find(|ip| !ip.is_empty())
        .map(str::to_string)
}

/// Name of the public IP resource behind the API LB, if any
fn public_ip_name(azure_cluster: &Manifest) -> Option<String> {
    frontends(azure_cluster)
        .iter()
        .filter_map(|f| f.pointer("/publicIP/name").and_then(Value::as_str))
        .find(|name| !name.is_empty())
        .map(str::to_string)
}

fn frontends(azure_cluster: &Manifest) -> Vec<Value> {
    azure_cluster
        .spec_at("/networkSpec/apiServerLB/frontendIPs")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

/// Azure platform provider
///
/// Holds run-scoped state: the images created during pre-provision.
pub struct AzureProvider {
    api: Arc<dyn AzureApi>,
    upload: UploadOptions,
    role_retry: RetryConfig,
    images: Mutex<Option<CreatedImages>>,
}

impl AzureProvider {
    /// Create a provider over an Azure client
    pub fn new(api: Arc<dyn AzureApi>) -> Self {
        Self {
            api,
            upload: UploadOptions::default(),
            role_retry: RetryConfig::fixed(6, Duration::from_secs(10)),
            images: Mutex::new(None),
        }
    }

    /// Override page-upload tuning
    pub fn with_upload_options(mut self, upload: UploadOptions) -> Self {
        self.upload = upload;
        self
    }

    /// Override the role-assignment retry policy
    pub fn with_role_retry(mut self, retry: RetryConfig) -> Self {
        self.role_retry = retry;
        self
    }

    /// Images created by this run's pre-provision, if any
    pub fn created_images(&self) -> Option<CreatedImages> {
        self.images.lock().clone()
    }

    /// Grant the cluster identity its role, retrying through replication lag
    pub async fn assign_identity_role(
        &self,
        resource_group: &str,
        identity: &str,
    ) -> Result<()> {
        let principal = self
            .api
            .get_identity_principal(resource_group, identity)
            .await
            .with_context(|| format!("failed to get identity {}", identity))?;

        let api = self.api.as_ref();
        let principal = principal.as_str();
        retry_with_backoff_if(
            &self.role_retry,
            "create role assignment",
            |e: &Error| e.is_retryable() || is_principal_not_found(e),
            move || async move {
                match api
                    .create_role_assignment(resource_group, principal, IDENTITY_ROLE)
                    .await
                {
                    Err(e) if e.is_already_exists() => Ok(()),
                    other => other,
                }
            },
        )
        .await
        .with_context(|| format!("failed to assign {} role to identity {}", IDENTITY_ROLE, identity))?;
        info!(identity = %identity, role = IDENTITY_ROLE, "Assigned role to cluster identity");
        Ok(())
    }

    /// Upload the RHCOS VHD and publish it as gen1/gen2 gallery images
    pub async fn create_images(
        &self,
        cluster_id: &ClusterId,
        resource_group: &str,
        region: &str,
        image_url: &str,
    ) -> Result<CreatedImages> {
        let infra_id = &cluster_id.infra_id;
        let tags = cluster_tags(infra_id);

        let account_name = storage_account_name(infra_id);
        let account = match self
            .api
            .get_storage_account(resource_group, &account_name)
            .await
            .with_context(|| format!("failed to get storage account {}", account_name))?
        {
            Some(account) => {
                debug!(account = %account.name, "Storage account already exists");
                account
            }
            None => {
                let account = self
                    .api
                    .create_storage_account(resource_group, &account_name, region, &tags)
                    .await
                    .with_context(|| format!("failed to create storage account {}", account_name))?;
                info!(account = %account.name, "Created storage account");
                account
            }
        };

        self.api
            .ensure_container(&account.name, IMAGE_CONTAINER)
            .await
            .with_context(|| format!("failed to create blob container {}", IMAGE_CONTAINER))?;

        let size = self
            .api
            .image_size(image_url)
            .await
            .with_context(|| format!("failed to get size of image {}", image_url))?;
        let blob_name = format!("rhcos-{}.vhd", infra_id);
        let blob_url = self
            .api
            .create_page_blob(&account.name, IMAGE_CONTAINER, &blob_name, size)
            .await
            .with_context(|| format!("failed to create page blob {}", blob_name))?;
        upload_page_blob(self.api.as_ref(), image_url, &blob_url, size, &self.upload)
            .await
            .context("failed to upload image")?;

        let gallery = gallery_name(infra_id);
        if !self
            .api
            .gallery_exists(resource_group, &gallery)
            .await
            .with_context(|| format!("failed to get gallery {}", gallery))?
        {
            self.api
                .create_gallery(resource_group, &gallery, region, &tags)
                .await
                .with_context(|| format!("failed to create gallery {}", gallery))?;
            info!(gallery = %gallery, "Created image gallery");
        }

        let gen1 = infra_id.to_string();
        let gen2 = format!("{}-gen2", infra_id);
        let source = ImageSource {
            resource_group,
            region,
            gallery: &gallery,
            storage_account: &account.name,
            blob_url: &blob_url,
        };
        futures::future::try_join(
            self.create_gallery_image(&source, &gen1, HyperVGeneration::V1),
            self.create_gallery_image(&source, &gen2, HyperVGeneration::V2),
        )
        .await?;

        let images = CreatedImages {
            gallery,
            gen1,
            gen2,
            blob_url,
        };
        *self.images.lock() = Some(images.clone());
        Ok(images)
    }

    async fn create_gallery_image(
        &self,
        source: &ImageSource<'_>,
        name: &str,
        generation: HyperVGeneration,
    ) -> Result<()> {
        let sku = match generation {
            HyperVGeneration::V1 => "rhcos",
            HyperVGeneration::V2 => "rhcos-gen2",
        };
        self.api
            .create_gallery_image(
                source.resource_group,
                &GalleryImage {
                    gallery: source.gallery.to_string(),
                    name: name.to_string(),
                    generation,
                    sku: sku.to_string(),
                    region: source.region.to_string(),
                },
            )
            .await
            .with_context(|| format!("failed to create gallery image {}", name))?;
        self.api
            .create_gallery_image_version(
                source.resource_group,
                &GalleryImageVersion {
                    gallery: source.gallery.to_string(),
                    image: name.to_string(),
                    version: IMAGE_VERSION.to_string(),
                    source_blob_url: source.blob_url.to_string(),
                    storage_account: source.storage_account.to_string(),
                    target_regions: vec![source.region.to_string()],
                },
            )
            .await
            .with_context(|| {
                format!("failed to create gallery image version {}/{}", name, IMAGE_VERSION)
            })?;
        info!(image = %name, generation = ?generation, "Created gallery image");
        Ok(())
    }

    async fn azure_cluster(
        &self,
        client: &dyn ManifestStore,
        cluster: &Manifest,
        infra_id: &str,
    ) -> Result<Manifest> {
        infra_cluster(client, cluster, AZURE_API_VERSION, "AzureCluster", infra_id).await
    }

    async fn public_ip(
        &self,
        azure_cluster: &Manifest,
        resource_group: &str,
    ) -> Result<Option<PublicIp>> {
        let Some(name) = public_ip_name(azure_cluster) else {
            return Ok(None);
        };
        let ip = self
            .api
            .get_public_ip(resource_group, &name)
            .await
            .with_context(|| format!("failed to get public ip {}", name))?;
        Ok(Some(ip))
    }
}

#[async_trait]
impl PreProvider for AzureProvider {
    async fn pre_provision(&self, input: &PreProvisionInput<'_>) -> Result<()> {
        let azure = azure_platform(input.install_config)?;
        let resource_group = azure.cluster_resource_group(&input.cluster_id.infra_id);

        if let Some(identity) = azure.user_assigned_identity.as_deref() {
            self.assign_identity_role(&resource_group, identity).await?;
        }

        match azure.image_url.as_deref() {
            Some(url) => {
                self.create_images(input.cluster_id, &resource_group, &azure.region, url)
                    .await
                    .context("failed to create cluster images")?;
            }
            None => debug!("No image URL configured, skipping image upload"),
        }
        Ok(())
    }
}

#[async_trait]
impl InfraReadyProvider for AzureProvider {
    async fn infra_ready(&self, input: &InfraReadyInput<'_>) -> Result<()> {
        let config = input.install_config;
        let azure = azure_platform(config)?;
        if azure.user_provisioned_dns.is_enabled() {
            info!("User-provisioned DNS enabled, skipping Azure DNS records");
            return Ok(());
        }

        let resource_group = azure.cluster_resource_group(&input.cluster_id.infra_id);
        let azure_cluster = self
            .azure_cluster(input.client, input.cluster, &input.cluster_id.infra_id)
            .await?;
        let private_ip = internal_lb_ip(&azure_cluster).ok_or_else(|| {
            Error::provider_permanent("azure", "failed to get internal load balancer IP")
        })?;

        let domain = config.cluster_domain();
        if config.is_external() {
            let public = self
                .public_ip(&azure_cluster, &resource_group)
                .await?
                .filter(|ip| !ip.fqdn.is_empty())
                .ok_or_else(|| {
                    Error::provider_permanent("azure", "failed to get public load balancer FQDN")
                })?;
            let zone = DnsZone {
                resource_group: azure.base_domain_resource_group_name.clone(),
                name: config.base_domain.clone(),
                private: false,
            };
            let record = RecordSet {
                name: format!("api.{}", config.metadata.name),
                record_type: RecordType::Cname,
                values: vec![public.fqdn],
                ttl: RECORD_TTL,
            };
            self.api
                .create_record_set(&zone, &record)
                .await
                .with_context(|| format!("failed to create public record {}", record.name))?;
            info!(record = %record.name, zone = %zone.name, "Created public API record");
        }

        let zone = DnsZone {
            resource_group,
            name: domain,
            private: true,
        };
        for name in ["api", "api-int"] {
            let record = RecordSet {
                name: name.to_string(),
                record_type: RecordType::A,
                values: vec![private_ip.clone()],
                ttl: RECORD_TTL,
            };
            self.api
                .create_record_set(&zone, &record)
                .await
                .with_context(|| format!("failed to create private record {}", name))?;
        }
        info!(zone = %zone.name, ip = %private_ip, "Created private API records");
        Ok(())
    }
}

#[async_trait]
impl IgnitionProvider for AzureProvider {
    async fn ignition(&self, input: &IgnitionInput<'_>) -> Result<IgnitionOutput> {
        let config = input.install_config;
        let azure = azure_platform(config)?;
        if !azure.user_provisioned_dns.is_enabled() {
            return Ok(input.unchanged());
        }

        let infra_id = &input.cluster_id.infra_id;
        let cluster = input
            .client
            .get(&ObjectKey::cluster(strata_common::CAPI_NAMESPACE, infra_id))
            .await
            .context("failed to get cluster")?;
        let azure_cluster = self.azure_cluster(input.client, &cluster, infra_id).await?;

        let private_ip = internal_lb_ip(&azure_cluster).ok_or_else(|| {
            Error::provider_permanent("azure", "failed to get internal load balancer IP")
        })?;
        let mut public_ips = Vec::new();
        if config.is_external() {
            let resource_group = azure.cluster_resource_group(infra_id);
            match self.public_ip(&azure_cluster, &resource_group).await? {
                Some(ip) if !ip.address.is_empty() => public_ips.push(ip.address),
                _ => warn!("No public IP on the API load balancer, continuing with private IPs"),
            }
        }

        let domain = config.cluster_domain();
        edit_ignition(
            &EditIgnitionInput {
                bootstrap: input.bootstrap_ignition,
                master: input.master_ignition,
                cluster_domain: &domain,
                asset_dir: input.asset_dir,
                cert_reissuer: input.cert_reissuer,
            },
            PlatformKind::Azure,
            &public_ips,
            &[private_ip],
        )
        .context("failed to edit bootstrap ignition")
    }
}

impl Provider for AzureProvider {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn as_pre_provider(&self) -> Option<&dyn PreProvider> {
        Some(self)
    }

    fn as_infra_ready_provider(&self) -> Option<&dyn InfraReadyProvider> {
        Some(self)
    }

    fn as_ignition_provider(&self) -> Option<&dyn IgnitionProvider> {
        Some(self)
    }

    fn state(&self) -> ProviderState {
        ProviderState {
            images: self.created_images(),
            ..Default::default()
        }
    }
}
