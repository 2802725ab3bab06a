//! AWS provider hooks
//!
//! - infra-ready: Route53 alias records for `api` (public zone, External
//!   only) and `api-int` (private zone) pointing at the control-plane LB
//! - ignition: when the cluster hosts its own DNS, patch the API LB's
//!   network-interface addresses into the bootstrap Ignition
//!
//! [`put_iam_roles`] and [`copy_ami_to_region`] create the IAM roles and
//! regional AMI an install may need. They are standalone helpers and are
//! not called from any hook.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use strata_common::{
    cluster_owned_tag, ClusterId, Error, PlatformKind, Result, ResultExt, OWNED_TAG_VALUE,
};
use strata_ignition::{edit_ignition, EditIgnitionInput, IgnitionOutput};

use super::{
    infra_cluster, IgnitionInput, IgnitionProvider, InfraReadyInput, InfraReadyProvider,
    PreProvider, PreProvisionInput, Provider,
};
use crate::constants::AWS_API_VERSION;

/// Security-group role of the API server load balancer
pub const APISERVER_LB_SECURITY_GROUP: &str = "apiserver-lb";

/// IAM roles created per install
pub const IAM_ROLES: &[&str] = &["master", "worker"];

const EC2_ASSUME_ROLE_POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

/// A Route53 alias record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AliasRecord {
    /// Fully qualified record name
    pub name: String,
    /// DNS name of the alias target (the load balancer)
    pub target_dns_name: String,
    /// Canonical hosted zone of the alias target
    pub target_zone_id: String,
}

/// Addresses of one elastic network interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Private IPv4 address
    pub private_ip: String,
    /// Associated public IPv4 address, if any
    pub public_ip: Option<String>,
}

/// Request to copy an AMI between regions
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyImageRequest {
    /// Source AMI id
    pub source_image_id: String,
    /// Source region
    pub source_region: String,
    /// Destination region
    pub target_region: String,
    /// Name of the copy
    pub name: String,
    /// Tags applied to the copy
    pub tags: BTreeMap<String, String>,
}

/// The AWS APIs the hooks use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AwsApi: Send + Sync {
    /// Id of the hosted zone for `domain`, public or private
    async fn find_hosted_zone(&self, domain: &str, private: bool) -> Result<Option<String>>;

    /// Canonical hosted zone id of a load balancer by DNS name
    async fn load_balancer_zone_id(&self, dns_name: &str) -> Result<String>;

    /// Create or update an alias A record
    async fn upsert_alias_record(&self, zone_id: &str, record: &AliasRecord) -> Result<()>;

    /// Addresses of every network interface in a security group
    async fn interfaces_in_security_group(&self, group_id: &str) -> Result<Vec<InterfaceAddress>>;

    /// ARN of an IAM role, None if it does not exist
    async fn get_role(&self, name: &str) -> Result<Option<String>>;

    /// Create an IAM role, returning its ARN
    async fn create_role(
        &self,
        name: &str,
        assume_role_policy: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Role names attached to an instance profile, None if it does not exist
    async fn get_instance_profile(&self, name: &str) -> Result<Option<Vec<String>>>;

    /// Create an instance profile
    async fn create_instance_profile(
        &self,
        name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Attach a role to an instance profile
    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<()>;

    /// An AMI in `region` carrying tag `key=value`
    async fn find_tagged_image(&self, region: &str, key: &str, value: &str)
        -> Result<Option<String>>;

    /// Copy an AMI, returning the new image id
    async fn copy_image(&self, request: &CopyImageRequest) -> Result<String>;
}

/// AWS platform provider
pub struct AwsProvider {
    api: Arc<dyn AwsApi>,
}

impl AwsProvider {
    /// Create a provider over an AWS client
    pub fn new(api: Arc<dyn AwsApi>) -> Self {
        Self { api }
    }

    async fn private_zone(&self, input: &InfraReadyInput<'_>, domain: &str) -> Result<String> {
        let configured = input
            .install_config
            .platform
            .aws
            .as_ref()
            .and_then(|aws| aws.hosted_zone.clone())
            .filter(|z| !z.is_empty());
        if let Some(zone) = configured {
            return Ok(zone);
        }
        self.api
            .find_hosted_zone(domain, true)
            .await
            .context("failed to find private hosted zone")?
            .ok_or_else(|| Error::not_found("private hosted zone", domain))
    }
}

fn owned_tags(infra_id: &str, name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (cluster_owned_tag(infra_id), OWNED_TAG_VALUE.to_string()),
        ("Name".to_string(), name.to_string()),
    ])
}

#[async_trait]
impl PreProvider for AwsProvider {
    async fn pre_provision(&self, input: &PreProvisionInput<'_>) -> Result<()> {
        debug!(infra_id = %input.cluster_id.infra_id, "No AWS pre-provisioning required");
        Ok(())
    }
}

#[async_trait]
impl InfraReadyProvider for AwsProvider {
    async fn infra_ready(&self, input: &InfraReadyInput<'_>) -> Result<()> {
        let config = input.install_config;
        if config.platform.user_provisioned_dns().is_enabled() {
            info!("User-provisioned DNS enabled, skipping Route53 records");
            return Ok(());
        }

        let aws_cluster = infra_cluster(
            input.client,
            input.cluster,
            AWS_API_VERSION,
            "AWSCluster",
            &input.cluster_id.infra_id,
        )
        .await?;
        let lb_dns = aws_cluster
            .status_str("/network/apiServerElb/dnsName")
            .or_else(|| aws_cluster.spec_str("/controlPlaneEndpoint/host"))
            .ok_or_else(|| {
                Error::provider_permanent("aws", "control plane load balancer has no DNS name")
            })?
            .to_string();
        let lb_zone = self
            .api
            .load_balancer_zone_id(&lb_dns)
            .await
            .with_context(|| format!("failed to get hosted zone of load balancer {}", lb_dns))?;

        let domain = config.cluster_domain();
        let private_zone = self.private_zone(input, &domain).await?;
        let api_int = AliasRecord {
            name: format!("api-int.{}", domain),
            target_dns_name: lb_dns.clone(),
            target_zone_id: lb_zone.clone(),
        };
        self.api
            .upsert_alias_record(&private_zone, &api_int)
            .await
            .with_context(|| format!("failed to create {} record", api_int.name))?;
        info!(record = %api_int.name, zone = %private_zone, "Upserted private API record");

        if config.is_external() {
            let public_zone = self
                .api
                .find_hosted_zone(&config.base_domain, false)
                .await
                .context("failed to find public hosted zone")?
                .ok_or_else(|| Error::not_found("public hosted zone", &config.base_domain))?;
            let api = AliasRecord {
                name: format!("api.{}", domain),
                target_dns_name: lb_dns,
                target_zone_id: lb_zone,
            };
            self.api
                .upsert_alias_record(&public_zone, &api)
                .await
                .with_context(|| format!("failed to create {} record", api.name))?;
            info!(record = %api.name, zone = %public_zone, "Upserted public API record");
        }
        Ok(())
    }
}

#[async_trait]
impl IgnitionProvider for AwsProvider {
    async fn ignition(&self, input: &IgnitionInput<'_>) -> Result<IgnitionOutput> {
        let config = input.install_config;
        if !config.platform.user_provisioned_dns().is_enabled() {
            return Ok(input.unchanged());
        }

        let cluster = input
            .client
            .get(&crate::manifest::ObjectKey::cluster(
                strata_common::CAPI_NAMESPACE,
                &input.cluster_id.infra_id,
            ))
            .await
            .context("failed to get cluster")?;
        let aws_cluster = infra_cluster(
            input.client,
            &cluster,
            AWS_API_VERSION,
            "AWSCluster",
            &input.cluster_id.infra_id,
        )
        .await?;
        let group_id = aws_cluster
            .status_str(&format!(
                "/networkStatus/securityGroups/{}/id",
                APISERVER_LB_SECURITY_GROUP
            ))
            .ok_or_else(|| {
                Error::provider_permanent("aws", "API load balancer security group not found")
            })?
            .to_string();

        let interfaces = self
            .api
            .interfaces_in_security_group(&group_id)
            .await
            .with_context(|| format!("failed to list network interfaces in {}", group_id))?;
        let private_ips: Vec<String> = interfaces.iter().map(|i| i.private_ip.clone()).collect();
        if private_ips.is_empty() {
            return Err(Error::provider_permanent(
                "aws",
                format!("no network interfaces found in security group {}", group_id),
            ));
        }
        let public_ips: Vec<String> = if config.is_external() {
            interfaces.iter().filter_map(|i| i.public_ip.clone()).collect()
        } else {
            Vec::new()
        };

        let domain = config.cluster_domain();
        edit_ignition(
            &EditIgnitionInput {
                bootstrap: input.bootstrap_ignition,
                master: input.master_ignition,
                cluster_domain: &domain,
                asset_dir: input.asset_dir,
                cert_reissuer: input.cert_reissuer,
            },
            PlatformKind::Aws,
            &public_ips,
            &private_ips,
        )
        .context("failed to edit bootstrap ignition")
    }
}

impl Provider for AwsProvider {
    fn name(&self) -> &'static str {
        "aws"
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
}

/// Ensure the per-role IAM role and instance profile exist
///
/// Existing roles and profiles are reused, so re-running is safe.
pub async fn put_iam_roles(api: &dyn AwsApi, cluster_id: &ClusterId) -> Result<()> {
    for role in IAM_ROLES {
        let role_name = format!("{}-{}-role", cluster_id.infra_id, role);
        let profile_name = format!("{}-{}-profile", cluster_id.infra_id, role);

        match api.get_role(&role_name).await.context("failed to get role")? {
            Some(arn) => debug!(role = %role_name, arn = %arn, "IAM role already exists"),
            None => {
                let arn = api
                    .create_role(
                        &role_name,
                        EC2_ASSUME_ROLE_POLICY,
                        &owned_tags(&cluster_id.infra_id, &role_name),
                    )
                    .await
                    .with_context(|| format!("failed to create role {}", role_name))?;
                info!(role = %role_name, arn = %arn, "Created IAM role");
            }
        }

        let attached = match api
            .get_instance_profile(&profile_name)
            .await
            .context("failed to get instance profile")?
        {
            Some(roles) => roles,
            None => {
                api.create_instance_profile(
                    &profile_name,
                    &owned_tags(&cluster_id.infra_id, &profile_name),
                )
                .await
                .with_context(|| format!("failed to create instance profile {}", profile_name))?;
                info!(profile = %profile_name, "Created instance profile");
                Vec::new()
            }
        };
        if !attached.contains(&role_name) {
            api.add_role_to_instance_profile(&profile_name, &role_name)
                .await
                .with_context(|| {
                    format!("failed to add role {} to profile {}", role_name, profile_name)
                })?;
        }
    }
    Ok(())
}

/// Make an AMI available in `target_region`, reusing a cluster-owned copy
pub async fn copy_ami_to_region(
    api: &dyn AwsApi,
    infra_id: &str,
    source_image_id: &str,
    source_region: &str,
    target_region: &str,
) -> Result<String> {
    let tag = cluster_owned_tag(infra_id);
    if let Some(existing) = api
        .find_tagged_image(target_region, &tag, OWNED_TAG_VALUE)
        .await
        .context("failed to look up AMI")?
    {
        debug!(image = %existing, region = %target_region, "Reusing copied AMI");
        return Ok(existing);
    }

    let name = format!("{}-ami-{}", infra_id, target_region);
    let image = api
        .copy_image(&CopyImageRequest {
            source_image_id: source_image_id.to_string(),
            source_region: source_region.to_string(),
            target_region: target_region.to_string(),
            name: name.clone(),
            tags: owned_tags(infra_id, &name),
        })
        .await
        .with_context(|| format!("failed to copy AMI {} to {}", source_image_id, target_region))?;
    info!(image = %image, region = %target_region, "Copied AMI");
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ManifestStore, MemoryStore};
    use crate::manifest::Manifest;
    use crate::provider::test_support::{
        capi_cluster, cluster_id, install_config, NoCerts, INFRA_ID,
    };
    use mockall::predicate::eq;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use strata_common::CAPI_NAMESPACE;

    async fn store_with_aws_cluster() -> MemoryStore {
        let store = MemoryStore::new();
        store.create(&capi_cluster()).await.unwrap();
        store
            .create(
                &Manifest::new(AWS_API_VERSION, "AWSCluster", INFRA_ID, CAPI_NAMESPACE)
                    .with_status(json!({
                        "network": {"apiServerElb": {"dnsName": "demo-int-123.elb.amazonaws.com"}},
                        "networkStatus": {"securityGroups": {"apiserver-lb": {"id": "sg-0abc"}}}
                    })),
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn infra_ready_upserts_private_and_public_records() {
        let store = store_with_aws_cluster().await;
        let config = install_config("  aws:\n    region: us-east-1\n");

        let mut api = MockAwsApi::new();
        api.expect_load_balancer_zone_id()
            .with(eq("demo-int-123.elb.amazonaws.com"))
            .returning(|_| Ok("Z35SXDOTRQ7X7K".to_string()));
        api.expect_find_hosted_zone()
            .with(eq("demo.example.com"), eq(true))
            .returning(|_, _| Ok(Some("ZPRIVATE".to_string())));
        api.expect_find_hosted_zone()
            .with(eq("example.com"), eq(false))
            .returning(|_, _| Ok(Some("ZPUBLIC".to_string())));
        api.expect_upsert_alias_record()
            .withf(|zone, r| zone == "ZPRIVATE" && r.name == "api-int.demo.example.com")
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_upsert_alias_record()
            .withf(|zone, r| {
                zone == "ZPUBLIC"
                    && r.name == "api.demo.example.com"
                    && r.target_zone_id == "Z35SXDOTRQ7X7K"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let provider = AwsProvider::new(Arc::new(api));
        let cluster = capi_cluster();
        provider
            .infra_ready(&InfraReadyInput {
                cluster: &cluster,
                install_config: &config,
                client: &store,
                cluster_id: &cluster_id(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn internal_clusters_skip_public_record_and_use_configured_zone() {
        let store = store_with_aws_cluster().await;
        let mut config = install_config("  aws:\n    region: us-east-1\n    hostedZone: ZUSER\n");
        config.publish = strata_common::Publish::Internal;

        let mut api = MockAwsApi::new();
        api.expect_load_balancer_zone_id()
            .returning(|_| Ok("Z35SXDOTRQ7X7K".to_string()));
        api.expect_find_hosted_zone().never();
        api.expect_upsert_alias_record()
            .withf(|zone, r| zone == "ZUSER" && r.name == "api-int.demo.example.com")
            .times(1)
            .returning(|_, _| Ok(()));

        let provider = AwsProvider::new(Arc::new(api));
        let cluster = capi_cluster();
        provider
            .infra_ready(&InfraReadyInput {
                cluster: &cluster,
                install_config: &config,
                client: &store,
                cluster_id: &cluster_id(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn user_provisioned_dns_skips_route53() {
        let store = MemoryStore::new();
        let config = install_config("  aws:\n    region: us-east-1\n    userProvisionedDNS: Enabled\n");

        let provider = AwsProvider::new(Arc::new(MockAwsApi::new()));
        let cluster = capi_cluster();
        provider
            .infra_ready(&InfraReadyInput {
                cluster: &cluster,
                install_config: &config,
                client: &store,
                cluster_id: &cluster_id(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ignition_is_untouched_without_user_provisioned_dns() {
        let store = MemoryStore::new();
        let config = install_config("  aws:\n    region: us-east-1\n");
        let dir = tempfile::tempdir().unwrap();

        // No expectations: any cloud call would panic
        let provider = AwsProvider::new(Arc::new(MockAwsApi::new()));
        let bootstrap = br#"{"ignition":{"version":"3.2.0"}}"#;
        let master = br#"{"ignition":{"version":"3.2.0"},"x":1}"#;
        let out = provider
            .ignition(&IgnitionInput {
                client: &store,
                bootstrap_ignition: bootstrap,
                master_ignition: master,
                install_config: &config,
                cluster_id: &cluster_id(),
                cert_reissuer: &NoCerts,
                asset_dir: dir.path(),
            })
            .await
            .unwrap();
        assert_eq!(out.bootstrap, bootstrap);
        assert_eq!(out.master, master);
    }

    #[tokio::test]
    async fn ignition_looks_up_interfaces_by_lb_security_group() {
        let store = store_with_aws_cluster().await;
        let config = install_config("  aws:\n    region: us-east-1\n    userProvisionedDNS: Enabled\n");
        let dir = tempfile::tempdir().unwrap();

        let mut api = MockAwsApi::new();
        api.expect_interfaces_in_security_group()
            .with(eq("sg-0abc"))
            .times(1)
            .returning(|_| {
                Ok(vec![InterfaceAddress {
                    private_ip: "10.0.0.5".to_string(),
                    public_ip: Some("3.3.3.3".to_string()),
                }])
            });

        let infra = "status:\n  platformStatus:\n    aws:\n      cloudLoadBalancerConfig:\n        dnsType: ClusterHosted\n";
        let bootstrap = serde_json::to_vec(&json!({
            "ignition": {"version": "3.2.0"},
            "storage": {"files": [serde_json::to_value(strata_ignition::File::inline(
                strata_ignition::edit::INFRASTRUCTURE_FILE_PATH,
                infra.as_bytes(),
                0o644,
            )).unwrap()]}
        }))
        .unwrap();
        let master = br#"{"ignition":{"version":"3.2.0"}}"#;

        let provider = AwsProvider::new(Arc::new(api));
        let out = provider
            .ignition(&IgnitionInput {
                client: &store,
                bootstrap_ignition: &bootstrap,
                master_ignition: master,
                install_config: &config,
                cluster_id: &cluster_id(),
                cert_reissuer: &NoCerts,
                asset_dir: dir.path(),
            })
            .await
            .unwrap();

        let edited = strata_ignition::IgnitionConfig::from_slice(&out.bootstrap).unwrap();
        let text = String::from_utf8(
            edited
                .file(strata_ignition::edit::INFRASTRUCTURE_FILE_PATH)
                .unwrap()
                .decoded_contents()
                .unwrap(),
        )
        .unwrap();
        assert!(text.contains("10.0.0.5"));
        assert!(text.contains("3.3.3.3"));
    }

    /// IAM setup can be re-run after a crash without duplicating anything
    #[tokio::test]
    async fn put_iam_roles_is_idempotent() {
        let roles: Arc<Mutex<HashSet<String>>> = Arc::default();
        let profiles: Arc<Mutex<HashMap<String, Vec<String>>>> = Arc::default();

        let mut api = MockAwsApi::new();
        let r = roles.clone();
        api.expect_get_role().returning(move |name| {
            Ok(r.lock().contains(name).then(|| format!("arn:aws:iam::1:role/{}", name)))
        });
        let r = roles.clone();
        api.expect_create_role().returning(move |name, _, tags| {
            assert_eq!(tags["kubernetes.io/cluster/demo-x7k2p"], "owned");
            assert!(r.lock().insert(name.to_string()), "role created twice");
            Ok(format!("arn:aws:iam::1:role/{}", name))
        });
        let p = profiles.clone();
        api.expect_get_instance_profile()
            .returning(move |name| Ok(p.lock().get(name).cloned()));
        let p = profiles.clone();
        api.expect_create_instance_profile().returning(move |name, _| {
            assert!(p.lock().insert(name.to_string(), Vec::new()).is_none());
            Ok(())
        });
        let p = profiles.clone();
        api.expect_add_role_to_instance_profile()
            .returning(move |profile, role| {
                p.lock().get_mut(profile).unwrap().push(role.to_string());
                Ok(())
            });

        put_iam_roles(&api, &cluster_id()).await.unwrap();
        put_iam_roles(&api, &cluster_id()).await.unwrap();

        assert_eq!(roles.lock().len(), 2);
        let profiles = profiles.lock();
        assert_eq!(profiles.len(), 2);
        assert_eq!(
            profiles["demo-x7k2p-master-profile"],
            vec!["demo-x7k2p-master-role".to_string()]
        );
    }

    #[tokio::test]
    async fn copy_ami_reuses_tagged_copy() {
        let mut api = MockAwsApi::new();
        api.expect_find_tagged_image()
            .with(eq("us-west-2"), eq("kubernetes.io/cluster/demo-x7k2p"), eq("owned"))
            .returning(|_, _, _| Ok(Some("ami-existing".to_string())));
        api.expect_copy_image().never();

        let image = copy_ami_to_region(&api, INFRA_ID, "ami-src", "us-east-1", "us-west-2")
            .await
            .unwrap();
        assert_eq!(image, "ami-existing");
    }

    #[tokio::test]
    async fn copy_ami_copies_when_missing() {
        let mut api = MockAwsApi::new();
        api.expect_find_tagged_image().returning(|_, _, _| Ok(None));
        api.expect_copy_image()
            .withf(|req| {
                req.source_image_id == "ami-src"
                    && req.target_region == "us-west-2"
                    && req.name == "demo-x7k2p-ami-us-west-2"
            })
            .times(1)
            .returning(|_| Ok("ami-new".to_string()));

        let image = copy_ami_to_region(&api, INFRA_ID, "ami-src", "us-east-1", "us-west-2")
            .await
            .unwrap();
        assert_eq!(image, "ami-new");
    }

    #[tokio::test]
    async fn copy_failure_names_the_image() {
        let mut api = MockAwsApi::new();
        api.expect_find_tagged_image().returning(|_, _, _| Ok(None));
        api.expect_copy_image()
            .returning(|_| Err(Error::cloud("copy", "image ami-src", "InvalidAMIID.NotFound")));

        let err = copy_ami_to_region(&api, INFRA_ID, "ami-src", "us-east-1", "us-west-2")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("failed to copy AMI ami-src to us-west-2"));
    }
}
