//! GCP provider hooks
//!
//! Pre-provision validates the worker layout and checks whether the installer
//! may create firewall rules in the network project. Infra-ready creates the
//! firewall rules (one at a time, waiting on each operation) and the
//! private DNS zone with the `api`/`api-int` records.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use strata_common::install_config::GcpPlatform;
use strata_common::retry::{poll_until, Backoff};
use strata_common::{ClusterId, Error, InstallConfig, PlatformKind, Result, ResultExt};
use strata_ignition::{edit_ignition, EditIgnitionInput, IgnitionOutput};

use super::{
    IgnitionInput, IgnitionProvider, InfraReadyInput, InfraReadyProvider, PreProvider,
    PreProvisionInput, Provider, ProviderState,
};

/// Permission needed to create firewall rules in the network project
pub const FIREWALL_CREATE_PERMISSION: &str = "compute.firewalls.create";

/// Google load-balancer health-check source ranges
pub const HEALTH_CHECK_RANGES: &[&str] = &["35.191.0.0/16", "130.211.0.0/22"];

/// Additional health-check ranges of network load balancers, used for external clusters
pub const NETWORK_LB_HEALTH_CHECK_RANGES: &[&str] = &["209.85.152.0/22", "209.85.204.0/22"];

/// TTL of created DNS records, in seconds
pub const RECORD_TTL: u32 = 60;

/// Protocol and ports a firewall rule allows
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallAllow {
    /// IP protocol (`tcp`, `udp`, `icmp`, `esp`)
    pub protocol: String,
    /// Ports or port ranges; empty allows all
    pub ports: Vec<String>,
}

impl FirewallAllow {
    fn new(protocol: &str, ports: &[&str]) -> Self {
        Self {
            protocol: protocol.to_string(),
            ports: ports.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// An ingress firewall rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    /// Rule name
    pub name: String,
    /// Network URL the rule applies to
    pub network: String,
    /// What the rule allows
    pub allowed: Vec<FirewallAllow>,
    /// Source CIDRs
    pub source_ranges: Vec<String>,
    /// Source instance tags
    pub source_tags: Vec<String>,
    /// Target instance tags
    pub target_tags: Vec<String>,
}

/// State of a long-running compute operation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OperationStatus {
    /// Still running
    Running,
    /// Finished successfully
    Done,
    /// Finished with an error
    Failed(String),
}

/// A Cloud DNS managed zone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManagedZone {
    /// Zone resource name
    pub name: String,
    /// DNS name with trailing dot
    pub dns_name: String,
    /// Network URLs a private zone is visible to; empty for public zones
    pub networks: Vec<String>,
}

/// A DNS A record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DnsRecord {
    /// Fully qualified name with trailing dot
    pub name: String,
    /// Addresses
    pub addresses: Vec<String>,
    /// TTL in seconds
    pub ttl: u32,
}

/// The GCP APIs the hooks use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GcpApi: Send + Sync {
    /// Subset of `permissions` the caller holds on `project`
    async fn test_iam_permissions(&self, project: &str, permissions: &[String])
        -> Result<Vec<String>>;

    /// Start creating a firewall rule, returning the operation name
    async fn insert_firewall(&self, project: &str, rule: &FirewallRule) -> Result<String>;

    /// Status of a global compute operation
    async fn get_operation(&self, project: &str, operation: &str) -> Result<OperationStatus>;

    /// Managed zone by name, None if absent
    async fn get_managed_zone(&self, project: &str, name: &str) -> Result<Option<ManagedZone>>;

    /// Create a managed zone
    async fn create_managed_zone(&self, project: &str, zone: &ManagedZone) -> Result<()>;

    /// Public managed zone serving `dns_name`, None if absent
    async fn find_public_zone(&self, project: &str, dns_name: &str) -> Result<Option<String>>;

    /// Create or replace an A record set
    async fn create_record_set(&self, project: &str, zone: &str, record: &DnsRecord) -> Result<()>;

    /// IP of a compute address; regional when `region` is set, else global
    async fn get_address(&self, project: &str, region: Option<String>, name: &str)
        -> Result<String>;
}

fn gcp_platform(config: &InstallConfig) -> Result<&GcpPlatform> {
    config
        .platform
        .gcp
        .as_ref()
        .ok_or_else(|| Error::validation_for_field("platform.gcp", "gcp platform not configured"))
}

/// Network tag of control-plane instances
pub fn control_plane_tag(infra_id: &str) -> String {
    format!("{}-control-plane", infra_id)
}

/// Network tag of worker instances
pub fn worker_tag(infra_id: &str) -> String {
    format!("{}-worker", infra_id)
}

/// Name of the private DNS zone
pub fn private_zone_name(infra_id: &str) -> String {
    format!("{}-private-zone", infra_id)
}

/// Regional address of the internal API load balancer
pub fn internal_address_name(infra_id: &str) -> String {
    format!("{}-api-internal", infra_id)
}

/// Global address of the external API load balancer
pub fn external_address_name(infra_id: &str) -> String {
    format!("{}-apiserver", infra_id)
}

fn network_url(gcp: &GcpPlatform, infra_id: &str) -> String {
    format!(
        "projects/{}/global/networks/{}",
        gcp.network_project(),
        gcp.network_name(infra_id)
    )
}

/// The five firewall rules of a cluster, in creation order
pub fn firewall_rules(config: &InstallConfig, cluster_id: &ClusterId) -> Result<Vec<FirewallRule>> {
    let gcp = gcp_platform(config)?;
    let infra_id = &cluster_id.infra_id;
    let network = network_url(gcp, infra_id);
    let control_plane = control_plane_tag(infra_id);
    let worker = worker_tag(infra_id);
    let machine_cidrs = config.machine_cidrs();

    let rule = |suffix: &str,
                allowed: Vec<FirewallAllow>,
                source_ranges: Vec<String>,
                source_tags: Vec<String>,
                target_tags: Vec<String>| FirewallRule {
        name: format!("{}-{}", infra_id, suffix),
        network: network.clone(),
        allowed,
        source_ranges,
        source_tags,
        target_tags,
    };

    let api_sources = if config.is_external() {
        vec!["0.0.0.0/0".to_string()]
    } else {
        machine_cidrs.clone()
    };
    let mut health_sources: Vec<String> =
        HEALTH_CHECK_RANGES.iter().map(|r| r.to_string()).collect();
    if config.is_external() {
        health_sources.extend(NETWORK_LB_HEALTH_CHECK_RANGES.iter().map(|r| r.to_string()));
    }
    let both = vec![control_plane.clone(), worker.clone()];

    Ok(vec![
        rule(
            "control-plane",
            vec![FirewallAllow::new(
                "tcp",
                &["2379-2380", "10257", "10259", "22623"],
            )],
            vec![],
            both.clone(),
            vec![control_plane.clone()],
        ),
        rule(
            "internal-cluster",
            vec![
                FirewallAllow::new("tcp", &["9000-9999", "10250", "30000-32767"]),
                FirewallAllow::new("udp", &["500", "4500", "4789", "6081", "9000-9999", "30000-32767"]),
                FirewallAllow::new("esp", &[]),
            ],
            vec![],
            both.clone(),
            both.clone(),
        ),
        rule(
            "api",
            vec![FirewallAllow::new("tcp", &["6443"])],
            api_sources,
            vec![],
            vec![control_plane.clone()],
        ),
        rule(
            "internal-network",
            vec![
                FirewallAllow::new("icmp", &[]),
                FirewallAllow::new("tcp", &["22"]),
            ],
            machine_cidrs,
            vec![],
            both,
        ),
        rule(
            "health-checks",
            vec![FirewallAllow::new("tcp", &["6080", "6443", "22624"])],
            health_sources,
            vec![],
            vec![control_plane],
        ),
    ])
}

/// GCP platform provider
pub struct GcpProvider {
    api: Arc<dyn GcpApi>,
    operation_wait: Backoff,
    create_firewall_rules: AtomicBool,
}

impl GcpProvider {
    /// Create a provider over a GCP client
    pub fn new(api: Arc<dyn GcpApi>) -> Self {
        Self {
            api,
            operation_wait: Backoff {
                initial: std::time::Duration::from_secs(2),
                factor: 1.5,
                steps: 20,
                cap: std::time::Duration::from_secs(30),
            },
            create_firewall_rules: AtomicBool::new(true),
        }
    }

    /// Override how long compute operations are polled
    pub fn with_operation_wait(mut self, wait: Backoff) -> Self {
        self.operation_wait = wait;
        self
    }

    /// Whether infra-ready will create firewall rules
    ///
    /// Cleared by pre-provision when the installer lacks permission in the
    /// network project.
    pub fn create_firewall_rules(&self) -> bool {
        self.create_firewall_rules.load(Ordering::SeqCst)
    }

    async fn check_firewall_permission(&self, gcp: &GcpPlatform) -> Result<bool> {
        let Some(project) = gcp.network_project_id.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(true);
        };
        let granted = self
            .api
            .test_iam_permissions(project, &[FIREWALL_CREATE_PERMISSION.to_string()])
            .await
            .with_context(|| format!("failed to test permissions on project {}", project))?;
        if granted.iter().any(|p| p == FIREWALL_CREATE_PERMISSION) {
            return Ok(true);
        }
        warn!(
            project = %project,
            "failed to find permission {}, skipping firewall rule creation",
            FIREWALL_CREATE_PERMISSION
        );
        Ok(false)
    }

    async fn wait_for_operation(&self, project: &str, operation: &str) -> Result<()> {
        poll_until(&self.operation_wait, operation, move || async move {
            match self.api.get_operation(project, operation).await? {
                OperationStatus::Running => Ok(None),
                OperationStatus::Done => Ok(Some(())),
                OperationStatus::Failed(message) => {
                    Err(Error::cloud("complete", format!("operation {}", operation), message))
                }
            }
        })
        .await
    }

    /// Create the cluster's firewall rules one at a time
    ///
    /// Rules that already exist are left as they are.
    pub async fn create_firewall_rules_for(
        &self,
        config: &InstallConfig,
        cluster_id: &ClusterId,
    ) -> Result<()> {
        let gcp = gcp_platform(config)?;
        let project = gcp.network_project();
        for rule in firewall_rules(config, cluster_id)? {
            let operation = match self.api.insert_firewall(project, &rule).await {
                Ok(operation) => operation,
                Err(e) if e.is_already_exists() => {
                    debug!(rule = %rule.name, "Firewall rule already exists");
                    continue;
                }
                Err(e) => {
                    return Err(e.context(format!("failed to create firewall rule {}", rule.name)))
                }
            };
            self.wait_for_operation(project, &operation)
                .await
                .with_context(|| format!("failed to create firewall rule {}", rule.name))?;
            info!(rule = %rule.name, "Created firewall rule");
        }
        Ok(())
    }

    async fn create_dns_records(&self, config: &InstallConfig, cluster_id: &ClusterId) -> Result<()> {
        let gcp = gcp_platform(config)?;
        let infra_id = &cluster_id.infra_id;
        let domain = format!("{}.", config.cluster_domain());

        let zone_name = private_zone_name(infra_id);
        let zone = match self
            .api
            .get_managed_zone(&gcp.project_id, &zone_name)
            .await
            .with_context(|| format!("failed to get managed zone {}", zone_name))?
        {
            Some(zone) => {
                debug!(zone = %zone.name, "Private zone already exists");
                zone
            }
            None => {
                let zone = ManagedZone {
                    name: zone_name.clone(),
                    dns_name: domain.clone(),
                    networks: vec![network_url(gcp, infra_id)],
                };
                self.api
                    .create_managed_zone(&gcp.project_id, &zone)
                    .await
                    .with_context(|| format!("failed to create managed zone {}", zone_name))?;
                info!(zone = %zone_name, "Created private zone");
                zone
            }
        };

        let internal_ip = self
            .api
            .get_address(
                &gcp.project_id,
                Some(gcp.region.clone()),
                &internal_address_name(infra_id),
            )
            .await
            .context("failed to get internal API address")?;
        for name in ["api", "api-int"] {
            let record = DnsRecord {
                name: format!("{}.{}", name, domain),
                addresses: vec![internal_ip.clone()],
                ttl: RECORD_TTL,
            };
            self.api
                .create_record_set(&gcp.project_id, &zone.name, &record)
                .await
                .with_context(|| format!("failed to create record {}", record.name))?;
        }
        info!(zone = %zone.name, ip = %internal_ip, "Created private API records");

        if config.is_external() {
            let public_zone = self
                .api
                .find_public_zone(&gcp.project_id, &format!("{}.", config.base_domain))
                .await
                .context("failed to find public zone")?
                .ok_or_else(|| Error::not_found("public managed zone", &config.base_domain))?;
            let external_ip = self
                .api
                .get_address(&gcp.project_id, None, &external_address_name(infra_id))
                .await
                .context("failed to get external API address")?;
            let record = DnsRecord {
                name: format!("api.{}", domain),
                addresses: vec![external_ip],
                ttl: RECORD_TTL,
            };
            self.api
                .create_record_set(&gcp.project_id, &public_zone, &record)
                .await
                .with_context(|| format!("failed to create record {}", record.name))?;
            info!(zone = %public_zone, "Created public API record");
        }
        Ok(())
    }
}

/// Reject worker layouts that leave the cluster without schedulable nodes
pub fn validate_workers(
    config: &InstallConfig,
    masters_schedulable: bool,
    worker_machine_sets: usize,
) -> Result<()> {
    let replicas = config.compute_replicas();
    if replicas == 0 && !masters_schedulable {
        return Err(Error::validation(
            "invalid configuration. No workers requested but masters are not schedulable",
        ));
    }
    if replicas > 0 && worker_machine_sets == 0 {
        return Err(Error::validation(format!(
            "invalid configuration. No worker assets available for requested number of compute replicas ({})",
            replicas
        )));
    }
    Ok(())
}

#[async_trait]
impl PreProvider for GcpProvider {
    async fn pre_provision(&self, input: &PreProvisionInput<'_>) -> Result<()> {
        let gcp = gcp_platform(input.install_config)?;
        validate_workers(
            input.install_config,
            input.masters_schedulable,
            input.worker_machine_sets,
        )?;

        let create = self.check_firewall_permission(gcp).await?;
        self.create_firewall_rules.store(create, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl InfraReadyProvider for GcpProvider {
    async fn infra_ready(&self, input: &InfraReadyInput<'_>) -> Result<()> {
        let config = input.install_config;
        if self.create_firewall_rules() {
            self.create_firewall_rules_for(config, input.cluster_id)
                .await?;
        } else {
            info!("Skipping firewall rule creation");
        }

        if config.platform.user_provisioned_dns().is_enabled() {
            info!("User-provisioned DNS enabled, skipping Cloud DNS records");
            return Ok(());
        }
        self.create_dns_records(config, input.cluster_id)
            .await
            .context("failed to create DNS records")
    }
}

#[async_trait]
impl IgnitionProvider for GcpProvider {
    async fn ignition(&self, input: &IgnitionInput<'_>) -> Result<IgnitionOutput> {
        let config = input.install_config;
        let gcp = gcp_platform(config)?;
        if !gcp.user_provisioned_dns.is_enabled() {
            return Ok(input.unchanged());
        }

        let infra_id = &input.cluster_id.infra_id;
        let private_ip = self
            .api
            .get_address(
                &gcp.project_id,
                Some(gcp.region.clone()),
                &internal_address_name(infra_id),
            )
            .await
            .context("failed to get internal API address")?;
        let mut public_ips = Vec::new();
        if config.is_external() {
            public_ips.push(
                self.api
                    .get_address(&gcp.project_id, None, &external_address_name(infra_id))
                    .await
                    .context("failed to get external API address")?,
            );
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
            PlatformKind::Gcp,
            &public_ips,
            &[private_ip],
        )
        .context("failed to edit bootstrap ignition")
    }
}

impl Provider for GcpProvider {
    fn name(&self) -> &'static str {
        "gcp"
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
            create_firewall_rules: Some(self.create_firewall_rules()),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemoryStore;
    use crate::provider::test_support::{
        capi_cluster, cluster_hosted_bootstrap, cluster_id, ignition_file, install_config,
        lb_config_data, merge_sources, NoCerts, StubCerts, MASTER_POINTER,
    };
    use mockall::predicate::{always, eq};
    use parking_lot::Mutex;
    use std::time::Duration;

    const GCP: &str = "  gcp:\n    projectID: demo-project\n    region: us-central1\n";
    const SHARED_VPC: &str =
        "  gcp:\n    projectID: demo-project\n    region: us-central1\n    networkProjectID: host-project\n    network: shared-net\n";

    fn fast_provider(api: MockGcpApi) -> GcpProvider {
        GcpProvider::new(Arc::new(api)).with_operation_wait(Backoff {
            initial: Duration::from_millis(1),
            factor: 1.0,
            steps: 5,
            cap: Duration::from_millis(1),
        })
    }

    fn pre_input<'a>(
        config: &'a InstallConfig,
        cluster_id: &'a ClusterId,
        masters_schedulable: bool,
        worker_machine_sets: usize,
    ) -> PreProvisionInput<'a> {
        PreProvisionInput {
            cluster_id,
            install_config: config,
            masters_schedulable,
            worker_machine_sets,
        }
    }

    #[test]
    fn five_rules_with_distinct_names() {
        let config = install_config(GCP);
        let rules = firewall_rules(&config, &cluster_id()).unwrap();
        let names: Vec<_> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "demo-x7k2p-control-plane",
                "demo-x7k2p-internal-cluster",
                "demo-x7k2p-api",
                "demo-x7k2p-internal-network",
                "demo-x7k2p-health-checks",
            ]
        );
        assert!(rules
            .iter()
            .all(|r| r.network == "projects/demo-project/global/networks/demo-x7k2p-network"));
        assert_eq!(rules[2].source_ranges, vec!["0.0.0.0/0"]);
        assert_eq!(rules[3].source_ranges, vec!["10.0.0.0/16"]);
    }

    #[test]
    fn health_check_ranges_depend_on_publish() {
        let external = install_config(GCP);
        let rules = firewall_rules(&external, &cluster_id()).unwrap();
        assert_eq!(
            rules[4].source_ranges,
            vec!["35.191.0.0/16", "130.211.0.0/22", "209.85.152.0/22", "209.85.204.0/22"]
        );

        let mut internal = install_config(GCP);
        internal.publish = strata_common::Publish::Internal;
        let rules = firewall_rules(&internal, &cluster_id()).unwrap();
        assert_eq!(rules[4].source_ranges, vec!["35.191.0.0/16", "130.211.0.0/22"]);
        assert_eq!(rules[2].source_ranges, vec!["10.0.0.0/16"]);
    }

    #[test]
    fn shared_vpc_rules_target_the_host_project_network() {
        let config = install_config(SHARED_VPC);
        let rules = firewall_rules(&config, &cluster_id()).unwrap();
        assert_eq!(rules[0].network, "projects/host-project/global/networks/shared-net");
    }

    /// No workers and unschedulable masters fails before any cloud call
    #[tokio::test]
    async fn no_workers_with_unschedulable_masters_is_rejected() {
        let mut config = install_config(GCP);
        config.compute[0].replicas = Some(0);
        let id = cluster_id();

        let provider = fast_provider(MockGcpApi::new());
        let err = provider
            .pre_provision(&pre_input(&config, &id, false, 0))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid install config: invalid configuration. No workers requested but masters are not schedulable"
        );
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn compute_replicas_without_worker_assets_is_rejected() {
        let config = install_config(GCP);
        let id = cluster_id();

        let err = fast_provider(MockGcpApi::new())
            .pre_provision(&pre_input(&config, &id, false, 0))
            .await
            .unwrap_err();
        assert!(err.to_string().ends_with(
            "No worker assets available for requested number of compute replicas (3)"
        ));
    }

    #[test]
    fn schedulable_masters_allow_zero_workers() {
        let mut config = install_config(GCP);
        config.compute[0].replicas = Some(0);
        validate_workers(&config, true, 0).unwrap();
    }

    /// A shared VPC without firewall permission skips rule creation
    #[tokio::test]
    async fn missing_firewall_permission_skips_rules() {
        let config = install_config(SHARED_VPC);
        let id = cluster_id();

        let mut api = MockGcpApi::new();
        api.expect_test_iam_permissions()
            .with(eq("host-project"), always())
            .times(1)
            .returning(|_, _| Ok(vec![]));
        api.expect_insert_firewall().never();
        api.expect_get_managed_zone()
            .returning(|_, name| {
                Ok(Some(ManagedZone {
                    name: name.to_string(),
                    dns_name: "demo.example.com.".to_string(),
                    networks: vec![],
                }))
            });
        api.expect_get_address()
            .returning(|_, region, _| {
                let ip = if region.is_some() { "10.0.0.2" } else { "34.1.1.1" };
                Ok(ip.to_string())
            });
        api.expect_create_record_set().returning(|_, _, _| Ok(()));
        api.expect_find_public_zone()
            .returning(|_, _| Ok(Some("public-zone".to_string())));

        let provider = fast_provider(api);
        provider
            .pre_provision(&pre_input(&config, &id, false, 1))
            .await
            .unwrap();
        assert!(!provider.create_firewall_rules());
        assert_eq!(provider.state().create_firewall_rules, Some(false));

        let store = MemoryStore::new();
        let cluster = capi_cluster();
        provider
            .infra_ready(&InfraReadyInput {
                cluster: &cluster,
                install_config: &config,
                client: &store,
                cluster_id: &id,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn granted_permission_keeps_rules_enabled() {
        let config = install_config(SHARED_VPC);
        let id = cluster_id();

        let mut api = MockGcpApi::new();
        api.expect_test_iam_permissions()
            .returning(|_, perms| Ok(perms.to_vec()));

        let provider = fast_provider(api);
        provider
            .pre_provision(&pre_input(&config, &id, false, 1))
            .await
            .unwrap();
        assert!(provider.create_firewall_rules());
        assert_eq!(provider.state().create_firewall_rules, Some(true));
        assert!(provider.state().images.is_none());
    }

    #[tokio::test]
    async fn firewall_rules_are_created_sequentially_and_polled() {
        let config = install_config(GCP);
        let events: Arc<Mutex<Vec<String>>> = Arc::default();

        let mut api = MockGcpApi::new();
        let e = events.clone();
        api.expect_insert_firewall()
            .with(eq("demo-project"), always())
            .times(5)
            .returning(move |_, rule| {
                e.lock().push(format!("insert {}", rule.name));
                Ok(format!("op-{}", rule.name))
            });
        let e = events.clone();
        let polls = Arc::new(Mutex::new(0u32));
        api.expect_get_operation().returning(move |_, op| {
            let mut polls = polls.lock();
            *polls += 1;
            // every operation reports running once before completing
            if *polls % 2 == 1 {
                Ok(OperationStatus::Running)
            } else {
                e.lock().push(format!("done {}", op));
                Ok(OperationStatus::Done)
            }
        });

        fast_provider(api)
            .create_firewall_rules_for(&config, &cluster_id())
            .await
            .unwrap();

        let events = events.lock();
        assert_eq!(events.len(), 10);
        for pair in events.chunks(2) {
            let rule = pair[0].strip_prefix("insert ").unwrap();
            assert_eq!(pair[1], format!("done op-{}", rule));
        }
    }

    #[tokio::test]
    async fn failed_operation_stops_rule_creation() {
        let config = install_config(GCP);

        let mut api = MockGcpApi::new();
        api.expect_insert_firewall()
            .times(1)
            .returning(|_, rule| Ok(format!("op-{}", rule.name)));
        api.expect_get_operation()
            .returning(|_, _| Ok(OperationStatus::Failed("QUOTA_EXCEEDED".to_string())));

        let err = fast_provider(api)
            .create_firewall_rules_for(&config, &cluster_id())
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .starts_with("failed to create firewall rule demo-x7k2p-control-plane"));
    }

    #[tokio::test]
    async fn existing_rules_are_skipped() {
        let config = install_config(GCP);

        let mut api = MockGcpApi::new();
        api.expect_insert_firewall().times(5).returning(|_, rule| {
            Err(Error::cloud_with_code("create", rule.name.clone(), 409, "alreadyExists"))
        });
        api.expect_get_operation().never();

        fast_provider(api)
            .create_firewall_rules_for(&config, &cluster_id())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dns_creates_private_zone_and_records() {
        let config = install_config(GCP);
        let records: Arc<Mutex<Vec<(String, DnsRecord)>>> = Arc::default();

        let mut api = MockGcpApi::new();
        api.expect_get_managed_zone().returning(|_, _| Ok(None));
        api.expect_create_managed_zone()
            .withf(|project, zone| {
                project == "demo-project"
                    && zone.name == "demo-x7k2p-private-zone"
                    && zone.dns_name == "demo.example.com."
            })
            .times(1)
            .returning(|_, _| Ok(()));
        api.expect_get_address()
            .with(eq("demo-project"), eq(Some("us-central1".to_string())), eq("demo-x7k2p-api-internal"))
            .returning(|_, _, _| Ok("10.0.0.2".to_string()));
        api.expect_get_address()
            .with(eq("demo-project"), eq(None::<String>), eq("demo-x7k2p-apiserver"))
            .returning(|_, _, _| Ok("34.1.1.1".to_string()));
        api.expect_find_public_zone()
            .with(eq("demo-project"), eq("example.com."))
            .returning(|_, _| Ok(Some("example-com".to_string())));
        let r = records.clone();
        api.expect_create_record_set().returning(move |_, zone, record| {
            r.lock().push((zone.to_string(), record.clone()));
            Ok(())
        });

        fast_provider(api)
            .create_dns_records(&config, &cluster_id())
            .await
            .unwrap();

        let records = records.lock();
        let summary: Vec<_> = records
            .iter()
            .map(|(zone, r)| (zone.as_str(), r.name.as_str(), r.addresses[0].as_str()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("demo-x7k2p-private-zone", "api.demo.example.com.", "10.0.0.2"),
                ("demo-x7k2p-private-zone", "api-int.demo.example.com.", "10.0.0.2"),
                ("example-com", "api.demo.example.com.", "34.1.1.1"),
            ]
        );
    }

    #[tokio::test]
    async fn ignition_is_untouched_without_user_provisioned_dns() {
        let store = MemoryStore::new();
        let config = install_config(GCP);
        let dir = tempfile::tempdir().unwrap();

        let bootstrap = br#"{"ignition":{"version":"3.2.0"}}"#;
        let master = br#"{"ignition":{"version":"3.2.0","config":{}}}"#;
        let out = fast_provider(MockGcpApi::new())
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
    async fn ignition_resolves_regional_and_global_api_addresses() {
        let store = MemoryStore::new();
        let config = install_config(&format!("{}    userProvisionedDNS: Enabled\n", GCP));
        let dir = tempfile::tempdir().unwrap();
        let certs = StubCerts::default();

        let mut api = MockGcpApi::new();
        api.expect_get_address()
            .with(
                eq("demo-project"),
                eq(Some("us-central1".to_string())),
                eq("demo-x7k2p-api-internal"),
            )
            .times(1)
            .returning(|_, _, _| Ok("10.0.0.2".to_string()));
        api.expect_get_address()
            .with(eq("demo-project"), eq(None::<String>), eq("demo-x7k2p-apiserver"))
            .times(1)
            .returning(|_, _, _| Ok("34.1.1.1".to_string()));

        let bootstrap = cluster_hosted_bootstrap("gcp");
        let out = fast_provider(api)
            .ignition(&IgnitionInput {
                client: &store,
                bootstrap_ignition: &bootstrap,
                master_ignition: MASTER_POINTER,
                install_config: &config,
                cluster_id: &cluster_id(),
                cert_reissuer: &certs,
                asset_dir: dir.path(),
            })
            .await
            .unwrap();

        let infra = ignition_file(&out.bootstrap, strata_ignition::edit::INFRASTRUCTURE_FILE_PATH);
        assert!(infra.contains("10.0.0.2"));
        assert!(infra.contains("34.1.1.1"));
        assert_eq!(
            ignition_file(&out.bootstrap, strata_ignition::edit::MCS_KEY_PATH),
            "stub-key"
        );
        assert_eq!(*certs.ips.lock(), vec!["10.0.0.2".parse::<std::net::IpAddr>().unwrap()]);

        let lb_config = lb_config_data(dir.path());
        assert_eq!(lb_config["internal-api-lb-ip"], "10.0.0.2");
        assert_eq!(lb_config["api-lb-ip"], "34.1.1.1");
        assert_eq!(
            merge_sources(&out.master),
            vec!["https://10.0.0.2:22623/config/master".to_string()]
        );
    }

    #[tokio::test]
    async fn ignition_fails_when_internal_address_is_missing() {
        let store = MemoryStore::new();
        let config = install_config(&format!("{}    userProvisionedDNS: Enabled\n", GCP));
        let dir = tempfile::tempdir().unwrap();

        let mut api = MockGcpApi::new();
        api.expect_get_address()
            .times(1)
            .returning(|_, _, name| Err(Error::not_found("address", name)));

        let bootstrap = cluster_hosted_bootstrap("gcp");
        let err = fast_provider(api)
            .ignition(&IgnitionInput {
                client: &store,
                bootstrap_ignition: &bootstrap,
                master_ignition: MASTER_POINTER,
                install_config: &config,
                cluster_id: &cluster_id(),
                cert_reissuer: &StubCerts::default(),
                asset_dir: dir.path(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to get internal API address"));
        assert!(!strata_ignition::lbconfig::lb_config_path(dir.path()).exists());
    }
}
