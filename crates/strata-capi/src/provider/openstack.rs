//! OpenStack provider hooks
//!
//! Post-provision gives the bootstrap machine a floating IP on the external
//! network so the installer can reach it for log gathering.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use strata_common::{Error, Result, ResultExt, CAPI_NAMESPACE};

use super::{PostProvider, PostProvisionInput, Provider};
use crate::constants::{bootstrap_machine_name, OPENSTACK_API_VERSION};
use crate::manifest::ObjectKey;

/// Tag prefix tying a floating IP to its cluster for garbage collection
pub const CLUSTER_ID_TAG_PREFIX: &str = "openshiftClusterID=";

/// A floating IP
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloatingIp {
    /// Floating IP id
    pub id: String,
    /// Allocated address
    pub address: String,
}

/// The OpenStack APIs the hooks use
#[cfg_attr(test, automock)]
#[async_trait]
pub trait OpenStackApi: Send + Sync {
    /// Id of a network by name, None if absent
    async fn find_network_id(&self, name: &str) -> Result<Option<String>>;

    /// Id of the port of `instance_id` on `network_id`, None if absent
    async fn find_port(&self, instance_id: &str, network_id: &str) -> Result<Option<String>>;

    /// Floating IP already bound to a port
    async fn find_floating_ip_for_port(&self, port_id: &str) -> Result<Option<FloatingIp>>;

    /// Allocate a floating IP on `network_id` bound to `port_id`
    async fn create_floating_ip(
        &self,
        network_id: &str,
        port_id: &str,
        description: &str,
    ) -> Result<FloatingIp>;

    /// Add a tag to a floating IP
    async fn tag_floating_ip(&self, id: &str, tag: &str) -> Result<()>;
}

/// OpenStack platform provider
pub struct OpenStackProvider {
    api: Arc<dyn OpenStackApi>,
}

impl OpenStackProvider {
    /// Create a provider over an OpenStack client
    pub fn new(api: Arc<dyn OpenStackApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl PostProvider for OpenStackProvider {
    async fn post_provision(&self, input: &PostProvisionInput<'_>) -> Result<()> {
        let external_network = input
            .install_config
            .platform
            .openstack
            .as_ref()
            .and_then(|o| o.external_network.as_deref())
            .filter(|n| !n.is_empty());
        let Some(external_network) = external_network else {
            debug!("No external network, skipping bootstrap floating IP");
            return Ok(());
        };

        let infra_id = &input.cluster_id.infra_id;
        let machine_name = bootstrap_machine_name(infra_id);
        let machine = input
            .client
            .get(&ObjectKey::new(
                OPENSTACK_API_VERSION,
                "OpenStackMachine",
                CAPI_NAMESPACE,
                &machine_name,
            ))
            .await
            .with_context(|| format!("failed to get bootstrap machine {}", machine_name))?;
        let instance_id = machine
            .status_str("/instanceID")
            .or_else(|| machine.spec_str("/instanceID"))
            .ok_or_else(|| {
                Error::provider_permanent("openstack", "bootstrap machine has no instance ID")
            })?
            .to_string();

        let cluster = input
            .client
            .get(&ObjectKey::new(
                OPENSTACK_API_VERSION,
                "OpenStackCluster",
                CAPI_NAMESPACE,
                infra_id,
            ))
            .await
            .context("failed to get OpenStackCluster")?;
        let cluster_network = cluster
            .status_str("/network/id")
            .ok_or_else(|| Error::provider_permanent("openstack", "cluster network not reported"))?
            .to_string();

        let external_network_id = self
            .api
            .find_network_id(external_network)
            .await
            .with_context(|| format!("failed to get external network {}", external_network))?
            .ok_or_else(|| Error::not_found("network", external_network))?;
        let port = self
            .api
            .find_port(&instance_id, &cluster_network)
            .await
            .context("failed to find bootstrap port")?
            .ok_or_else(|| Error::not_found("port", format!("of instance {}", instance_id)))?;

        let fip = match self
            .api
            .find_floating_ip_for_port(&port)
            .await
            .context("failed to list floating IPs")?
        {
            Some(fip) => {
                debug!(address = %fip.address, "Bootstrap port already has a floating IP");
                fip
            }
            None => self
                .api
                .create_floating_ip(
                    &external_network_id,
                    &port,
                    &format!("{} bootstrap machine", infra_id),
                )
                .await
                .context("failed to create floating IP")?,
        };

        let tag = format!("{}{}", CLUSTER_ID_TAG_PREFIX, infra_id);
        self.api
            .tag_floating_ip(&fip.id, &tag)
            .await
            .with_context(|| format!("failed to tag floating IP {}", fip.address))?;
        info!(address = %fip.address, machine = %machine_name, "Attached floating IP to bootstrap machine");
        Ok(())
    }
}

impl Provider for OpenStackProvider {
    fn name(&self) -> &'static str {
        "openstack"
    }

    fn as_post_provider(&self) -> Option<&dyn PostProvider> {
        Some(self)
    }
}
