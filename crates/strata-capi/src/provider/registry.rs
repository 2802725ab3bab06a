//! Platform → provider selection

use std::sync::Arc;

use tracing::debug;

use strata_common::{Error, PlatformKind, Result};

use super::{
    AwsApi, AwsProvider, AzureApi, AzureProvider, DefaultProvider, GcpApi, GcpProvider,
    OpenStackApi, OpenStackProvider, Provider,
};

/// Cloud clients available to the providers
#[derive(Clone, Default)]
pub struct CloudClients {
    /// AWS client
    pub aws: Option<Arc<dyn AwsApi>>,
    /// Azure client
    pub azure: Option<Arc<dyn AzureApi>>,
    /// GCP client
    pub gcp: Option<Arc<dyn GcpApi>>,
    /// OpenStack client
    pub openstack: Option<Arc<dyn OpenStackApi>>,
}

fn require<T: ?Sized>(client: Option<Arc<T>>, platform: PlatformKind) -> Result<Arc<T>> {
    client.ok_or_else(|| {
        Error::validation_for_field(
            format!("platform.{}", platform),
            format!("no {} cloud client configured", platform),
        )
    })
}

/// Build the provider for a platform
///
/// Platforms without hooks get the no-op [`DefaultProvider`].
pub fn create_provider(platform: PlatformKind, clients: CloudClients) -> Result<Box<dyn Provider>> {
    let provider: Box<dyn Provider> = match platform {
        PlatformKind::Aws => Box::new(AwsProvider::new(require(clients.aws, platform)?)),
        PlatformKind::Azure => Box::new(AzureProvider::new(require(clients.azure, platform)?)),
        PlatformKind::Gcp => Box::new(GcpProvider::new(require(clients.gcp, platform)?)),
        PlatformKind::OpenStack => {
            Box::new(OpenStackProvider::new(require(clients.openstack, platform)?))
        }
        PlatformKind::IbmCloud | PlatformKind::Ovirt | PlatformKind::PowerVs => {
            Box::new(DefaultProvider)
        }
    };
    debug!(platform = %platform, provider = provider.name(), "Selected provider");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::gcp::MockGcpApi;

    #[test]
    fn hookless_platforms_get_the_default_provider() {
        for platform in [PlatformKind::IbmCloud, PlatformKind::Ovirt, PlatformKind::PowerVs] {
            let provider = create_provider(platform, CloudClients::default()).unwrap();
            assert_eq!(provider.name(), "default");
            assert!(provider.as_pre_provider().is_none());
        }
    }

    #[test]
    fn missing_client_is_a_configuration_error() {
        let err = create_provider(PlatformKind::Aws, CloudClients::default())
            .err()
            .unwrap();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("no aws cloud client configured"));
    }

    #[test]
    fn gcp_offers_pre_infra_and_ignition_hooks() {
        let clients = CloudClients {
            gcp: Some(Arc::new(MockGcpApi::new())),
            ..Default::default()
        };
        let provider = create_provider(PlatformKind::Gcp, clients).unwrap();
        assert_eq!(provider.name(), "gcp");
        assert!(provider.as_pre_provider().is_some());
        assert!(provider.as_infra_ready_provider().is_some());
        assert!(provider.as_ignition_provider().is_some());
        assert!(provider.as_post_provider().is_none());
    }
}
