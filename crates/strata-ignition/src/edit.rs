//! Rewrite bootstrap/master Ignition once load-balancer addresses are known
//!
//! Used when the cluster hosts its own DNS: the API load balancer addresses
//! only exist after infrastructure provisioning, but the bootstrap Ignition
//! was rendered before that. [`edit_ignition`] patches the addresses into
//! the rendered documents.

use std::net::IpAddr;
use std::path::Path;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde_yaml::{Mapping, Value};
use tracing::{debug, info};

use strata_common::{Error, PlatformKind, Result, MACHINE_CONFIG_SERVER_PORT};

use crate::config::IgnitionConfig;
use crate::lbconfig::write_lb_config;
use crate::pki::CertReissuer;

/// Infrastructure status manifest inside the bootstrap Ignition
pub const INFRASTRUCTURE_FILE_PATH: &str =
    "/opt/openshift/manifests/cluster-infrastructure-02-config.yml";
/// MCS serving certificate
pub const MCS_CERT_PATH: &str = "/opt/openshift/tls/machine-config-server.crt";
/// MCS serving key
pub const MCS_KEY_PATH: &str = "/opt/openshift/tls/machine-config-server.key";
/// MCS TLS secret manifest
pub const MCS_SECRET_PATH: &str = "/opt/openshift/manifests/machine-config-server-tls-secret.yaml";
/// DNS type marking a cluster that serves its own API DNS records
pub const CLUSTER_HOSTED_DNS: &str = "ClusterHosted";

/// Everything [`edit_ignition`] reads
pub struct EditIgnitionInput<'a> {
    /// Rendered bootstrap Ignition
    pub bootstrap: &'a [u8],
    /// Rendered master pointer Ignition
    pub master: &'a [u8],
    /// `{name}.{baseDomain}`
    pub cluster_domain: &'a str,
    /// Installer working directory for the LB override file
    pub asset_dir: &'a Path,
    /// Issues the MCS certificate for the new addresses
    pub cert_reissuer: &'a dyn CertReissuer,
}

/// Edited Ignition documents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IgnitionOutput {
    /// Bootstrap Ignition
    pub bootstrap: Vec<u8>,
    /// Master pointer Ignition
    pub master: Vec<u8>,
}

impl IgnitionOutput {
    /// Output equal to the input documents
    pub fn unchanged(input: &EditIgnitionInput<'_>) -> Self {
        Self {
            bootstrap: input.bootstrap.to_vec(),
            master: input.master.to_vec(),
        }
    }
}

/// Key of a platform under `status.platformStatus`
fn platform_status_key(platform: PlatformKind) -> Result<&'static str> {
    match platform {
        PlatformKind::Aws => Ok("aws"),
        PlatformKind::Azure => Ok("azure"),
        PlatformKind::Gcp => Ok("gcp"),
        other => Err(Error::validation(format!(
            "ignition editing is not supported on platform {}",
            other
        ))),
    }
}

/// Patch LB addresses into the bootstrap and master Ignition
///
/// Fails when the infrastructure manifest is missing or unreadable, when an
/// address is not an IP, or when the LB override file cannot be written.
pub fn edit_ignition(
    input: &EditIgnitionInput<'_>,
    platform: PlatformKind,
    public_ips: &[String],
    private_ips: &[String],
) -> Result<IgnitionOutput> {
    let status_key = platform_status_key(platform)?;
    let mut bootstrap = IgnitionConfig::from_slice(input.bootstrap)?;

    let infra_file = bootstrap.file_mut(INFRASTRUCTURE_FILE_PATH).ok_or_else(|| {
        Error::ignition(
            INFRASTRUCTURE_FILE_PATH,
            "infrastructure manifest not found in bootstrap ignition",
        )
    })?;
    let mut infra: Value = serde_yaml::from_slice(&infra_file.decoded_contents()?)
        .map_err(|e| Error::ignition(INFRASTRUCTURE_FILE_PATH, e.to_string()))?;
    if set_cluster_hosted_ips(&mut infra, status_key, public_ips, private_ips)? {
        let yaml = serde_yaml::to_string(&infra)?;
        infra_file.set_contents(yaml.as_bytes());
        info!(
            platform = %platform,
            public_ips = ?public_ips,
            private_ips = ?private_ips,
            "Set cluster-hosted load balancer IPs"
        );
    } else {
        debug!(platform = %platform, "DNS is not cluster hosted, infrastructure manifest unchanged");
    }

    if !private_ips.is_empty() {
        reissue_mcs_cert(&mut bootstrap, input, private_ips)?;
    }

    write_lb_config(input.asset_dir, public_ips, private_ips)
        .map_err(|e| e.context("failed to write load balancer config"))?;

    let master = match private_ips.first() {
        Some(ip) => point_master_at(input.master, ip)?,
        None => input.master.to_vec(),
    };

    Ok(IgnitionOutput {
        bootstrap: bootstrap.to_vec()?,
        master,
    })
}

/// Set `clusterHosted` IPs when the platform's DNS type is cluster hosted
///
/// Returns whether the document changed.
fn set_cluster_hosted_ips(
    infra: &mut Value,
    status_key: &str,
    public_ips: &[String],
    private_ips: &[String],
) -> Result<bool> {
    let lb_config = infra
        .get_mut("status")
        .and_then(|s| s.get_mut("platformStatus"))
        .and_then(|p| p.get_mut(status_key))
        .and_then(|p| p.get_mut("cloudLoadBalancerConfig"));
    let Some(lb_config) = lb_config else {
        return Ok(false);
    };
    if lb_config.get("dnsType").and_then(Value::as_str) != Some(CLUSTER_HOSTED_DNS) {
        return Ok(false);
    }

    let mapping = lb_config.as_mapping_mut().ok_or_else(|| {
        Error::ignition(
            INFRASTRUCTURE_FILE_PATH,
            "cloudLoadBalancerConfig is not a mapping",
        )
    })?;
    let hosted = mapping
        .entry(Value::from("clusterHosted"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let hosted = hosted.as_mapping_mut().ok_or_else(|| {
        Error::ignition(INFRASTRUCTURE_FILE_PATH, "clusterHosted is not a mapping")
    })?;

    hosted.insert(Value::from("apiIntLoadBalancerIPs"), ip_list(private_ips));
    if !public_ips.is_empty() {
        hosted.insert(Value::from("apiLoadBalancerIPs"), ip_list(public_ips));
    }
    Ok(true)
}

fn ip_list(ips: &[String]) -> Value {
    Value::Sequence(ips.iter().map(|ip| Value::from(ip.as_str())).collect())
}

fn parse_ips(ips: &[String]) -> Result<Vec<IpAddr>> {
    ips.iter()
        .map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|_| Error::validation(format!("invalid load balancer IP address: {}", ip)))
        })
        .collect()
}

/// Reissue the MCS cert for the private IPs and rewrite the files embedding it
fn reissue_mcs_cert(
    bootstrap: &mut IgnitionConfig,
    input: &EditIgnitionInput<'_>,
    private_ips: &[String],
) -> Result<()> {
    let has_mcs_files = [MCS_CERT_PATH, MCS_KEY_PATH, MCS_SECRET_PATH]
        .iter()
        .any(|path| bootstrap.file(path).is_some());
    if !has_mcs_files {
        debug!("No machine-config-server TLS files in bootstrap ignition");
        return Ok(());
    }

    let ips = parse_ips(private_ips)?;
    let pair = input.cert_reissuer.reissue_mcs(input.cluster_domain, &ips)?;

    if let Some(file) = bootstrap.file_mut(MCS_CERT_PATH) {
        file.set_contents(pair.cert_pem.as_bytes());
    }
    if let Some(file) = bootstrap.file_mut(MCS_KEY_PATH) {
        file.set_contents(pair.key_pem.as_bytes());
    }
    if let Some(file) = bootstrap.file_mut(MCS_SECRET_PATH) {
        let mut secret: Secret = serde_yaml::from_slice(&file.decoded_contents()?)
            .map_err(|e| Error::ignition(MCS_SECRET_PATH, e.to_string()))?;
        let data = secret.data.get_or_insert_with(Default::default);
        data.insert(
            "tls.crt".to_string(),
            ByteString(pair.cert_pem.clone().into_bytes()),
        );
        data.insert(
            "tls.key".to_string(),
            ByteString(pair.key_pem.clone().into_bytes()),
        );
        let yaml = serde_yaml::to_string(&secret)?;
        file.set_contents(yaml.as_bytes());
    }

    info!(ips = ?private_ips, "Reissued machine-config-server certificate");
    Ok(())
}

/// Point the master Ignition's config source at `ip:22623`
fn point_master_at(master: &[u8], ip: &str) -> Result<Vec<u8>> {
    let mut config = IgnitionConfig::from_slice(master)?;
    let host = host_port(ip, MACHINE_CONFIG_SERVER_PORT);

    let Some(refs) = config.ignition.config.as_mut() else {
        return Ok(master.to_vec());
    };
    let mut changed = false;
    for resource in refs.merge.iter_mut() {
        if let Some(source) = resource.source.as_mut() {
            *source = replace_url_host(source, &host)?;
            changed = true;
        }
    }
    if !changed {
        return Ok(master.to_vec());
    }

    debug!(host = %host, "Pointed master ignition at machine-config server");
    config.to_vec()
}

fn host_port(ip: &str, port: u16) -> String {
    if ip.contains(':') {
        format!("[{}]:{}", ip, port)
    } else {
        format!("{}:{}", ip, port)
    }
}

/// Replace the authority of `scheme://authority/path` with `host`
fn replace_url_host(url: &str, host: &str) -> Result<String> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| Error::ignition("ignition.config.merge", format!("invalid URL: {}", url)))?;
    let path_start = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Ok(format!("{}://{}{}", scheme, host, &rest[path_start..]))
}
