//! Machine-config server certificate reissue
//!
//! The installer's MCS certificate is generated before the load balancer
//! exists, so it only names `api-int.<clusterDomain>`. Once the private LB
//! addresses are known the certificate is reissued with those IPs as extra
//! SANs, signed by the same root CA.

use std::net::IpAddr;

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity of a reissued MCS certificate (10 years, like the original)
pub const MCS_CERT_VALIDITY_DAYS: i64 = 3650;

/// Common name of the machine-config server certificate
pub const MCS_COMMON_NAME: &str = "system:machine-config-server";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate or key could not be parsed
    #[error("certificate parsing error: {0}")]
    Parse(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
}

impl From<PkiError> for strata_common::Error {
    fn from(e: PkiError) -> Self {
        strata_common::Error::ignition("machine-config-server certificate", e.to_string())
    }
}

/// A PEM certificate and its private key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertKeyPair {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Issues TLS material for the machine-config server
pub trait CertReissuer: Send + Sync {
    /// Issue a serving certificate for `api-int.<cluster_domain>` plus `ips`
    fn reissue_mcs(&self, cluster_domain: &str, ips: &[IpAddr]) -> Result<CertKeyPair, PkiError>;
}

/// The installer's root CA, loaded from PEM
#[derive(Clone)]
pub struct RootCa {
    cert_pem: String,
    key_pem: String,
}

impl RootCa {
    /// Load the root CA from PEM, validating both halves parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse root CA key: {}", e)))?;
        parse_pem(cert_pem)?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    /// PEM of the CA certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }
}

impl CertReissuer for RootCa {
    fn reissue_mcs(&self, cluster_domain: &str, ips: &[IpAddr]) -> Result<CertKeyPair, PkiError> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(MCS_COMMON_NAME.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let now = ::time::OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + ::time::Duration::days(MCS_CERT_VALIDITY_DAYS);

        let host = format!("api-int.{}", cluster_domain);
        let dns = Ia5String::try_from(host.clone())
            .map_err(|e| PkiError::Generation(format!("invalid DNS name '{}': {}", host, e)))?;
        params.subject_alt_names = std::iter::once(SanType::DnsName(dns))
            .chain(ips.iter().copied().map(SanType::IpAddress))
            .collect();

        let key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate MCS key: {}", e)))?;

        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load root CA key: {}", e)))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| PkiError::Generation(format!("failed to sign MCS cert: {}", e)))?;

        Ok(CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>, PkiError> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Subject alternative names of a PEM certificate, rendered as strings
pub fn subject_alt_names(cert_pem: &str) -> Result<Vec<String>, PkiError> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::Parse(format!("invalid SAN extension: {}", e)))?;

    let mut names = Vec::new();
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => names.push(dns.to_string()),
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => {
                        let octets: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
                        names.push(IpAddr::from(octets).to_string());
                    }
                    16 => {
                        let mut octets = [0u8; 16];
                        octets.copy_from_slice(bytes);
                        names.push(IpAddr::from(octets).to_string());
                    }
                    _ => {}
                },
                _ => {}
            }
        }
    }
    Ok(names)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rcgen::BasicConstraints;

    /// A throwaway root CA for tests
    pub(crate) fn test_root_ca() -> RootCa {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String("root-ca".to_string()));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        RootCa::from_pem(&cert.pem(), &key.serialize_pem()).unwrap()
    }

    #[test]
    fn reissued_cert_names_api_int_and_private_ips() {
        let ca = test_root_ca();
        let ips: Vec<IpAddr> = vec!["10.0.0.5".parse().unwrap(), "10.0.1.5".parse().unwrap()];

        let pair = ca.reissue_mcs("demo.example.com", &ips).unwrap();
        let sans = subject_alt_names(&pair.cert_pem).unwrap();
        assert_eq!(sans, vec!["api-int.demo.example.com", "10.0.0.5", "10.0.1.5"]);
        assert!(pair.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn reissued_cert_is_signed_by_root_ca() {
        let ca = test_root_ca();
        let pair = ca.reissue_mcs("demo.example.com", &[]).unwrap();

        let ca_der = parse_pem(ca.cert_pem()).unwrap();
        let (_, ca_cert) = X509Certificate::from_der(&ca_der).unwrap();
        let leaf_der = parse_pem(&pair.cert_pem).unwrap();
        let (_, leaf) = X509Certificate::from_der(&leaf_der).unwrap();

        assert_eq!(leaf.issuer(), ca_cert.subject());
        assert!(leaf.verify_signature(Some(ca_cert.public_key())).is_ok());
    }

    #[test]
    fn rejects_garbage_pem() {
        assert!(RootCa::from_pem("not a cert", "not a key").is_err());
    }
}
