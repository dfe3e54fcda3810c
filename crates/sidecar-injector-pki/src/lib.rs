//! Self-signed TLS material for the webhook endpoint
//!
//! The API server calls the mutation webhook over HTTPS and verifies it
//! against the CA bundle in the MutatingWebhookConfiguration. Without an
//! external certificate manager the controller issues a single self-signed
//! certificate that is both the CA bundle and the serving certificate.

#![deny(missing_docs)]

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, KeyPair, KeyUsagePurpose, RsaKeySize, SanType, PKCS_RSA_SHA256,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity of issued certificates
pub const CERT_VALIDITY_YEARS: i64 = 10;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// A PEM-encoded key and certificate pair
#[derive(Clone, Debug)]
pub struct IssuedCertificate {
    /// PKCS#8 private key
    pub key_pem: String,
    /// X.509 certificate
    pub cert_pem: String,
}

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

/// Issue a self-signed certificate for `dns_name`.
///
/// The key is RSA 2048. Both the subject common name and the single DNS
/// subject alternative name are `dns_name`. The certificate is valid for
/// [`CERT_VALIDITY_YEARS`] and may sign certificates, so it can double as
/// the webhook CA bundle.
pub fn issue(dns_name: &str) -> Result<IssuedCertificate> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(dns_name.to_string()));
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
    ];

    let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let san = Ia5String::try_from(dns_name.to_string()).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("invalid DNS name '{}': {}", dns_name, e))
    })?;
    params.subject_alt_names = vec![SanType::DnsName(san)];

    let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_2048)
        .map_err(|e| PkiError::KeyGenerationFailed(format!("failed to generate RSA key: {}", e)))?;

    let cert = params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateGenerationFailed(format!("failed to self-sign: {}", e))
    })?;

    Ok(IssuedCertificate {
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Summary of a PEM certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let (_, pem) = parse_x509_pem(pem_data.as_bytes())
            .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
        let (_, cert) = X509Certificate::from_der(&pem.contents)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            common_name,
            dns_names,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::pem::PemObject;
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use std::sync::Arc;

    #[test]
    fn issued_certificate_names_the_service() {
        let issued = issue("svc.ns").unwrap();
        let info = CertificateInfo::from_pem(&issued.cert_pem).unwrap();
        assert_eq!(info.common_name, "svc.ns");
        assert_eq!(info.dns_names, vec!["svc.ns".to_string()]);
    }

    #[test]
    fn validity_is_ten_years() {
        let issued = issue("sidecar-injector-default.kube-system.svc").unwrap();
        let info = CertificateInfo::from_pem(&issued.cert_pem).unwrap();
        let days = info.lifetime_secs() / 86_400;
        assert_eq!(days, CERT_VALIDITY_YEARS * 365);
    }

    #[test]
    fn certificate_may_sign_and_is_rsa_2048() {
        let issued = issue("svc.ns").unwrap();
        let (_, pem) = parse_x509_pem(issued.cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();

        let usage = cert.key_usage().unwrap().unwrap().value;
        assert!(usage.digital_signature());
        assert!(usage.key_cert_sign());
        assert!(cert.is_ca());

        match cert.public_key().parsed().unwrap() {
            x509_parser::public_key::PublicKey::RSA(rsa) => assert_eq!(rsa.key_size(), 2048),
            other => panic!("unexpected key type: {:?}", other),
        }
    }

    #[test]
    fn key_matches_certificate() {
        let issued = issue("svc.ns").unwrap();
        let key = KeyPair::from_pem(&issued.key_pem).unwrap();
        let (_, pem) = parse_x509_pem(issued.cert_pem.as_bytes()).unwrap();
        let (_, cert) = X509Certificate::from_der(&pem.contents).unwrap();
        assert_eq!(
            cert.public_key().subject_public_key.data.as_ref(),
            key.public_key_raw()
        );
    }

    #[test]
    fn pair_loads_as_tls_server_identity() {
        let issued = issue("svc.ns").unwrap();
        let cert = CertificateDer::from_pem_slice(issued.cert_pem.as_bytes()).unwrap();
        let key = PrivateKeyDer::from_pem_slice(issued.key_pem.as_bytes()).unwrap();

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let config = rustls::ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key);
        assert!(config.is_ok());
    }

    #[test]
    fn invalid_dns_name_is_rejected() {
        let err = issue("bad name\u{1F600}").unwrap_err();
        assert!(matches!(err, PkiError::CertificateGenerationFailed(_)));
    }

    #[test]
    fn garbage_pem_is_a_parse_error() {
        assert!(matches!(
            CertificateInfo::from_pem("not a certificate"),
            Err(PkiError::ParseError(_))
        ));
    }
}
