//! rcgen-backed certificate authority

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{
    parse_pem, CertOptions, CertificateAuthority, IssuedCertificate, PkiError, Result,
    ValidationError,
};

/// Validity of a CA created by [`LocalAuthority::new`]
pub const CA_VALIDITY_DAYS: i64 = 10 * 365;

/// Leaf `not_before` is backdated by this much to tolerate clock skew
const CLOCK_SKEW_ALLOWANCE: Duration = Duration::hours(1);

const ORGANIZATION: &str = "certloop";

/// Certificate authority whose key pair is held in memory as PEM
#[derive(Clone)]
pub struct LocalAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    ca_cert_pem: String,
    ca_cert_der: Vec<u8>,
}

impl std::fmt::Debug for LocalAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAuthority")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish_non_exhaustive()
    }
}

impl LocalAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let now = OffsetDateTime::now_utc();
        params.not_before = now - CLOCK_SKEW_ALLOWANCE;
        params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem: key_pair.serialize_pem(),
            ca_cert_pem: cert.pem(),
            ca_cert_der: cert.der().to_vec(),
        })
    }

    /// Load a CA from its PEM-encoded certificate and key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;

        let ca_cert_der = parse_pem(cert_pem)?;
        X509Certificate::from_der(&ca_cert_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
            ca_cert_der,
        })
    }

    /// CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }
}

impl CertificateAuthority for LocalAuthority {
    fn generate(&self, options: &CertOptions) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(&options.dns_name);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = OffsetDateTime::now_utc();
        params.not_before = now.min(options.not_after) - CLOCK_SKEW_ALLOWANCE;
        params.not_after = options.not_after;

        let dns = Ia5String::try_from(options.dns_name.clone()).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "invalid DNS name '{}': {}",
                options.dns_name, e
            ))
        })?;
        params.subject_alt_names = vec![SanType::DnsName(dns)];

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let leaf = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign leaf cert: {}", e))
        })?;

        tracing::debug!(
            dns_name = %options.dns_name,
            not_after = %options.not_after,
            "issued leaf certificate"
        );

        Ok(IssuedCertificate {
            certificate_pem: leaf.pem(),
            private_key_pem: leaf_key.serialize_pem(),
        })
    }

    fn validate(
        &self,
        certificate_der: &[u8],
        at: OffsetDateTime,
    ) -> std::result::Result<(), ValidationError> {
        let (_, cert) = X509Certificate::from_der(certificate_der)
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;
        let (_, ca_cert) = X509Certificate::from_der(&self.ca_cert_der)
            .map_err(|e| ValidationError::Other(format!("stored CA cert unreadable: {}", e)))?;

        if cert.issuer().as_raw() != ca_cert.subject().as_raw() {
            return Err(ValidationError::ChainMismatch(format!(
                "issued by '{}', expected '{}'",
                cert.issuer(),
                ca_cert.subject()
            )));
        }

        cert.verify_signature(Some(ca_cert.public_key()))
            .map_err(|_| ValidationError::ChainMismatch("signature verification failed".into()))?;

        let now = at.unix_timestamp();
        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();

        if now < not_before {
            return Err(ValidationError::NotYetValid { not_before });
        }
        if now >= not_after {
            return Err(ValidationError::Expired { not_after });
        }

        Ok(())
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}
