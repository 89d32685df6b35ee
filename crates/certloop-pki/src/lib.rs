//! PKI primitives for keeping a serving certificate current
//!
//! The reconciler consumes a certificate authority through exactly two
//! operations, issuing a leaf and validating a leaf, captured by the
//! [`CertificateAuthority`] trait. [`LocalAuthority`] implements it on top of
//! `rcgen` and `x509-parser` for a CA whose key material lives in a Secret.
//! [`validity::evaluate`] classifies a stored certificate/key pair.

#![deny(missing_docs)]

mod authority;
pub mod validity;

pub use authority::LocalAuthority;
pub use validity::{evaluate, RecordFields, Validity};

use thiserror::Error;
use time::OffsetDateTime;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Reasons a leaf certificate is rejected by its authority
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The certificate bytes are not a parseable X.509 certificate
    #[error("malformed certificate: {0}")]
    Malformed(String),

    /// The validity window ended before the evaluation instant
    #[error("certificate expired at unix time {not_after}")]
    Expired {
        /// Expiry as a Unix timestamp
        not_after: i64,
    },

    /// The validity window starts after the evaluation instant
    #[error("certificate not valid before unix time {not_before}")]
    NotYetValid {
        /// Start of validity as a Unix timestamp
        not_before: i64,
    },

    /// The certificate was not issued by this authority
    #[error("certificate chain mismatch: {0}")]
    ChainMismatch(String),

    /// Any other rejection
    #[error("certificate rejected: {0}")]
    Other(String),
}

/// Parameters for issuing one leaf certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertOptions {
    /// Expiry of the issued certificate
    pub not_after: OffsetDateTime,
    /// DNS name the certificate is issued for (CN and SAN)
    pub dns_name: String,
}

impl CertOptions {
    /// Build options for a leaf valid until `not_after` for `dns_name`
    pub fn new(not_after: OffsetDateTime, dns_name: impl Into<String>) -> Self {
        Self {
            not_after,
            dns_name: dns_name.into(),
        }
    }
}

/// A freshly issued certificate and its private key, both PEM-encoded
#[derive(Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded leaf certificate
    pub certificate_pem: String,
    /// PEM-encoded private key
    pub private_key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// An opaque signer that issues and validates leaf certificates
pub trait CertificateAuthority: Send + Sync {
    /// Issue a new leaf certificate with a freshly generated key
    fn generate(&self, options: &CertOptions) -> Result<IssuedCertificate>;

    /// Check that a DER-encoded leaf was signed by this authority and is
    /// valid at `at`
    fn validate(
        &self,
        certificate_der: &[u8],
        at: OffsetDateTime,
    ) -> std::result::Result<(), ValidationError>;
}

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Validity window and names of a parsed certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// DNS names from the subject alternative name extension
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    /// Parse certificate info from a PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from a DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(PkiError::ParseError(format!(
                    "failed to parse subject alternative names: {}",
                    e
                )))
            }
        };

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            dns_names,
        })
    }

    /// Expiry as an `OffsetDateTime`
    pub fn not_after_datetime(&self) -> Result<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.not_after)
            .map_err(|e| PkiError::ParseError(format!("certificate expiry out of range: {}", e)))
    }

    /// Whether the certificate names `dns_name` in its SANs
    pub fn covers(&self, dns_name: &str) -> bool {
        self.dns_names
            .iter()
            .any(|name| name.eq_ignore_ascii_case(dns_name))
    }
}
