//! Classification of a stored certificate/key pair
//!
//! [`evaluate`] is a pure function of the record, the authority and the
//! evaluation instant. Parse and validation failures are reported as
//! [`Validity::Invalid`] rather than errors because the caller recovers from
//! them by reissuing.

use rcgen::{KeyPair, PublicKeyData};
use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{parse_pem, CertificateAuthority, CertificateInfo};

/// The two managed byte-string fields of a certificate record
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFields<'a> {
    /// PEM-encoded leaf certificate, if present
    pub certificate: Option<&'a [u8]>,
    /// PEM-encoded private key, if present
    pub private_key: Option<&'a [u8]>,
}

/// Classification of a stored certificate/key pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validity {
    /// One or both fields are missing
    Absent,
    /// The pair is present but unusable
    Invalid {
        /// Why the pair was rejected
        reason: String,
    },
    /// The pair is usable until `not_after`
    Valid {
        /// Expiry of the stored certificate
        not_after: OffsetDateTime,
    },
}

impl Validity {
    fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid {
            reason: reason.into(),
        }
    }
}

/// Classify the stored pair in `fields`
///
/// `expected_dns_name` is the name the serving certificate must cover;
/// `now` is the instant validity is judged at.
pub fn evaluate(
    fields: &RecordFields<'_>,
    authority: &dyn CertificateAuthority,
    expected_dns_name: &str,
    now: OffsetDateTime,
) -> Validity {
    let (Some(certificate), Some(private_key)) = (fields.certificate, fields.private_key) else {
        return Validity::Absent;
    };

    let Ok(certificate_pem) = std::str::from_utf8(certificate) else {
        return Validity::invalid("certificate is not valid UTF-8 PEM");
    };
    let der = match parse_pem(certificate_pem) {
        Ok(der) => der,
        Err(e) => return Validity::invalid(e.to_string()),
    };
    let info = match CertificateInfo::from_der(&der) {
        Ok(info) => info,
        Err(e) => return Validity::invalid(e.to_string()),
    };

    if let Err(e) = authority.validate(&der, now) {
        return Validity::invalid(e.to_string());
    }

    if !info.covers(expected_dns_name) {
        return Validity::invalid(format!(
            "subject mismatch: certificate does not cover '{}'",
            expected_dns_name
        ));
    }

    if let Err(reason) = key_matches(&der, private_key) {
        return Validity::invalid(reason);
    }

    match info.not_after_datetime() {
        Ok(not_after) => Validity::Valid { not_after },
        Err(e) => Validity::invalid(e.to_string()),
    }
}

fn key_matches(certificate_der: &[u8], private_key: &[u8]) -> Result<(), String> {
    let key_pem = std::str::from_utf8(private_key)
        .map_err(|_| "private key is not valid UTF-8 PEM".to_string())?;
    let key = KeyPair::from_pem(key_pem).map_err(|e| format!("invalid private key: {}", e))?;

    let (_, cert) = X509Certificate::from_der(certificate_der)
        .map_err(|e| format!("failed to parse certificate: {}", e))?;

    if cert.public_key().subject_public_key.data.as_ref() != key.der_bytes() {
        return Err("private key does not match certificate".to_string());
    }
    Ok(())
}
