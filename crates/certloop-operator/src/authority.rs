//! Certificate authority resolution
//!
//! The authority is resolved afresh on every pass: its key material lives in
//! a Secret that may be rotated independently of this controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

#[cfg(test)]
use mockall::automock;

use certloop_common::{
    Error, CA_CERTIFICATE_KEY, CA_PRIVATE_KEY_KEY, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CERTLOOP,
};
use certloop_pki::{CertificateAuthority, LocalAuthority};

use crate::store::{RecordId, SecretStore};

/// Resolves the certificate authority used for a pass
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AuthorityResolver: Send + Sync {
    /// Load the current authority
    async fn resolve(&self) -> Result<Arc<dyn CertificateAuthority>, Error>;
}

/// Resolves the authority from a Secret holding `ca.crt` and `ca.key`
pub struct SecretAuthorityResolver {
    store: Arc<dyn SecretStore>,
    secret: RecordId,
}

impl SecretAuthorityResolver {
    /// Resolve from the CA Secret `secret` through `store`
    pub fn new(store: Arc<dyn SecretStore>, secret: RecordId) -> Self {
        Self { store, secret }
    }
}

#[async_trait]
impl AuthorityResolver for SecretAuthorityResolver {
    async fn resolve(&self) -> Result<Arc<dyn CertificateAuthority>, Error> {
        let secret = self
            .store
            .get(&self.secret)
            .await
            .map_err(|e| Error::authority(e.to_string()))?
            .ok_or_else(|| Error::authority(format!("secret {} not found", self.secret)))?;

        let data = secret.data.unwrap_or_default();
        let cert_pem = pem_field(&data, CA_CERTIFICATE_KEY, &self.secret)?;
        let key_pem = pem_field(&data, CA_PRIVATE_KEY_KEY, &self.secret)?;

        let authority = LocalAuthority::from_pem(cert_pem, key_pem)
            .map_err(|e| Error::authority(format!("secret {}: {}", self.secret, e)))?;
        Ok(Arc::new(authority))
    }
}

fn pem_field<'a>(
    data: &'a BTreeMap<String, ByteString>,
    key: &str,
    secret: &RecordId,
) -> Result<&'a str, Error> {
    let bytes = data
        .get(key)
        .ok_or_else(|| Error::authority(format!("secret {} missing key {}", secret, key)))?;
    std::str::from_utf8(&bytes.0)
        .map_err(|_| Error::authority(format!("secret {} key {} is not UTF-8", secret, key)))
}

/// Build a CA Secret holding a freshly generated self-signed authority
pub fn generate_ca_secret(id: &RecordId, common_name: &str) -> Result<Secret, Error> {
    let authority = LocalAuthority::new(common_name)
        .map_err(|e| Error::authority(format!("failed to generate CA: {}", e)))?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                LABEL_MANAGED_BY_CERTLOOP.to_string(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([
            (
                CA_CERTIFICATE_KEY.to_string(),
                ByteString(authority.ca_cert_pem().as_bytes().to_vec()),
            ),
            (
                CA_PRIVATE_KEY_KEY.to_string(),
                ByteString(authority.ca_key_pem().as_bytes().to_vec()),
            ),
        ])),
        ..Default::default()
    })
}
