//! Secret storage seam
//!
//! The reconciler only ever reads, creates and replaces individual Secrets.
//! [`SecretStore`] abstracts those calls so passes can be tested without a
//! cluster.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use certloop_common::Error;

/// Identity of a certificate record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordId {
    /// Namespace of the Secret
    pub namespace: String,
    /// Name of the Secret
    pub name: String,
}

impl RecordId {
    /// Identity for `namespace/name`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Identity of a watched Secret, defaulting the namespace when unset
    pub fn for_secret(secret: &Secret, default_namespace: &str) -> Self {
        Self {
            namespace: secret
                .namespace()
                .unwrap_or_else(|| default_namespace.to_string()),
            name: secret.name_any(),
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Trait abstracting Secret reads and writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fetch a Secret, `None` if it does not exist
    async fn get(&self, id: &RecordId) -> Result<Option<Secret>, Error>;

    /// Create a new Secret
    async fn create(&self, secret: &Secret) -> Result<(), Error>;

    /// Replace an existing Secret
    ///
    /// The object carries the `resourceVersion` it was read at, so a
    /// concurrent modification fails with a conflict.
    async fn replace(&self, secret: &Secret) -> Result<(), Error>;
}

/// Real Kubernetes implementation of [`SecretStore`]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    /// Create a store backed by the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, id: &RecordId) -> Result<Option<Secret>, Error> {
        match self.api(&id.namespace).get(&id.name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(Error::fetch(id.to_string(), e.to_string())),
        }
    }

    async fn create(&self, secret: &Secret) -> Result<(), Error> {
        let id = record_id_of(secret)?;
        self.api(&id.namespace)
            .create(&PostParams::default(), secret)
            .await
            .map_err(|e| Error::write(id.to_string(), e.to_string()))?;
        Ok(())
    }

    async fn replace(&self, secret: &Secret) -> Result<(), Error> {
        let id = record_id_of(secret)?;
        self.api(&id.namespace)
            .replace(&id.name, &PostParams::default(), secret)
            .await
            .map_err(|e| Error::write(id.to_string(), e.to_string()))?;
        Ok(())
    }
}

fn record_id_of(secret: &Secret) -> Result<RecordId, Error> {
    match (secret.metadata.namespace.as_deref(), secret.metadata.name.as_deref()) {
        (Some(namespace), Some(name)) => Ok(RecordId::new(namespace, name)),
        _ => Err(Error::internal_with_context(
            "store",
            "secret is missing namespace or name",
        )),
    }
}
