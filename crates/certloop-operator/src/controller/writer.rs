//! Record writer
//!
//! Create-or-update of the two managed fields of a certificate Secret. Every
//! other key and annotation on an existing Secret is left untouched, and the
//! outcome tells the caller whether content actually changed. Secrets that
//! predate the controller also get the watch label so later passes see them.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::debug;

use certloop_common::metrics::record_write;
use certloop_common::{
    Error, CERTIFICATE_KEY, LABEL_MANAGED_BY, LABEL_MANAGED_BY_CERTLOOP, PRIVATE_KEY_KEY,
    TLS_LABEL_KEY,
};

use crate::store::{RecordId, SecretStore};

/// Desired state of the managed fields
#[derive(Clone, PartialEq, Eq)]
pub enum ManagedFields {
    /// Both fields set together
    Pair {
        /// PEM-encoded certificate
        certificate: Vec<u8>,
        /// PEM-encoded private key
        private_key: Vec<u8>,
    },
    /// Both fields removed
    Cleared,
}

impl std::fmt::Debug for ManagedFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pair { certificate, .. } => f
                .debug_struct("Pair")
                .field("certificate_len", &certificate.len())
                .field("private_key", &"<redacted>")
                .finish(),
            Self::Cleared => f.write_str("Cleared"),
        }
    }
}

/// Result of a create-or-update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The record did not exist and was created
    Created,
    /// The record existed and its managed fields changed
    Updated,
    /// Nothing was written
    Unchanged,
}

impl WriteOutcome {
    /// Metric / log label for this outcome
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Unchanged => "unchanged",
        }
    }

    /// Outcome of two consecutive writes to the same record
    pub fn then(self, next: Self) -> Self {
        match (self, next) {
            (Self::Updated, _) | (_, Self::Updated) => Self::Updated,
            (Self::Created, _) | (_, Self::Created) => Self::Created,
            _ => Self::Unchanged,
        }
    }
}

/// Writes managed fields through a [`SecretStore`]
pub struct RecordWriter {
    store: Arc<dyn SecretStore>,
}

impl RecordWriter {
    /// Create a writer over `store`
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Bring the managed fields of `id` to `desired`
    pub async fn write(
        &self,
        id: &RecordId,
        desired: &ManagedFields,
    ) -> Result<WriteOutcome, Error> {
        let existing = self
            .store
            .get(id)
            .await
            .map_err(|e| Error::write(id.to_string(), e.to_string()))?;

        let outcome = match existing {
            None if *desired == ManagedFields::Cleared => WriteOutcome::Unchanged,
            None => {
                self.store.create(&new_secret(id, desired)).await?;
                WriteOutcome::Created
            }
            Some(current) => {
                let mut updated = current.clone();
                apply(&mut updated, desired);
                let labelled = ensure_watch_label(&mut updated);
                if same_data(&updated, &current) {
                    if labelled {
                        debug!(secret = %id, "labelling record for watch");
                        self.store.replace(&updated).await?;
                    }
                    WriteOutcome::Unchanged
                } else {
                    self.store.replace(&updated).await?;
                    WriteOutcome::Updated
                }
            }
        };

        debug!(secret = %id, outcome = outcome.as_str(), "record written");
        record_write(outcome.as_str());
        Ok(outcome)
    }
}

fn apply(secret: &mut Secret, desired: &ManagedFields) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    match desired {
        ManagedFields::Pair {
            certificate,
            private_key,
        } => {
            data.insert(CERTIFICATE_KEY.to_string(), ByteString(certificate.clone()));
            data.insert(PRIVATE_KEY_KEY.to_string(), ByteString(private_key.clone()));
        }
        ManagedFields::Cleared => {
            data.remove(CERTIFICATE_KEY);
            data.remove(PRIVATE_KEY_KEY);
        }
    }
}

/// Set the watch label, returning whether it was missing
fn ensure_watch_label(secret: &mut Secret) -> bool {
    let labels = secret.metadata.labels.get_or_insert_with(BTreeMap::new);
    if labels.get(TLS_LABEL_KEY).map(String::as_str) == Some("true") {
        return false;
    }
    labels.insert(TLS_LABEL_KEY.to_string(), "true".to_string());
    true
}

/// Absent data and an empty map are the same content
fn same_data(a: &Secret, b: &Secret) -> bool {
    let empty = BTreeMap::new();
    a.data.as_ref().unwrap_or(&empty) == b.data.as_ref().unwrap_or(&empty)
}

fn new_secret(id: &RecordId, desired: &ManagedFields) -> Secret {
    let mut secret = Secret {
        metadata: ObjectMeta {
            name: Some(id.name.clone()),
            namespace: Some(id.namespace.clone()),
            labels: Some(BTreeMap::from([
                (TLS_LABEL_KEY.to_string(), "true".to_string()),
                (
                    LABEL_MANAGED_BY.to_string(),
                    LABEL_MANAGED_BY_CERTLOOP.to_string(),
                ),
            ])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    };
    apply(&mut secret, desired);
    secret
}
