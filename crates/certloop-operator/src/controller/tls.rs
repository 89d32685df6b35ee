//! Serving certificate reconciler
//!
//! One pass reads a certificate Secret, classifies the stored pair, decides
//! whether to keep, issue or invalidate, writes the result, restarts the
//! operator pods when the reserved Secret changed, and asks to be requeued
//! when the certificate will next need attention.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use certloop_common::metrics::{record_decision, ReconcileTimer};
use certloop_common::{Error, CERTIFICATE_KEY, PRIVATE_KEY_KEY, REQUEUE_ERROR_SECS};
use certloop_pki::{evaluate, CertOptions, CertificateAuthority, RecordFields};

use super::decision::{decide, issuance_deadline, RotationDecision};
use super::restart::{KubePodClient, PodClient, RestartOrchestrator, RestartReport};
use super::writer::{ManagedFields, RecordWriter, WriteOutcome};
use crate::authority::{AuthorityResolver, SecretAuthorityResolver};
use crate::config::ReconcilerConfig;
use crate::store::{KubeSecretStore, RecordId, SecretStore};

/// Shared context for the certificate controller
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```text
/// let ctx = Context::builder(client, config).build();
/// ```
pub struct Context {
    /// Secret store the record is read from
    pub store: Arc<dyn SecretStore>,
    /// Resolves the certificate authority for each pass
    pub authorities: Arc<dyn AuthorityResolver>,
    /// Create-or-update of the managed fields
    pub writer: RecordWriter,
    /// Pod restarts after the reserved record changes
    pub restarter: RestartOrchestrator,
    /// Validated operator configuration
    pub config: ReconcilerConfig,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client, config: ReconcilerConfig) -> ContextBuilder {
        ContextBuilder::new(client, config)
    }

    /// Create a context for testing with mock collaborators
    #[cfg(test)]
    pub fn for_testing(
        store: Arc<dyn SecretStore>,
        authorities: Arc<dyn AuthorityResolver>,
        pods: Arc<dyn PodClient>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            writer: RecordWriter::new(store.clone()),
            restarter: RestartOrchestrator::new(pods, config.identity.clone()),
            store,
            authorities,
            config,
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    config: ReconcilerConfig,
    store: Option<Arc<dyn SecretStore>>,
    authorities: Option<Arc<dyn AuthorityResolver>>,
    pods: Option<Arc<dyn PodClient>>,
}

impl ContextBuilder {
    fn new(client: Client, config: ReconcilerConfig) -> Self {
        Self {
            client,
            config,
            store: None,
            authorities: None,
            pods: None,
        }
    }

    /// Override the Secret store
    pub fn secret_store(mut self, store: Arc<dyn SecretStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the authority resolver
    pub fn authority_resolver(mut self, authorities: Arc<dyn AuthorityResolver>) -> Self {
        self.authorities = Some(authorities);
        self
    }

    /// Override the pod client
    pub fn pod_client(mut self, pods: Arc<dyn PodClient>) -> Self {
        self.pods = Some(pods);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let store: Arc<dyn SecretStore> = self
            .store
            .unwrap_or_else(|| Arc::new(KubeSecretStore::new(self.client.clone())));
        let ca_secret = RecordId::new(&self.config.namespace, &self.config.ca_secret);
        let authorities = self
            .authorities
            .unwrap_or_else(|| Arc::new(SecretAuthorityResolver::new(store.clone(), ca_secret)));
        let pods = self
            .pods
            .unwrap_or_else(|| Arc::new(KubePodClient::new(self.client.clone())));

        Context {
            writer: RecordWriter::new(store.clone()),
            restarter: RestartOrchestrator::new(pods, self.config.identity.clone()),
            store,
            authorities,
            config: self.config,
        }
    }
}

/// What a single pass did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassOutcome {
    /// Decision taken for the stored pair
    pub decision: RotationDecision,
    /// Result of writing the record
    pub write: WriteOutcome,
    /// Restart report, `None` when restart was not warranted
    pub restart: Option<RestartReport>,
    /// Delay before the next pass
    pub requeue_after: Duration,
}

/// Reconcile a watched certificate Secret
#[instrument(skip(secret, ctx), fields(secret = %secret.name_any()))]
pub async fn reconcile(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();
    let id = RecordId::for_secret(&secret, &ctx.config.namespace);

    match reconcile_record(&id, &ctx).await {
        Ok(outcome) => {
            timer.success();
            info!(
                decision = outcome.decision.as_str(),
                write = outcome.write.as_str(),
                requeue_secs = outcome.requeue_after.as_secs(),
                "certificate reconciled"
            );
            Ok(Action::requeue(outcome.requeue_after))
        }
        Err(e) => {
            timer.error();
            Err(e)
        }
    }
}

/// Run one pass for the record `id`
pub async fn reconcile_record(id: &RecordId, ctx: &Context) -> Result<PassOutcome, Error> {
    let secret = ctx.store.get(id).await?;
    let authority = ctx.authorities.resolve().await?;
    let now = OffsetDateTime::now_utc();

    let data = secret.as_ref().and_then(|s| s.data.as_ref());
    let fields = RecordFields {
        certificate: data
            .and_then(|d| d.get(CERTIFICATE_KEY))
            .map(|b| b.0.as_slice()),
        private_key: data
            .and_then(|d| d.get(PRIVATE_KEY_KEY))
            .map(|b| b.0.as_slice()),
    };

    let validity = evaluate(&fields, authority.as_ref(), &ctx.config.dns_name, now);
    let decision = decide(&validity, now);
    record_decision(decision.as_str());

    let write = match &decision {
        RotationDecision::Keep { remaining_lifetime } => {
            info!(
                secret = %id,
                remaining_secs = remaining_lifetime.as_secs(),
                "certificate still valid"
            );
            let (Some(certificate), Some(private_key)) = (fields.certificate, fields.private_key)
            else {
                return Err(Error::internal_with_context(
                    "reconciler",
                    format!("record {} kept without a stored pair", id),
                ));
            };
            let retained = ManagedFields::Pair {
                certificate: certificate.to_vec(),
                private_key: private_key.to_vec(),
            };
            ctx.writer.write(id, &retained).await?
        }
        RotationDecision::Issue { reason } => {
            info!(secret = %id, %reason, "issuing certificate");
            issue_and_write(id, authority.as_ref(), ctx, now).await?
        }
        RotationDecision::Invalidate { reason } => {
            warn!(secret = %id, %reason, "stored certificate rejected, reissuing");
            let cleared = ctx.writer.write(id, &ManagedFields::Cleared).await?;
            cleared.then(issue_and_write(id, authority.as_ref(), ctx, now).await?)
        }
    };

    let restart = if write == WriteOutcome::Updated
        && ctx.config.is_reserved(&id.namespace, &id.name)
    {
        info!(secret = %id, "serving certificate rotated, restarting operator pods");
        Some(ctx.restarter.restart().await)
    } else {
        None
    };

    Ok(PassOutcome {
        requeue_after: decision.requeue_after(ctx.config.certificate_lifetime),
        decision,
        write,
        restart,
    })
}

async fn issue_and_write(
    id: &RecordId,
    authority: &dyn CertificateAuthority,
    ctx: &Context,
    now: OffsetDateTime,
) -> Result<WriteOutcome, Error> {
    let options = CertOptions::new(
        issuance_deadline(now, ctx.config.certificate_lifetime),
        ctx.config.dns_name.clone(),
    );
    let issued = authority
        .generate(&options)
        .map_err(|e| Error::issuance(id.to_string(), e.to_string()))?;

    ctx.writer
        .write(
            id,
            &ManagedFields::Pair {
                certificate: issued.certificate_pem.into_bytes(),
                private_key: issued.private_key_pem.into_bytes(),
            },
        )
        .await
}

/// Error policy for the certificate controller
pub fn error_policy(secret: Arc<Secret>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        secret = %secret.name_any(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use mockall::Sequence;

    use certloop_common::TLS_LABEL_KEY;
    use certloop_pki::{
        CertificateInfo, IssuedCertificate, LocalAuthority, PkiError, ValidationError, Validity,
    };

    use crate::authority::MockAuthorityResolver;
    use crate::config::InstanceIdentity;
    use crate::controller::restart::MockPodClient;
    use crate::store::MockSecretStore;

    const NS: &str = "certloop-system";
    const RESERVED: &str = "certloop-tls";
    const DNS: &str = "certloop-webhook-service.certloop-system.svc";
    const SELF_POD: &str = "certloop-operator-0";
    const LIFETIME: Duration = Duration::from_secs(4368 * 3600);

    type Records = Arc<Mutex<HashMap<RecordId, Secret>>>;
    type Writes = Arc<Mutex<Vec<String>>>;

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            namespace: NS.to_string(),
            tls_secret: RESERVED.to_string(),
            ca_secret: "certloop-ca".to_string(),
            dns_name: DNS.to_string(),
            certificate_lifetime: LIFETIME,
            identity: Some(InstanceIdentity {
                namespace: NS.to_string(),
                pod_name: SELF_POD.to_string(),
            }),
        }
    }

    /// In-memory Secret store recording every create and replace
    fn memory_store(records: Records, writes: Writes) -> MockSecretStore {
        let mut store = MockSecretStore::new();

        let r = records.clone();
        store
            .expect_get()
            .returning(move |id| Ok(r.lock().unwrap().get(id).cloned()));

        let (r, w) = (records.clone(), writes.clone());
        store.expect_create().returning(move |secret| {
            let id = RecordId::for_secret(secret, NS);
            w.lock().unwrap().push(format!("create {}", id));
            r.lock().unwrap().insert(id, secret.clone());
            Ok(())
        });

        let (r, w) = (records, writes);
        store.expect_replace().returning(move |secret| {
            let id = RecordId::for_secret(secret, NS);
            w.lock().unwrap().push(format!("replace {}", id));
            r.lock().unwrap().insert(id, secret.clone());
            Ok(())
        });

        store
    }

    fn resolver_for(ca: Arc<dyn CertificateAuthority>) -> MockAuthorityResolver {
        let mut resolver = MockAuthorityResolver::new();
        resolver
            .expect_resolve()
            .returning(move || Ok(Arc::clone(&ca)));
        resolver
    }

    fn record(name: &str, issued: &IssuedCertificate) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                labels: Some(BTreeMap::from([(
                    TLS_LABEL_KEY.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (
                    CERTIFICATE_KEY.to_string(),
                    ByteString(issued.certificate_pem.clone().into_bytes()),
                ),
                (
                    PRIVATE_KEY_KEY.to_string(),
                    ByteString(issued.private_key_pem.clone().into_bytes()),
                ),
            ])),
            ..Default::default()
        }
    }

    fn issue(ca: &LocalAuthority, lifetime: time::Duration) -> IssuedCertificate {
        ca.generate(&CertOptions::new(OffsetDateTime::now_utc() + lifetime, DNS))
            .unwrap()
    }

    fn stored_fields(records: &Records, id: &RecordId) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        let guard = records.lock().unwrap();
        let data = guard.get(id).and_then(|s| s.data.clone()).unwrap_or_default();
        (
            data.get(CERTIFICATE_KEY).map(|b| b.0.clone()),
            data.get(PRIVATE_KEY_KEY).map(|b| b.0.clone()),
        )
    }

    fn labelled_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NS.to_string()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "certloop-operator".to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct BrokenAuthority;

    impl CertificateAuthority for BrokenAuthority {
        fn generate(&self, _options: &CertOptions) -> certloop_pki::Result<IssuedCertificate> {
            Err(PkiError::KeyGenerationFailed("hsm unavailable".to_string()))
        }

        fn validate(
            &self,
            _certificate_der: &[u8],
            _at: OffsetDateTime,
        ) -> Result<(), ValidationError> {
            Err(ValidationError::Other("hsm unavailable".to_string()))
        }
    }

    /// Story: first bootstrap creates the reserved Secret without restarting
    /// anything, and an immediate second pass leaves it alone
    #[tokio::test]
    async fn story_bootstrap_creates_record_then_settles() {
        let records = Records::default();
        let writes = Writes::default();
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let ctx = Context::for_testing(
            Arc::new(memory_store(records.clone(), writes.clone())),
            Arc::new(resolver_for(ca.clone())),
            Arc::new(MockPodClient::new()),
            config(),
        );
        let id = RecordId::new(NS, RESERVED);

        let first = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(first.decision.as_str(), "issue");
        assert_eq!(first.write, WriteOutcome::Created);
        assert_eq!(first.restart, None);
        assert_eq!(first.requeue_after, LIFETIME);

        // The stored pair is a matching certificate and key that validate
        let (cert, key) = stored_fields(&records, &id);
        let fields = RecordFields {
            certificate: cert.as_deref(),
            private_key: key.as_deref(),
        };
        let now = OffsetDateTime::now_utc();
        assert!(matches!(
            evaluate(&fields, ca.as_ref(), DNS, now),
            Validity::Valid { .. }
        ));

        // Issued lifetime matches the requeue delay within clock tolerance
        let pem = String::from_utf8(cert.unwrap()).unwrap();
        let info = CertificateInfo::from_pem(&pem).unwrap();
        let lifetime = info.not_after - now.unix_timestamp();
        assert!((lifetime - LIFETIME.as_secs() as i64).abs() <= 5);

        let second = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(second.decision.as_str(), "keep");
        assert_eq!(second.write, WriteOutcome::Unchanged);
        assert_eq!(second.restart, None);

        let third = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(third.decision.as_str(), "keep");
        assert_eq!(
            *writes.lock().unwrap(),
            vec!["create certloop-system/certloop-tls".to_string()]
        );
    }

    #[tokio::test]
    async fn valid_certificate_is_kept_until_expiry() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let id = RecordId::new(NS, RESERVED);
        let held = record(RESERVED, &issue(&ca, time::Duration::hours(1)));

        let mut store = MockSecretStore::new();
        store.expect_get().returning(move |_| Ok(Some(held.clone())));
        store.expect_create().never();
        store.expect_replace().never();

        let ctx = Context::for_testing(
            Arc::new(store),
            Arc::new(resolver_for(ca)),
            Arc::new(MockPodClient::new()),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(outcome.decision.as_str(), "keep");
        assert_eq!(outcome.write, WriteOutcome::Unchanged);
        assert_eq!(outcome.restart, None);
        let secs = outcome.requeue_after.as_secs();
        assert!((3590..=3600).contains(&secs), "requeue after {secs}s");
    }

    /// Story: the reserved Secret holds an expired certificate while two
    /// operator pods run; the pass rotates it and restarts the sibling
    /// before itself
    #[tokio::test]
    async fn story_expired_reserved_certificate_restarts_sibling_then_self() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let id = RecordId::new(NS, RESERVED);
        let expired = issue(&ca, -time::Duration::hours(1));
        let records = Records::default();
        records
            .lock()
            .unwrap()
            .insert(id.clone(), record(RESERVED, &expired));
        let writes = Writes::default();

        let mut pods = MockPodClient::new();
        let mut seq = Sequence::new();
        pods.expect_get_pod()
            .withf(|ns, name| ns == NS && name == SELF_POD)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name| Ok(Some(labelled_pod(name))));
        pods.expect_list_pods()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(vec![
                    labelled_pod(SELF_POD),
                    labelled_pod("certloop-operator-1"),
                ])
            });
        pods.expect_delete_pod()
            .withf(|_, name| name == "certloop-operator-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        pods.expect_delete_pod()
            .withf(|_, name| name == SELF_POD)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let ctx = Context::for_testing(
            Arc::new(memory_store(records.clone(), writes.clone())),
            Arc::new(resolver_for(ca.clone())),
            Arc::new(pods),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(outcome.decision.as_str(), "invalidate");
        assert_eq!(outcome.write, WriteOutcome::Updated);
        assert_eq!(outcome.requeue_after, LIFETIME);
        assert_eq!(
            outcome.restart,
            Some(RestartReport::Completed {
                terminated: vec!["certloop-operator-1".to_string(), SELF_POD.to_string()],
                failed: vec![],
            })
        );

        // Cleared first, then repopulated
        assert_eq!(writes.lock().unwrap().len(), 2);
        let (cert, key) = stored_fields(&records, &id);
        assert_ne!(cert.as_deref(), Some(expired.certificate_pem.as_bytes()));
        let fields = RecordFields {
            certificate: cert.as_deref(),
            private_key: key.as_deref(),
        };
        assert!(matches!(
            evaluate(&fields, ca.as_ref(), DNS, OffsetDateTime::now_utc()),
            Validity::Valid { .. }
        ));
    }

    #[tokio::test]
    async fn updating_another_record_never_restarts() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let id = RecordId::new(NS, "tenant-tls");
        let records = Records::default();
        records.lock().unwrap().insert(
            id.clone(),
            record("tenant-tls", &issue(&ca, -time::Duration::hours(1))),
        );

        let mut pods = MockPodClient::new();
        pods.expect_get_pod().never();
        pods.expect_list_pods().never();
        pods.expect_delete_pod().never();

        let ctx = Context::for_testing(
            Arc::new(memory_store(records, Writes::default())),
            Arc::new(resolver_for(ca)),
            Arc::new(pods),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(outcome.write, WriteOutcome::Updated);
        assert_eq!(outcome.restart, None);
    }

    #[tokio::test]
    async fn certificate_from_previous_authority_is_replaced() {
        let old_ca = LocalAuthority::new("old CA").unwrap();
        let new_ca = Arc::new(LocalAuthority::new("new CA").unwrap());
        let id = RecordId::new(NS, "tenant-tls");
        let records = Records::default();
        records.lock().unwrap().insert(
            id.clone(),
            record("tenant-tls", &issue(&old_ca, time::Duration::days(30))),
        );

        let ctx = Context::for_testing(
            Arc::new(memory_store(records, Writes::default())),
            Arc::new(resolver_for(new_ca)),
            Arc::new(MockPodClient::new()),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        match outcome.decision {
            RotationDecision::Invalidate { reason } => assert!(reason.contains("chain mismatch")),
            other => panic!("Expected Invalidate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn record_holding_only_a_certificate_gets_a_full_pair() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let id = RecordId::new(NS, "tenant-tls");
        let mut partial = record("tenant-tls", &issue(&ca, time::Duration::days(30)));
        if let Some(data) = partial.data.as_mut() {
            data.remove(PRIVATE_KEY_KEY);
        }
        let records = Records::default();
        records.lock().unwrap().insert(id.clone(), partial);

        let ctx = Context::for_testing(
            Arc::new(memory_store(records.clone(), Writes::default())),
            Arc::new(resolver_for(ca.clone())),
            Arc::new(MockPodClient::new()),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(outcome.decision.as_str(), "issue");
        assert_eq!(outcome.write, WriteOutcome::Updated);
        assert_eq!(outcome.restart, None);

        let (cert, key) = stored_fields(&records, &id);
        let fields = RecordFields {
            certificate: cert.as_deref(),
            private_key: key.as_deref(),
        };
        assert!(matches!(
            evaluate(&fields, ca.as_ref(), DNS, OffsetDateTime::now_utc()),
            Validity::Valid { .. }
        ));
    }

    /// Story: a chart installed an empty, unlabelled reserved Secret before
    /// the operator started; the first pass fills it and labels it so the
    /// watch keeps requeueing it
    #[tokio::test]
    async fn story_preinstalled_reserved_secret_joins_the_watch() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let id = RecordId::new(NS, RESERVED);
        let records = Records::default();
        records.lock().unwrap().insert(
            id.clone(),
            Secret {
                metadata: ObjectMeta {
                    name: Some(RESERVED.to_string()),
                    namespace: Some(NS.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let writes = Writes::default();

        // Running out of cluster in this pass: self pod is not found
        let mut pods = MockPodClient::new();
        pods.expect_get_pod().returning(|_, _| Ok(None));
        pods.expect_delete_pod().never();

        let ctx = Context::for_testing(
            Arc::new(memory_store(records.clone(), writes.clone())),
            Arc::new(resolver_for(ca)),
            Arc::new(pods),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(outcome.write, WriteOutcome::Updated);
        assert_eq!(outcome.requeue_after, LIFETIME);
        assert!(matches!(outcome.restart, Some(RestartReport::Skipped { .. })));

        let labels = records
            .lock()
            .unwrap()
            .get(&id)
            .and_then(|s| s.metadata.labels.clone())
            .unwrap_or_default();
        assert_eq!(labels.get(TLS_LABEL_KEY).map(String::as_str), Some("true"));

        // Labelled and valid now, so the next pass writes nothing
        let second = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(second.write, WriteOutcome::Unchanged);
        assert_eq!(writes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unlabelled_valid_record_is_labelled_without_restart() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let id = RecordId::new(NS, RESERVED);
        let mut held = record(RESERVED, &issue(&ca, time::Duration::days(30)));
        held.metadata.labels = None;
        let records = Records::default();
        records.lock().unwrap().insert(id.clone(), held);
        let writes = Writes::default();

        let mut pods = MockPodClient::new();
        pods.expect_get_pod().never();
        pods.expect_delete_pod().never();

        let ctx = Context::for_testing(
            Arc::new(memory_store(records, writes.clone())),
            Arc::new(resolver_for(ca)),
            Arc::new(pods),
            config(),
        );

        let outcome = reconcile_record(&id, &ctx).await.unwrap();
        assert_eq!(outcome.decision.as_str(), "keep");
        assert_eq!(outcome.write, WriteOutcome::Unchanged);
        assert_eq!(outcome.restart, None);
        assert_eq!(
            *writes.lock().unwrap(),
            vec!["replace certloop-system/certloop-tls".to_string()]
        );
    }

    #[tokio::test]
    async fn issuance_failure_leaves_record_cleared_and_propagates() {
        let id = RecordId::new(NS, RESERVED);
        let records = Records::default();
        let mut garbage = Secret {
            metadata: ObjectMeta {
                name: Some(RESERVED.to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        garbage.data = Some(BTreeMap::from([
            (CERTIFICATE_KEY.to_string(), ByteString(b"garbage".to_vec())),
            (PRIVATE_KEY_KEY.to_string(), ByteString(b"garbage".to_vec())),
        ]));
        records.lock().unwrap().insert(id.clone(), garbage);

        let mut pods = MockPodClient::new();
        pods.expect_delete_pod().never();

        let ctx = Context::for_testing(
            Arc::new(memory_store(records.clone(), Writes::default())),
            Arc::new(resolver_for(Arc::new(BrokenAuthority))),
            Arc::new(pods),
            config(),
        );

        match reconcile_record(&id, &ctx).await {
            Err(Error::Issuance { record, .. }) => {
                assert_eq!(record, "certloop-system/certloop-tls")
            }
            other => panic!("Expected Issuance error, got {:?}", other),
        }
        assert_eq!(stored_fields(&records, &id), (None, None));
    }

    #[tokio::test]
    async fn unreadable_record_propagates_fetch_error() {
        let mut store = MockSecretStore::new();
        store
            .expect_get()
            .returning(|id| Err(Error::fetch(id.to_string(), "connection refused")));
        let mut resolver = MockAuthorityResolver::new();
        resolver.expect_resolve().never();

        let ctx = Context::for_testing(
            Arc::new(store),
            Arc::new(resolver),
            Arc::new(MockPodClient::new()),
            config(),
        );

        assert!(matches!(
            reconcile_record(&RecordId::new(NS, RESERVED), &ctx).await,
            Err(Error::Fetch { .. })
        ));
    }

    #[tokio::test]
    async fn missing_authority_propagates() {
        let mut store = MockSecretStore::new();
        store.expect_get().returning(|_| Ok(None));
        store.expect_create().never();
        let mut resolver = MockAuthorityResolver::new();
        resolver
            .expect_resolve()
            .returning(|| Err(Error::authority("secret certloop-system/certloop-ca not found")));

        let ctx = Context::for_testing(
            Arc::new(store),
            Arc::new(resolver),
            Arc::new(MockPodClient::new()),
            config(),
        );

        assert!(matches!(
            reconcile_record(&RecordId::new(NS, RESERVED), &ctx).await,
            Err(Error::Authority { .. })
        ));
    }

    #[tokio::test]
    async fn reconcile_requeues_after_outcome() {
        let ca = Arc::new(LocalAuthority::new("certloop CA").unwrap());
        let ctx = Arc::new(Context::for_testing(
            Arc::new(memory_store(Records::default(), Writes::default())),
            Arc::new(resolver_for(ca)),
            Arc::new(MockPodClient::new()),
            config(),
        ));
        let watched = Arc::new(Secret {
            metadata: ObjectMeta {
                name: Some("tenant-tls".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });

        let action = reconcile(watched, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(LIFETIME));
    }

    #[test]
    fn error_policy_requeues_retryable_errors() {
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MockSecretStore::new()),
            Arc::new(MockAuthorityResolver::new()),
            Arc::new(MockPodClient::new()),
            config(),
        ));
        let secret = Arc::new(Secret::default());

        let action = error_policy(
            secret.clone(),
            &Error::write("certloop-system/certloop-tls", "conflict"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(REQUEUE_ERROR_SECS)));

        let action = error_policy(secret, &Error::config("bad flags"), ctx);
        assert_eq!(action, Action::await_change());
    }
}
