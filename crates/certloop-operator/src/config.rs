//! Operator configuration
//!
//! Flags are parsed once at startup and resolved into a [`ReconcilerConfig`]
//! that is handed to the controller context. Nothing below this module reads
//! the process environment.

use std::time::Duration;

use clap::Args;

use certloop_common::{
    Error, CERTLOOP_SYSTEM_NAMESPACE, DEFAULT_CA_SECRET_NAME, DEFAULT_SERVICE_NAME,
    DEFAULT_TLS_SECRET_NAME,
};

/// Default lifetime of an issued serving certificate (6 x 30 days)
pub const DEFAULT_CERTIFICATE_LIFETIME_HOURS: u64 = 6 * 30 * 24;

/// Command line / environment configuration for the controller
#[derive(Args, Debug, Clone)]
pub struct OperatorArgs {
    /// Namespace the operator runs in and manages Secrets in
    #[arg(long, env = "POD_NAMESPACE", default_value = CERTLOOP_SYSTEM_NAMESPACE)]
    pub namespace: String,

    /// Name of the pod running this process (falls back to HOSTNAME)
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Reserved Secret holding the operator's own serving certificate
    #[arg(long, env = "CERTLOOP_TLS_SECRET", default_value = DEFAULT_TLS_SECRET_NAME)]
    pub tls_secret: String,

    /// Secret holding the certificate authority (ca.crt / ca.key)
    #[arg(long, env = "CERTLOOP_CA_SECRET", default_value = DEFAULT_CA_SECRET_NAME)]
    pub ca_secret: String,

    /// Service the serving certificate is issued for
    #[arg(long, env = "CERTLOOP_SERVICE_NAME", default_value = DEFAULT_SERVICE_NAME)]
    pub service_name: String,

    /// Lifetime of newly issued certificates, in hours
    #[arg(
        long,
        env = "CERTLOOP_CERT_LIFETIME_HOURS",
        default_value_t = DEFAULT_CERTIFICATE_LIFETIME_HOURS
    )]
    pub certificate_lifetime_hours: u64,
}

/// The pod executing reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceIdentity {
    /// Namespace of the pod
    pub namespace: String,
    /// Name of the pod
    pub pod_name: String,
}

/// Validated configuration consumed by the reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Namespace holding the managed Secrets
    pub namespace: String,
    /// Name of the reserved serving certificate Secret
    pub tls_secret: String,
    /// Name of the CA Secret
    pub ca_secret: String,
    /// DNS name issued certificates are bound to
    pub dns_name: String,
    /// Lifetime requested for newly issued certificates
    pub certificate_lifetime: Duration,
    /// Self pod, None when running outside the cluster
    pub identity: Option<InstanceIdentity>,
}

impl ReconcilerConfig {
    /// Whether `namespace/name` is the reserved serving certificate record
    pub fn is_reserved(&self, namespace: &str, name: &str) -> bool {
        namespace == self.namespace && name == self.tls_secret
    }
}

impl OperatorArgs {
    /// Validate the flags into a [`ReconcilerConfig`]
    ///
    /// `hostname` is used as the pod name when `--pod-name` is unset.
    pub fn resolve(self, hostname: Option<String>) -> Result<ReconcilerConfig, Error> {
        if self.namespace.is_empty() {
            return Err(Error::config("namespace must not be empty"));
        }
        if self.tls_secret.is_empty() || self.ca_secret.is_empty() {
            return Err(Error::config("secret names must not be empty"));
        }
        if self.service_name.is_empty() {
            return Err(Error::config("service name must not be empty"));
        }
        if self.certificate_lifetime_hours == 0 {
            return Err(Error::config("certificate lifetime must be positive"));
        }

        let identity = self
            .pod_name
            .or(hostname)
            .filter(|name| !name.is_empty())
            .map(|pod_name| InstanceIdentity {
                namespace: self.namespace.clone(),
                pod_name,
            });

        Ok(ReconcilerConfig {
            dns_name: service_dns_name(&self.service_name, &self.namespace),
            namespace: self.namespace,
            tls_secret: self.tls_secret,
            ca_secret: self.ca_secret,
            certificate_lifetime: Duration::from_secs(self.certificate_lifetime_hours * 3600),
            identity,
        })
    }
}

/// In-cluster DNS name of a Service
pub fn service_dns_name(service: &str, namespace: &str) -> String {
    format!("{}.{}.svc", service, namespace)
}
