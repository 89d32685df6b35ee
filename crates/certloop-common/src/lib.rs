//! Common types for certloop: errors, telemetry, metrics and shared constants

#![deny(missing_docs)]

pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace for the operator and the Secrets it manages
pub const CERTLOOP_SYSTEM_NAMESPACE: &str = "certloop-system";

/// Default name of the reserved serving certificate Secret
///
/// An update to this Secret restarts the operator pods so they reload
/// the new certificate.
pub const DEFAULT_TLS_SECRET_NAME: &str = "certloop-tls";

/// Default name of the Secret holding the certificate authority
pub const DEFAULT_CA_SECRET_NAME: &str = "certloop-ca";

/// Default Service name the serving certificate is issued for
pub const DEFAULT_SERVICE_NAME: &str = "certloop-webhook-service";

/// Secret data key holding the PEM-encoded leaf certificate
pub const CERTIFICATE_KEY: &str = "tls.crt";

/// Secret data key holding the PEM-encoded private key
pub const PRIVATE_KEY_KEY: &str = "tls.key";

/// Secret data key holding the PEM-encoded CA certificate
pub const CA_CERTIFICATE_KEY: &str = "ca.crt";

/// Secret data key holding the PEM-encoded CA private key
pub const CA_PRIVATE_KEY_KEY: &str = "ca.key";

/// Label marking Secrets whose certificate is kept current by the controller
pub const TLS_LABEL_KEY: &str = "certloop.dev/tls";

/// Label selector matching managed certificate Secrets
pub const TLS_LABEL_SELECTOR: &str = "certloop.dev/tls=true";

/// Standard managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Managed-by label value for resources created by certloop
pub const LABEL_MANAGED_BY_CERTLOOP: &str = "certloop";

/// Requeue delay after a failed reconciliation
pub const REQUEUE_ERROR_SECS: u64 = 30;
