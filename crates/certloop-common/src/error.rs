//! Error types for the certloop operator
//!
//! Errors carry the record or pod they concern so a failed pass can be
//! traced back to a single Secret in the logs. Certificate parse and
//! validation failures are deliberately absent here: the reconciler recovers
//! from those by reissuing, so they never surface as an `Error`.

use thiserror::Error;

/// Main error type for certloop operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error not attributed to a specific step
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The certificate record could not be read
    #[error("failed to fetch record {record}: {message}")]
    Fetch {
        /// `namespace/name` of the record
        record: String,
        /// Description of what failed
        message: String,
    },

    /// The certificate authority could not be resolved
    #[error("certificate authority unavailable: {message}")]
    Authority {
        /// Description of what failed
        message: String,
    },

    /// The certificate authority failed to issue a leaf certificate
    #[error("failed to issue certificate for {record}: {message}")]
    Issuance {
        /// `namespace/name` of the record being populated
        record: String,
        /// Description of what failed
        message: String,
    },

    /// Writing the record back to the store failed
    #[error("failed to write record {record}: {message}")]
    Write {
        /// `namespace/name` of the record
        record: String,
        /// Description of what failed
        message: String,
    },

    /// Terminating a pod during restart orchestration failed
    #[error("failed to restart pod {pod}: {message}")]
    Restart {
        /// `namespace/name` of the pod
        pod: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid operator configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g., "writer", "runner")
        context: String,
    },
}

impl Error {
    /// Create a fetch error for the given record
    pub fn fetch(record: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Fetch {
            record: record.into(),
            message: msg.into(),
        }
    }

    /// Create an authority resolution error
    pub fn authority(msg: impl Into<String>) -> Self {
        Self::Authority {
            message: msg.into(),
        }
    }

    /// Create an issuance error for the given record
    pub fn issuance(record: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Issuance {
            record: record.into(),
            message: msg.into(),
        }
    }

    /// Create a write error for the given record
    pub fn write(record: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Write {
            record: record.into(),
            message: msg.into(),
        }
    }

    /// Create a restart error for the given pod
    pub fn restart(pod: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Restart {
            pod: pod.into(),
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether retrying the same pass can succeed without operator intervention
    ///
    /// Configuration errors need a redeploy; everything else is a transient
    /// store or authority condition.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config { .. })
    }
}
