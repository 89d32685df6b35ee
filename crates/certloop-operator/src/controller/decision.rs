//! Rotation decisions
//!
//! Maps the classification of a stored pair onto what the pass must do and
//! how long it may wait before the next one.

use std::time::Duration;

use certloop_pki::Validity;
use time::OffsetDateTime;

/// Longest a record is left alone between passes
pub const MAX_REQUEUE: Duration = Duration::from_secs(365 * 24 * 3600);

/// What a reconciliation pass does with a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationDecision {
    /// Populate the record with a fresh pair
    Issue {
        /// Why a pair is being issued
        reason: String,
    },
    /// Leave the stored pair in place
    Keep {
        /// Time until the stored certificate expires
        remaining_lifetime: Duration,
    },
    /// Clear the stored pair, then issue a replacement
    Invalidate {
        /// Why the stored pair was rejected
        reason: String,
    },
}

impl RotationDecision {
    /// Metric / log label for this decision
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issue { .. } => "issue",
            Self::Keep { .. } => "keep",
            Self::Invalidate { .. } => "invalidate",
        }
    }

    /// Delay until the next pass once this decision has been applied
    ///
    /// A newly issued pair lives for `lifetime`; a kept pair for whatever
    /// remains of its own.
    pub fn requeue_after(&self, lifetime: Duration) -> Duration {
        let delay = match self {
            Self::Keep { remaining_lifetime } => *remaining_lifetime,
            Self::Issue { .. } | Self::Invalidate { .. } => lifetime,
        };
        delay.min(MAX_REQUEUE)
    }
}

/// Decide what to do with a record classified as `validity` at `now`
pub fn decide(validity: &Validity, now: OffsetDateTime) -> RotationDecision {
    match validity {
        Validity::Absent => RotationDecision::Issue {
            reason: "certificate or private key missing".to_string(),
        },
        Validity::Invalid { reason } => RotationDecision::Invalidate {
            reason: reason.clone(),
        },
        Validity::Valid { not_after } => RotationDecision::Keep {
            remaining_lifetime: Duration::try_from(*not_after - now).unwrap_or(Duration::ZERO),
        },
    }
}

/// Expiry requested for a pair issued at `now`
pub fn issuance_deadline(now: OffsetDateTime, lifetime: Duration) -> OffsetDateTime {
    now + lifetime
}
