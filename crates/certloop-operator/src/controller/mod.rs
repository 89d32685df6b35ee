//! Certificate controller
//!
//! The reconciler in [`tls`] drives one pass per watched Secret, built from
//! the rotation [`decision`], the record [`writer`] and pod [`restart`]
//! orchestration.

pub mod decision;
pub mod restart;
pub mod tls;
pub mod writer;

pub use decision::{decide, RotationDecision, MAX_REQUEUE};
pub use restart::{KubePodClient, PodClient, RestartOrchestrator, RestartReport};
pub use tls::{error_policy, reconcile, reconcile_record, Context, ContextBuilder, PassOutcome};
pub use writer::{ManagedFields, RecordWriter, WriteOutcome};
