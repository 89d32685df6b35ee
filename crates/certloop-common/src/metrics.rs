//! OpenTelemetry metrics for certificate rotation
//!
//! Instruments are created lazily against the global meter, so recording is
//! a no-op until telemetry installs a meter provider.

use once_cell::sync::Lazy;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

static METER: Lazy<Meter> = Lazy::new(|| global::meter("certloop"));

/// Counter of rotation decisions
///
/// Labels:
/// - `decision`: issue, keep, invalidate
pub static ROTATION_DECISIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("certloop_rotation_decisions_total")
        .with_description("Total number of rotation decisions by kind")
        .with_unit("{decisions}")
        .build()
});

/// Counter of record writes
///
/// Labels:
/// - `outcome`: created, updated, unchanged
pub static RECORD_WRITES: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("certloop_record_writes_total")
        .with_description("Total number of certificate record writes by outcome")
        .with_unit("{writes}")
        .build()
});

/// Counter of pod terminations issued by restart orchestration
///
/// Labels:
/// - `role`: sibling, self
/// - `result`: success, error
pub static POD_TERMINATIONS: Lazy<Counter<u64>> = Lazy::new(|| {
    METER
        .u64_counter("certloop_pod_terminations_total")
        .with_description("Total number of pod terminations after certificate rotation")
        .with_unit("{pods}")
        .build()
});

/// Histogram of reconciliation pass duration
///
/// Labels:
/// - `result`: success, error
pub static RECONCILE_DURATION: Lazy<Histogram<f64>> = Lazy::new(|| {
    METER
        .f64_histogram("certloop_reconcile_duration_seconds")
        .with_description("Duration of certificate reconciliation passes in seconds")
        .with_unit("s")
        .build()
});

/// Record a rotation decision
pub fn record_decision(decision: &'static str) {
    ROTATION_DECISIONS.add(1, &[KeyValue::new("decision", decision)]);
}

/// Record the outcome of a record write
pub fn record_write(outcome: &'static str) {
    RECORD_WRITES.add(1, &[KeyValue::new("outcome", outcome)]);
}

/// Record a pod termination attempt
pub fn record_termination(role: &'static str, success: bool) {
    POD_TERMINATIONS.add(
        1,
        &[
            KeyValue::new("role", role),
            KeyValue::new("result", if success { "success" } else { "error" }),
        ],
    );
}

/// Timer for a reconciliation pass
pub struct ReconcileTimer {
    start: std::time::Instant,
}

impl ReconcileTimer {
    /// Start timing a pass
    pub fn start() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }

    /// Complete the pass successfully
    pub fn success(self) {
        self.finish("success");
    }

    /// Complete the pass with an error
    pub fn error(self) {
        self.finish("error");
    }

    fn finish(self, result: &'static str) {
        RECONCILE_DURATION.record(
            self.start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", result)],
        );
    }
}
