//! Metrics instrumentation for route53-registrator.
//!
//! All metrics are prefixed with `r53_registrator.`

use metrics::{counter, histogram};
use std::time::Instant;

/// Record the outcome of a registry call attempt.
pub fn record_registry_call(operation: &'static str, outcome: &'static str) {
    counter!("r53_registrator.registry.call.count", "operation" => operation, "outcome" => outcome)
        .increment(1);
}

/// Record a container lifecycle event seen by the dispatch loop.
pub fn record_lifecycle_event(status: &'static str, matched: bool) {
    let matched = if matched { "true" } else { "false" };
    counter!("r53_registrator.event.count", "status" => status, "matched" => matched).increment(1);
}

/// Record a finished reconciliation.
pub fn record_reconcile(action: ReconcileAction, result: ReconcileResult, duration: std::time::Duration) {
    let action_str = match action {
        ReconcileAction::Register => "register",
        ReconcileAction::Deregister => "deregister",
    };
    let result_str = match result {
        ReconcileResult::Created => "created",
        ReconcileResult::Deleted => "deleted",
        ReconcileResult::Unchanged => "unchanged",
        ReconcileResult::Error => "error",
    };

    counter!("r53_registrator.reconcile.count", "action" => action_str, "result" => result_str)
        .increment(1);
    histogram!("r53_registrator.reconcile.duration.seconds", "action" => action_str)
        .record(duration.as_secs_f64());
}

/// Reconciliation direction.
#[derive(Debug, Clone, Copy)]
pub enum ReconcileAction {
    /// Container started.
    Register,
    /// Container stopped or died.
    Deregister,
}

/// Reconciliation result.
#[derive(Debug, Clone, Copy)]
pub enum ReconcileResult {
    /// A record was created.
    Created,
    /// A record was deleted.
    Deleted,
    /// The registry already matched.
    Unchanged,
    /// The reconciliation failed.
    Error,
}

/// Record a health check mutation.
pub fn record_health_check(action: HealthCheckAction) {
    let action_str = match action {
        HealthCheckAction::Created => "created",
        HealthCheckAction::Reused => "reused",
        HealthCheckAction::Deleted => "deleted",
        HealthCheckAction::Reaped => "reaped",
        HealthCheckAction::TagFailed => "tag_failed",
    };
    counter!("r53_registrator.health_check.count", "action" => action_str).increment(1);
}

/// Health check actions.
#[derive(Debug, Clone, Copy)]
pub enum HealthCheckAction {
    /// A new check was created.
    Created,
    /// An existing check was reused.
    Reused,
    /// A check was deleted on deregistration.
    Deleted,
    /// A stale check was deleted by the reaper.
    Reaped,
    /// The owner tag could not be applied to a created check.
    TagFailed,
}

/// Record a probe that matched more than one registry entry.
pub fn record_ambiguous_match(kind: &'static str) {
    counter!("r53_registrator.ambiguous_match.count", "kind" => kind).increment(1);
}

/// Record a reconnect of the container event stream.
pub fn record_event_stream_reconnect() {
    counter!("r53_registrator.event_stream.reconnect.count").increment(1);
}

/// Helper for timing operations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer.
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration since timer start.
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
