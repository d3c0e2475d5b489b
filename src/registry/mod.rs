//! DNS registry interface and the record/health-check types exchanged with it.
//!
//! The registry is the only source of truth: nothing here is cached, every
//! reconciliation lists what it needs again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::RegistryError;

pub mod route53;

pub use route53::Route53Registry;

/// Record type published for the watched container.
pub const CNAME: &str = "CNAME";

/// Strip the trailing root dot so `svc.example.com.` and `svc.example.com` compare equal.
pub fn canonical_name(name: &str) -> &str {
    name.trim_end_matches('.')
}

/// A record set as listed by, or submitted to, the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Fully qualified record name.
    pub name: String,
    /// Record type, e.g. `CNAME`.
    pub record_type: String,
    /// Record values.
    pub values: Vec<String>,
    /// TTL in seconds.
    pub ttl: Option<u32>,
    /// Routing weight for weighted record sets.
    pub weight: Option<u32>,
    /// Distinguishes weighted entries that share a name.
    pub set_identifier: Option<String>,
    /// Health check gating this entry.
    pub health_check_id: Option<String>,
}

impl ServiceRecord {
    /// Weighted CNAME pointing `name` at `value`, keyed by `value`.
    pub fn weighted_cname(
        name: &str,
        value: &str,
        ttl: u32,
        weight: u32,
        health_check_id: Option<String>,
    ) -> Self {
        Self {
            name: name.to_string(),
            record_type: CNAME.to_string(),
            values: vec![value.to_string()],
            ttl: Some(ttl),
            weight: Some(weight),
            set_identifier: Some(value.to_string()),
            health_check_id,
        }
    }

    /// True if the record name matches `name`, ignoring a trailing root dot.
    pub fn has_name(&self, name: &str) -> bool {
        canonical_name(&self.name) == canonical_name(name)
    }

    /// True if any of the record values equals `value`.
    pub fn has_value(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Record set change action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    /// Create a record set that must not already exist.
    Create,
    /// Delete a record set; all fields must match exactly.
    Delete,
}

impl ChangeAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Create => "CREATE",
            ChangeAction::Delete => "DELETE",
        }
    }
}

/// One entry of a change batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// What to do.
    pub action: ChangeAction,
    /// The record to do it to.
    pub record: ServiceRecord,
}

/// Parameters for creating an HTTP health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSpec {
    /// Host probed by the check.
    pub fqdn: String,
    /// Port probed by the check.
    pub port: u16,
    /// HTTP path requested.
    pub resource_path: String,
    /// Consecutive failures before the endpoint is unhealthy.
    pub failure_threshold: u32,
    /// Seconds between probes.
    pub request_interval_secs: u32,
}

/// A health check as listed by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Registry-assigned id.
    pub id: String,
    /// Probed host, if the check targets a domain name.
    pub fqdn: Option<String>,
    /// Probed port.
    pub port: Option<u16>,
    /// HTTP path requested.
    pub resource_path: Option<String>,
    /// Check type, e.g. `HTTP`.
    pub check_type: String,
}

impl HealthCheck {
    /// Exact match on `(fqdn, port)`, no normalization.
    pub fn targets(&self, fqdn: &str, port: u16) -> bool {
        self.fqdn.as_deref() == Some(fqdn) && self.port == Some(port)
    }
}

/// Key/value tag on a registry resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Tag value.
    pub value: String,
}

impl Tag {
    /// Build a tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One checker's latest view of a health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckObservation {
    /// Checker that produced the observation (region or IP).
    pub observer: String,
    /// Status text, e.g. `Success: HTTP Status Code 200, OK`.
    pub status: String,
    /// When the checker produced it.
    pub checked_at: Option<DateTime<Utc>>,
}

impl HealthCheckObservation {
    /// True if the status text reports a failure.
    pub fn is_failure(&self) -> bool {
        self.status.contains("Failure")
    }
}

/// Remote DNS registry with health checks.
#[async_trait]
pub trait DnsRegistry: Send + Sync {
    /// All record sets in the zone.
    async fn list_record_sets(&self, zone_id: &str) -> Result<Vec<ServiceRecord>, RegistryError>;

    /// Apply `changes` as one atomic batch.
    async fn change_record_sets(&self, zone_id: &str, changes: &[Change]) -> Result<(), RegistryError>;

    /// All health checks in the account.
    async fn list_health_checks(&self) -> Result<Vec<HealthCheck>, RegistryError>;

    /// Create a health check. `caller_reference` makes the call idempotent.
    async fn create_health_check(
        &self,
        spec: &HealthCheckSpec,
        caller_reference: &str,
    ) -> Result<HealthCheck, RegistryError>;

    /// Delete a health check.
    async fn delete_health_check(&self, id: &str) -> Result<(), RegistryError>;

    /// Tags on a health check.
    async fn list_health_check_tags(&self, id: &str) -> Result<Vec<Tag>, RegistryError>;

    /// Add tags to a health check.
    async fn add_health_check_tags(&self, id: &str, tags: &[Tag]) -> Result<(), RegistryError>;

    /// Latest observation from each checker.
    async fn health_check_status(&self, id: &str) -> Result<Vec<HealthCheckObservation>, RegistryError>;
}
