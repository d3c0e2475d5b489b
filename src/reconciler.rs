//! Registration reconciler: turns a container transition into idempotent
//! CREATE/DELETE changes of this host's weighted CNAME.
//!
//! Every decision lists the zone again. The probe and the mutation are two
//! separate registry calls, so a concurrent writer can slip in between them:
//! a CREATE rejected because the record now exists is treated as already
//! registered, and a DELETE of a record that vanished is treated as done.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{ErrorClass, RegistryError};
use crate::health::HealthCheckManager;
use crate::metrics::{self, ReconcileAction, ReconcileResult, Timer};
use crate::registry::{canonical_name, Change, ChangeAction, DnsRegistry, ServiceRecord};
use crate::retry::RetryPolicy;

/// Where and how this host's record is published.
#[derive(Debug, Clone)]
pub struct RecordTarget {
    /// Hosted zone id.
    pub zone_id: String,
    /// Shared CNAME.
    pub cname: String,
    /// TTL in seconds.
    pub ttl: u32,
    /// Routing weight.
    pub weight: u32,
}

/// Health check attached to the record.
#[derive(Debug, Clone)]
pub struct HealthCheckTarget {
    /// Port probed.
    pub port: u16,
    /// HTTP path probed.
    pub path: String,
    /// Delete the owned check after the record is deleted.
    pub delete_on_deregister: bool,
}

/// Result of a reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A record was created.
    Registered {
        /// Health check attached to the new record.
        health_check_id: Option<String>,
    },
    /// A matching record already existed.
    AlreadyRegistered,
    /// The matching record(s) were deleted.
    Deregistered {
        /// Health checks deleted along with the record.
        deleted_health_checks: Vec<String>,
    },
    /// No matching record existed.
    NotRegistered,
}

/// Drives this host's record in the registry.
#[derive(Clone)]
pub struct Reconciler {
    registry: Arc<dyn DnsRegistry>,
    health: HealthCheckManager,
    retry: RetryPolicy,
    target: RecordTarget,
    health_check: Option<HealthCheckTarget>,
}

impl Reconciler {
    /// Create a reconciler. With `health_check` set to `None` records are
    /// published without a health check.
    pub fn new(
        registry: Arc<dyn DnsRegistry>,
        health: HealthCheckManager,
        retry: RetryPolicy,
        target: RecordTarget,
        health_check: Option<HealthCheckTarget>,
    ) -> Self {
        Self {
            registry,
            health,
            retry,
            target,
            health_check,
        }
    }

    /// Record target.
    pub fn target(&self) -> &RecordTarget {
        &self.target
    }

    /// Container started: probe the record, then ensure the health check and
    /// create the record if it is missing.
    pub async fn register(&self, host_value: &str) -> Result<Outcome, RegistryError> {
        let timer = Timer::start();
        let result = self.register_inner(host_value).await;
        let metric = match &result {
            Ok(Outcome::Registered { .. }) => ReconcileResult::Created,
            Ok(_) => ReconcileResult::Unchanged,
            Err(_) => ReconcileResult::Error,
        };
        metrics::record_reconcile(ReconcileAction::Register, metric, timer.elapsed());
        result
    }

    async fn register_inner(&self, host_value: &str) -> Result<Outcome, RegistryError> {
        // A record that already exists keeps whatever check it has; no check is created.
        if !self.find_matching(host_value).await?.is_empty() {
            self.log_already_registered(host_value);
            return Ok(Outcome::AlreadyRegistered);
        }

        let health_check_id = match &self.health_check {
            Some(hc) => Some(
                self.health
                    .ensure_health_check(host_value, hc.port, &hc.path)
                    .await?,
            ),
            None => None,
        };
        self.create_record(host_value, health_check_id.as_deref())
            .await
    }

    /// Container stopped: delete the record, then the owned health check if configured.
    pub async fn deregister(&self, host_value: &str) -> Result<Outcome, RegistryError> {
        let timer = Timer::start();
        let result = self.ensure_deregistered(host_value, None).await;
        let metric = match &result {
            Ok(Outcome::Deregistered { .. }) => ReconcileResult::Deleted,
            Ok(_) => ReconcileResult::Unchanged,
            Err(_) => ReconcileResult::Error,
        };
        metrics::record_reconcile(ReconcileAction::Deregister, metric, timer.elapsed());
        result
    }

    /// Create this host's weighted record unless one with the same value exists.
    pub async fn ensure_registered(
        &self,
        host_value: &str,
        health_check_id: Option<&str>,
    ) -> Result<Outcome, RegistryError> {
        if !self.find_matching(host_value).await?.is_empty() {
            self.log_already_registered(host_value);
            return Ok(Outcome::AlreadyRegistered);
        }
        self.create_record(host_value, health_check_id).await
    }

    fn log_already_registered(&self, host_value: &str) {
        info!(
            cname = %self.target.cname,
            host = host_value,
            "record already registered"
        );
    }

    async fn create_record(
        &self,
        host_value: &str,
        health_check_id: Option<&str>,
    ) -> Result<Outcome, RegistryError> {
        let record = ServiceRecord::weighted_cname(
            &self.target.cname,
            host_value,
            self.target.ttl,
            self.target.weight,
            health_check_id.map(String::from),
        );
        let changes = [Change {
            action: ChangeAction::Create,
            record,
        }];

        match self.submit(&changes).await {
            Ok(()) => {
                info!(
                    cname = %self.target.cname,
                    host = host_value,
                    health_check_id = ?health_check_id,
                    "registered record"
                );
                Ok(Outcome::Registered {
                    health_check_id: health_check_id.map(String::from),
                })
            }
            Err(e) if e.class() == ErrorClass::Conflict => {
                warn!(
                    cname = %self.target.cname,
                    host = host_value,
                    error = %e,
                    "record appeared between probe and create"
                );
                Ok(Outcome::AlreadyRegistered)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete this host's record if it exists, then, when configured, the
    /// owned health checks attached to it (and `health_check_id`, if given).
    pub async fn ensure_deregistered(
        &self,
        host_value: &str,
        health_check_id: Option<&str>,
    ) -> Result<Outcome, RegistryError> {
        let deleted = self.delete_matching(host_value).await?;
        if deleted.is_empty() {
            return Ok(Outcome::NotRegistered);
        }

        let mut deleted_health_checks = Vec::new();
        let delete_checks = self
            .health_check
            .as_ref()
            .map(|hc| hc.delete_on_deregister)
            .unwrap_or(false);
        if delete_checks {
            let mut ids: Vec<&str> = deleted
                .iter()
                .filter_map(|r| r.health_check_id.as_deref())
                .chain(health_check_id)
                .collect();
            ids.sort_unstable();
            ids.dedup();
            for id in ids {
                match self.health.delete_if_owned(id).await {
                    Ok(true) => deleted_health_checks.push(id.to_string()),
                    Ok(false) => {}
                    // Still referenced by another record set.
                    Err(e) if e.class() == ErrorClass::Conflict => {
                        warn!(health_check_id = id, error = %e, "health check still in use, keeping it");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Ok(Outcome::Deregistered {
            deleted_health_checks,
        })
    }

    /// Delete every record matching `(cname, host_value)` in one batch.
    /// Returns the deleted records; empty if none existed.
    async fn delete_matching(&self, host_value: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        let existing = self.find_matching(host_value).await?;
        if existing.is_empty() {
            info!(
                cname = %self.target.cname,
                host = host_value,
                "no record to deregister"
            );
            return Ok(Vec::new());
        }

        // DELETE must repeat the record exactly as the registry holds it.
        let changes: Vec<Change> = existing
            .iter()
            .cloned()
            .map(|record| Change {
                action: ChangeAction::Delete,
                record,
            })
            .collect();

        match self.submit(&changes).await {
            Ok(()) => {
                info!(
                    cname = %self.target.cname,
                    host = host_value,
                    count = changes.len(),
                    "deregistered record"
                );
                Ok(existing)
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    cname = %self.target.cname,
                    host = host_value,
                    error = %e,
                    "record vanished before delete"
                );
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Records named `cname` (trailing dot ignored) whose values contain `host_value`.
    async fn find_matching(&self, host_value: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        let zone_id = self.target.zone_id.as_str();
        let records = self
            .retry
            .call("ListResourceRecordSets", || {
                self.registry.list_record_sets(zone_id)
            })
            .await?;

        let matching: Vec<ServiceRecord> = records
            .into_iter()
            .filter(|r| r.has_name(&self.target.cname) && r.has_value(host_value))
            .collect();

        debug!(
            cname = canonical_name(&self.target.cname),
            host = host_value,
            matches = matching.len(),
            "probed record sets"
        );
        if matching.len() > 1 {
            warn!(
                cname = %self.target.cname,
                host = host_value,
                count = matching.len(),
                "more than one record matches this host"
            );
            metrics::record_ambiguous_match("record");
        }

        Ok(matching)
    }

    async fn submit(&self, changes: &[Change]) -> Result<(), RegistryError> {
        let zone_id = self.target.zone_id.as_str();
        self.retry
            .call("ChangeResourceRecordSets", || {
                self.registry.change_record_sets(zone_id, changes)
            })
            .await
    }
}
