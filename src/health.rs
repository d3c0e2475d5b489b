//! Health check ownership: find-or-create, tagging and reaping.
//!
//! A health check is identified by its `(fqdn, port)` pair. Checks created here
//! are tagged with the owner tag so that deletion and reaping never touch
//! checks created by someone else.
//!
//! Finding and creating are two separate registry calls, so two registrators
//! racing on the same `(fqdn, port)` can each create a check. Route53 has no
//! conditional create keyed on the check config; the duplicate is reported as
//! an ambiguous match on the next lookup.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorClass, RegistryError};
use crate::metrics::{self, HealthCheckAction};
use crate::registry::{DnsRegistry, HealthCheck, HealthCheckObservation, HealthCheckSpec, Tag};
use crate::retry::RetryPolicy;

/// Creates, tags and reaps health checks owned by this registrator.
#[derive(Clone)]
pub struct HealthCheckManager {
    registry: Arc<dyn DnsRegistry>,
    retry: RetryPolicy,
    owner: Tag,
    failure_threshold: u32,
    request_interval_secs: u32,
    /// Checks created here whose owner tag could not be applied.
    untagged: Arc<Mutex<HashSet<String>>>,
}

impl HealthCheckManager {
    /// Create a manager that tags its checks with `owner`.
    pub fn new(registry: Arc<dyn DnsRegistry>, retry: RetryPolicy, owner: Tag) -> Self {
        Self {
            registry,
            retry,
            owner,
            failure_threshold: 1,
            request_interval_secs: 10,
            untagged: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Override the probe parameters used for new checks.
    pub fn with_probe_settings(mut self, failure_threshold: u32, request_interval_secs: u32) -> Self {
        self.failure_threshold = failure_threshold;
        self.request_interval_secs = request_interval_secs;
        self
    }

    /// Owner tag applied to created checks.
    pub fn owner(&self) -> &Tag {
        &self.owner
    }

    /// Return the id of the health check for `(fqdn, port)`, creating one if none exists.
    pub async fn ensure_health_check(
        &self,
        fqdn: &str,
        port: u16,
        resource_path: &str,
    ) -> Result<String, RegistryError> {
        let checks = self
            .retry
            .call("ListHealthChecks", || self.registry.list_health_checks())
            .await?;

        let mut matching = checks.iter().filter(|c| c.targets(fqdn, port));
        if let Some(existing) = matching.next() {
            let others: Vec<&str> = matching.map(|c| c.id.as_str()).collect();
            if !others.is_empty() {
                warn!(
                    fqdn,
                    port,
                    using = %existing.id,
                    duplicates = ?others,
                    "more than one health check matches, using the first"
                );
                metrics::record_ambiguous_match("health_check");
            }
            debug!(fqdn, port, health_check_id = %existing.id, "reusing health check");
            metrics::record_health_check(HealthCheckAction::Reused);
            let retag = self.untagged.lock().contains(&existing.id);
            if retag {
                self.tag_owned(&existing.id).await;
            }
            return Ok(existing.id.clone());
        }

        let spec = HealthCheckSpec {
            fqdn: fqdn.to_string(),
            port,
            resource_path: resource_path.to_string(),
            failure_threshold: self.failure_threshold,
            request_interval_secs: self.request_interval_secs,
        };
        // Same reference on every retry of this create, a new one per create.
        let caller_reference = Uuid::new_v4().to_string();
        let created = self
            .retry
            .call("CreateHealthCheck", || {
                self.registry.create_health_check(&spec, &caller_reference)
            })
            .await?;

        info!(fqdn, port, health_check_id = %created.id, "created health check");
        metrics::record_health_check(HealthCheckAction::Created);

        self.tag_owned(&created.id).await;
        Ok(created.id)
    }

    /// Apply the owner tag. On failure the id is remembered so the next
    /// lookup that reuses the check tags it again.
    async fn tag_owned(&self, id: &str) {
        let tags = [self.owner.clone()];
        match self
            .retry
            .call("ChangeTagsForResource", || {
                self.registry.add_health_check_tags(id, &tags)
            })
            .await
        {
            Ok(()) => {
                self.untagged.lock().remove(id);
            }
            Err(e) => {
                // The record still needs the check; until tagged it is neither
                // deleted on deregister nor reaped.
                warn!(health_check_id = id, error = %e, "failed to tag health check");
                metrics::record_health_check(HealthCheckAction::TagFailed);
                self.untagged.lock().insert(id.to_string());
            }
        }
    }

    /// True if the check carries this registrator's owner tag.
    pub async fn is_owned(&self, id: &str) -> Result<bool, RegistryError> {
        let tags = self
            .retry
            .call("ListTagsForResource", || self.registry.list_health_check_tags(id))
            .await?;
        Ok(tags.contains(&self.owner))
    }

    /// Delete the check. Returns `false` if it was already gone.
    pub async fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        match self
            .retry
            .call("DeleteHealthCheck", || self.registry.delete_health_check(id))
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => {
                debug!(health_check_id = id, "health check already deleted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the check only if this registrator owns it. Returns `true` if deleted.
    pub async fn delete_if_owned(&self, id: &str) -> Result<bool, RegistryError> {
        let owned = match self.is_owned(id).await {
            Ok(owned) => owned,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        if !owned {
            info!(health_check_id = id, "health check not owned by this registrator, keeping it");
            return Ok(false);
        }

        let deleted = self.delete(id).await?;
        if deleted {
            info!(health_check_id = id, "deleted health check");
            metrics::record_health_check(HealthCheckAction::Deleted);
        }
        Ok(deleted)
    }

    /// Owned checks whose failure has outlasted `grace_period`. Deletes nothing.
    pub async fn find_stale_owned_health_checks(
        &self,
        grace_period: Duration,
    ) -> Result<Vec<HealthCheck>, RegistryError> {
        let checks = self
            .retry
            .call("ListHealthChecks", || self.registry.list_health_checks())
            .await?;

        let now = Utc::now();
        let mut stale = Vec::new();

        for check in checks {
            // Other registrators delete their checks concurrently; a vanished
            // check is skipped rather than ending the sweep.
            let tags = match self
                .retry
                .call("ListTagsForResource", || {
                    self.registry.list_health_check_tags(&check.id)
                })
                .await
            {
                Ok(tags) => tags,
                Err(e) if e.is_not_found() => {
                    debug!(health_check_id = %check.id, "health check vanished during sweep");
                    continue;
                }
                Err(e) => return Err(e),
            };
            if !tags.contains(&self.owner) {
                continue;
            }

            let observations = match self
                .retry
                .call("GetHealthCheckStatus", || {
                    self.registry.health_check_status(&check.id)
                })
                .await
            {
                Ok(observations) => observations,
                Err(e) if e.is_not_found() => {
                    debug!(health_check_id = %check.id, "health check vanished during sweep");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if is_stale(&observations, now, grace_period) {
                debug!(health_check_id = %check.id, "health check is stale");
                stale.push(check);
            }
        }

        Ok(stale)
    }

    /// Delete every stale owned check. Checks still attached to a record are skipped.
    pub async fn reap_stale(&self, grace_period: Duration) -> Result<usize, RegistryError> {
        let stale = self.find_stale_owned_health_checks(grace_period).await?;
        let mut reaped = 0;

        for check in stale {
            match self.delete(&check.id).await {
                Ok(true) => {
                    info!(health_check_id = %check.id, fqdn = ?check.fqdn, "reaped stale health check");
                    metrics::record_health_check(HealthCheckAction::Reaped);
                    reaped += 1;
                }
                Ok(false) => {}
                Err(e) if e.class() == ErrorClass::Conflict => {
                    warn!(health_check_id = %check.id, error = %e, "stale health check still in use");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(reaped)
    }
}

/// A check is stale when its latest observation is a failure and some failure
/// is older than `grace_period`.
pub fn is_stale(
    observations: &[HealthCheckObservation],
    now: DateTime<Utc>,
    grace_period: Duration,
) -> bool {
    let Some(latest) = observations
        .iter()
        .filter(|o| o.checked_at.is_some())
        .max_by_key(|o| o.checked_at)
    else {
        return false;
    };
    if !latest.is_failure() {
        return false;
    }

    let grace = chrono::Duration::from_std(grace_period).unwrap_or(chrono::Duration::MAX);
    observations.iter().any(|o| {
        o.is_failure()
            && o.checked_at
                .map(|at| now.signed_duration_since(at) > grace)
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(status: &str, age_secs: i64, now: DateTime<Utc>) -> HealthCheckObservation {
        HealthCheckObservation {
            observer: "us-east-1".into(),
            status: status.into(),
            checked_at: Some(now - chrono::Duration::seconds(age_secs)),
        }
    }

    #[test]
    fn test_old_failure_is_stale() {
        let now = Utc::now();
        let observations = vec![obs("Failure: HTTP Status Code 503", 120, now)];
        assert!(is_stale(&observations, now, Duration::from_secs(30)));
    }

    #[test]
    fn test_recent_failure_within_grace_is_not_stale() {
        let now = Utc::now();
        let observations = vec![obs("Failure: Connection timed out", 5, now)];
        assert!(!is_stale(&observations, now, Duration::from_secs(30)));
    }

    #[test]
    fn test_latest_success_is_not_stale() {
        let now = Utc::now();
        let observations = vec![
            obs("Failure: Connection refused", 600, now),
            obs("Success: HTTP Status Code 200, OK", 2, now),
        ];
        assert!(!is_stale(&observations, now, Duration::from_secs(30)));
    }

    #[test]
    fn test_persisting_failure_is_stale() {
        let now = Utc::now();
        let observations = vec![
            obs("Failure: Connection refused", 600, now),
            obs("Failure: Connection refused", 3, now),
        ];
        assert!(is_stale(&observations, now, Duration::from_secs(30)));
    }

    #[test]
    fn test_no_observations_is_not_stale() {
        assert!(!is_stale(&[], Utc::now(), Duration::from_secs(30)));
    }

    #[test]
    fn test_grace_period_is_respected() {
        let now = Utc::now();
        let observations = vec![obs("Failure: Connection refused", 120, now)];
        assert!(is_stale(&observations, now, Duration::from_secs(30)));
        assert!(!is_stale(&observations, now, Duration::from_secs(600)));
    }
}
