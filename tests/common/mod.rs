//! Shared test infrastructure: in-memory registry and runtime that record every call.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use route53_registrator::dispatch::Dispatcher;
use route53_registrator::error::{RegistratorError, RegistryError};
use route53_registrator::health::HealthCheckManager;
use route53_registrator::reconciler::{HealthCheckTarget, RecordTarget, Reconciler};
use route53_registrator::registry::{
    canonical_name, Change, ChangeAction, DnsRegistry, HealthCheck, HealthCheckObservation,
    HealthCheckSpec, ServiceRecord, Tag,
};
use route53_registrator::retry::RetryPolicy;
use route53_registrator::runtime::{ContainerRuntime, ContainerStatus, EventStream, LifecycleEvent};

// --- Constants ---

pub const ZONE: &str = "Z1P7DHMHEAX6O3";
pub const CNAME: &str = "svc.example.com";
pub const HOST: &str = "host1.example.com";
pub const OTHER_HOST: &str = "host2.example.com";
pub const CONTAINER: &str = "docker-registry";
pub const OWNER_KEY: &str = "route53-registrator";
pub const HC_PORT: u16 = 1000;
pub const HC_PATH: &str = "/v2/";

pub fn owner_tag() -> Tag {
    Tag::new(OWNER_KEY, HOST)
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        call_timeout: Duration::from_secs(5),
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
    }
}

// --- FakeRegistry ---

/// A registry call, as observed by the fake.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListRecordSets,
    ChangeRecordSets(Vec<Change>),
    ListHealthChecks,
    CreateHealthCheck(HealthCheckSpec),
    DeleteHealthCheck(String),
    ListTags(String),
    AddTags(String, Vec<Tag>),
    HealthCheckStatus(String),
}

#[derive(Default)]
struct Inner {
    records: Vec<ServiceRecord>,
    checks: Vec<HealthCheck>,
    tags: HashMap<String, Vec<Tag>>,
    observations: HashMap<String, Vec<HealthCheckObservation>>,
    calls: Vec<Call>,
    next_id: u32,
    failures: VecDeque<(&'static str, RegistryError)>,
}

/// In-memory registry with Route53-like semantics for the calls we use.
#[derive(Default)]
pub struct FakeRegistry {
    inner: Mutex<Inner>,
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_record(&self, record: ServiceRecord) {
        self.inner.lock().records.push(record);
    }

    pub fn add_health_check(&self, id: &str, fqdn: &str, port: u16) {
        self.inner.lock().checks.push(HealthCheck {
            id: id.to_string(),
            fqdn: Some(fqdn.to_string()),
            port: Some(port),
            resource_path: Some("/".to_string()),
            check_type: "HTTP".to_string(),
        });
    }

    pub fn tag(&self, id: &str, tag: Tag) {
        self.inner.lock().tags.entry(id.to_string()).or_default().push(tag);
    }

    pub fn set_observations(&self, id: &str, observations: Vec<HealthCheckObservation>) {
        self.inner
            .lock()
            .observations
            .insert(id.to_string(), observations);
    }

    /// Make the next call to `operation` fail with `error`.
    pub fn fail_next(&self, operation: &'static str, error: RegistryError) {
        self.inner.lock().failures.push_back((operation, error));
    }

    pub fn records(&self) -> Vec<ServiceRecord> {
        self.inner.lock().records.clone()
    }

    pub fn health_checks(&self) -> Vec<HealthCheck> {
        self.inner.lock().checks.clone()
    }

    pub fn tags_of(&self, id: &str) -> Vec<Tag> {
        self.inner.lock().tags.get(id).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    /// Only the calls that change registry state.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| {
                matches!(
                    c,
                    Call::ChangeRecordSets(_)
                        | Call::CreateHealthCheck(_)
                        | Call::DeleteHealthCheck(_)
                        | Call::AddTags(..)
                )
            })
            .collect()
    }

    /// Actions of every submitted record change, in order.
    pub fn change_actions(&self) -> Vec<ChangeAction> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ChangeRecordSets(changes) => Some(changes),
                _ => None,
            })
            .flatten()
            .map(|c| c.action)
            .collect()
    }

    fn begin(&self, operation: &'static str, call: Call) -> Result<(), RegistryError> {
        let mut inner = self.inner.lock();
        inner.calls.push(call);
        if let Some(pos) = inner.failures.iter().position(|(op, _)| *op == operation) {
            let (_, err) = inner.failures.remove(pos).expect("position is valid");
            return Err(err);
        }
        Ok(())
    }
}

fn same_record(a: &ServiceRecord, b: &ServiceRecord) -> bool {
    canonical_name(&a.name) == canonical_name(&b.name)
        && a.record_type == b.record_type
        && a.set_identifier == b.set_identifier
        && a.values == b.values
        && a.ttl == b.ttl
        && a.weight == b.weight
        && a.health_check_id == b.health_check_id
}

#[async_trait]
impl DnsRegistry for FakeRegistry {
    async fn list_record_sets(&self, _zone_id: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.begin("ListResourceRecordSets", Call::ListRecordSets)?;
        Ok(self.inner.lock().records.clone())
    }

    async fn change_record_sets(&self, _zone_id: &str, changes: &[Change]) -> Result<(), RegistryError> {
        self.begin(
            "ChangeResourceRecordSets",
            Call::ChangeRecordSets(changes.to_vec()),
        )?;
        let mut inner = self.inner.lock();

        // Validate the whole batch before applying any of it.
        for change in changes {
            let record = &change.record;
            match change.action {
                ChangeAction::Create => {
                    let exists = inner.records.iter().any(|r| {
                        canonical_name(&r.name) == canonical_name(&record.name)
                            && r.record_type == record.record_type
                            && r.set_identifier == record.set_identifier
                    });
                    if exists {
                        return Err(RegistryError::service(
                            "ChangeResourceRecordSets",
                            "InvalidChangeBatch",
                            "Tried to create resource record set but it already exists",
                        ));
                    }
                }
                ChangeAction::Delete => {
                    if !inner.records.iter().any(|r| same_record(r, record)) {
                        return Err(RegistryError::service(
                            "ChangeResourceRecordSets",
                            "InvalidChangeBatch",
                            "Tried to delete resource record set but it was not found",
                        ));
                    }
                }
            }
        }

        for change in changes {
            match change.action {
                ChangeAction::Create => inner.records.push(change.record.clone()),
                ChangeAction::Delete => inner.records.retain(|r| !same_record(r, &change.record)),
            }
        }
        Ok(())
    }

    async fn list_health_checks(&self) -> Result<Vec<HealthCheck>, RegistryError> {
        self.begin("ListHealthChecks", Call::ListHealthChecks)?;
        Ok(self.inner.lock().checks.clone())
    }

    async fn create_health_check(
        &self,
        spec: &HealthCheckSpec,
        _caller_reference: &str,
    ) -> Result<HealthCheck, RegistryError> {
        self.begin("CreateHealthCheck", Call::CreateHealthCheck(spec.clone()))?;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let check = HealthCheck {
            id: format!("hc-{}", inner.next_id),
            fqdn: Some(spec.fqdn.clone()),
            port: Some(spec.port),
            resource_path: Some(spec.resource_path.clone()),
            check_type: "HTTP".to_string(),
        };
        inner.checks.push(check.clone());
        Ok(check)
    }

    async fn delete_health_check(&self, id: &str) -> Result<(), RegistryError> {
        self.begin("DeleteHealthCheck", Call::DeleteHealthCheck(id.to_string()))?;
        let mut inner = self.inner.lock();
        if !inner.checks.iter().any(|c| c.id == id) {
            return Err(RegistryError::service(
                "DeleteHealthCheck",
                "NoSuchHealthCheck",
                format!("No health check exists with the specified ID {id}"),
            ));
        }
        if inner
            .records
            .iter()
            .any(|r| r.health_check_id.as_deref() == Some(id))
        {
            return Err(RegistryError::service(
                "DeleteHealthCheck",
                "HealthCheckInUse",
                "The health check is still referenced from a resource record set",
            ));
        }
        inner.checks.retain(|c| c.id != id);
        inner.tags.remove(id);
        Ok(())
    }

    async fn list_health_check_tags(&self, id: &str) -> Result<Vec<Tag>, RegistryError> {
        self.begin("ListTagsForResource", Call::ListTags(id.to_string()))?;
        let inner = self.inner.lock();
        if !inner.checks.iter().any(|c| c.id == id) {
            return Err(RegistryError::service(
                "ListTagsForResource",
                "NoSuchHealthCheck",
                "not found",
            ));
        }
        Ok(inner.tags.get(id).cloned().unwrap_or_default())
    }

    async fn add_health_check_tags(&self, id: &str, tags: &[Tag]) -> Result<(), RegistryError> {
        self.begin("ChangeTagsForResource", Call::AddTags(id.to_string(), tags.to_vec()))?;
        self.inner
            .lock()
            .tags
            .entry(id.to_string())
            .or_default()
            .extend(tags.iter().cloned());
        Ok(())
    }

    async fn health_check_status(&self, id: &str) -> Result<Vec<HealthCheckObservation>, RegistryError> {
        self.begin("GetHealthCheckStatus", Call::HealthCheckStatus(id.to_string()))?;
        Ok(self
            .inner
            .lock()
            .observations
            .get(id)
            .cloned()
            .unwrap_or_default())
    }
}

// --- FakeRuntime ---

/// Runtime whose container states and names are set by the test.
///
/// Like Docker, a subscription without `since` only sees events recorded
/// after it opens; with `since` it replays recorded events from that instant.
#[derive(Default)]
pub struct FakeRuntime {
    running: Mutex<HashSet<String>>,
    names: Mutex<HashMap<String, String>>,
    scripted: Mutex<Option<Vec<LifecycleEvent>>>,
    history: Mutex<Vec<LifecycleEvent>>,
    stop_after_probe: Mutex<bool>,
    subscriptions: Mutex<Vec<Option<DateTime<Utc>>>>,
    lookups: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_running(&self, name: &str, running: bool) {
        let name = name.trim_start_matches('/').to_string();
        let mut set = self.running.lock();
        if running {
            set.insert(name);
        } else {
            set.remove(&name);
        }
    }

    /// Name reported by inspect for `id` (Docker reports it with a leading `/`).
    pub fn set_name(&self, id: &str, name: &str) {
        self.names.lock().insert(id.to_string(), name.to_string());
    }

    /// Events returned by the next subscription regardless of `since`.
    pub fn set_events(&self, events: Vec<LifecycleEvent>) {
        *self.scripted.lock() = Some(events);
    }

    /// The watched container dies right after the next running probe answers.
    pub fn stop_after_probe(&self) {
        *self.stop_after_probe.lock() = true;
    }

    /// `since` of every subscription, in order.
    pub fn subscriptions(&self) -> Vec<Option<DateTime<Utc>>> {
        self.subscriptions.lock().clone()
    }

    pub fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn events(&self, since: Option<DateTime<Utc>>) -> EventStream {
        self.subscriptions.lock().push(since);
        let from = since.unwrap_or_else(Utc::now);
        let mut events: Vec<LifecycleEvent> = self
            .history
            .lock()
            .iter()
            .filter(|e| e.time.map(|t| t >= from).unwrap_or(false))
            .cloned()
            .collect();
        events.extend(self.scripted.lock().take().unwrap_or_default());
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    async fn container_name(&self, container_id: &str) -> Result<Option<String>, RegistratorError> {
        self.lookups.lock().push(container_id.to_string());
        Ok(self.names.lock().get(container_id).cloned())
    }

    async fn is_running(&self, container_name: &str) -> Result<bool, RegistratorError> {
        let name = container_name.trim_start_matches('/');
        let running = self.running.lock().contains(name);
        let stop = std::mem::take(&mut *self.stop_after_probe.lock());
        if running && stop {
            self.running.lock().remove(name);
            self.history.lock().push(LifecycleEvent {
                time: Some(Utc::now()),
                ..event("c1", ContainerStatus::Stopped, Some(name))
            });
        }
        Ok(running)
    }
}

// --- Builders ---

pub fn event(id: &str, status: ContainerStatus, name: Option<&str>) -> LifecycleEvent {
    LifecycleEvent {
        container_id: id.to_string(),
        status,
        container_name: name.map(String::from),
        time: None,
    }
}

pub fn started(name: &str) -> LifecycleEvent {
    event("c1", ContainerStatus::Started, Some(name))
}

pub fn died(name: &str) -> LifecycleEvent {
    event("c1", ContainerStatus::Stopped, Some(name))
}

pub fn observation(status: &str, at: DateTime<Utc>) -> HealthCheckObservation {
    HealthCheckObservation {
        observer: "us-east-1".to_string(),
        status: status.to_string(),
        checked_at: Some(at),
    }
}

pub fn health_manager(registry: Arc<FakeRegistry>) -> HealthCheckManager {
    HealthCheckManager::new(registry, fast_retry(), owner_tag())
}

pub fn reconciler(registry: Arc<FakeRegistry>, delete_on_deregister: bool) -> Reconciler {
    Reconciler::new(
        registry.clone(),
        health_manager(registry),
        fast_retry(),
        RecordTarget {
            zone_id: ZONE.to_string(),
            cname: CNAME.to_string(),
            ttl: 5,
            weight: 50,
        },
        Some(HealthCheckTarget {
            port: HC_PORT,
            path: HC_PATH.to_string(),
            delete_on_deregister,
        }),
    )
}

pub fn dispatcher(registry: Arc<FakeRegistry>, runtime: Arc<FakeRuntime>) -> Dispatcher {
    Dispatcher::new(
        runtime,
        reconciler(registry.clone(), true),
        health_manager(registry),
        CONTAINER,
        HOST,
    )
}

/// Weighted record for `host` under the test CNAME.
pub fn host_record(name: &str, host: &str, health_check_id: Option<&str>) -> ServiceRecord {
    ServiceRecord::weighted_cname(name, host, 5, 50, health_check_id.map(String::from))
}
