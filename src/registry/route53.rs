//! [`DnsRegistry`] backed by Amazon Route53.

use async_trait::async_trait;
use aws_sdk_route53::error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_route53::types::{
    self as r53, ChangeBatch, HealthCheckConfig, HealthCheckType, ResourceRecord,
    ResourceRecordSet, RrType, TagResourceType,
};
use aws_sdk_route53::Client;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::RegistryError;
use crate::registry::{
    Change, ChangeAction, DnsRegistry, HealthCheck, HealthCheckObservation, HealthCheckSpec,
    ServiceRecord, Tag,
};

/// Route53 client wrapper.
#[derive(Debug, Clone)]
pub struct Route53Registry {
    client: Client,
}

impl Route53Registry {
    /// Wrap an SDK client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client for `region` from the ambient AWS credentials.
    pub async fn from_env(region: &str) -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_sdk_route53::config::Region::new(region.to_string()))
            .load()
            .await;
        Self::new(Client::new(&sdk_config))
    }
}

fn sdk_error<E, R>(operation: &'static str, err: SdkError<E, R>) -> RegistryError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(_) => RegistryError::service(
            operation,
            err.code().unwrap_or("Unknown"),
            err.message().unwrap_or_default(),
        ),
        _ => RegistryError::Transport {
            operation,
            message: DisplayErrorContext(&err).to_string(),
        },
    }
}

fn build_error(operation: &'static str, err: BuildError) -> RegistryError {
    RegistryError::InvalidRequest {
        operation,
        message: err.to_string(),
    }
}

fn from_record_set(set: &ResourceRecordSet) -> ServiceRecord {
    ServiceRecord {
        name: set.name().to_string(),
        record_type: set.r#type().as_str().to_string(),
        values: set
            .resource_records()
            .iter()
            .map(|r| r.value().to_string())
            .collect(),
        ttl: set.ttl().and_then(|t| u32::try_from(t).ok()),
        weight: set.weight().and_then(|w| u32::try_from(w).ok()),
        set_identifier: set.set_identifier().map(String::from),
        health_check_id: set.health_check_id().map(String::from),
    }
}

fn to_record_set(record: &ServiceRecord) -> Result<ResourceRecordSet, BuildError> {
    let mut records = Vec::with_capacity(record.values.len());
    for value in &record.values {
        records.push(ResourceRecord::builder().value(value).build()?);
    }

    ResourceRecordSet::builder()
        .name(&record.name)
        .r#type(RrType::from(record.record_type.as_str()))
        .set_resource_records(Some(records))
        .set_ttl(record.ttl.map(i64::from))
        .set_weight(record.weight.map(i64::from))
        .set_set_identifier(record.set_identifier.clone())
        .set_health_check_id(record.health_check_id.clone())
        .build()
}

fn to_change(change: &Change) -> Result<r53::Change, BuildError> {
    let action = match change.action {
        ChangeAction::Create => r53::ChangeAction::Create,
        ChangeAction::Delete => r53::ChangeAction::Delete,
    };
    r53::Change::builder()
        .action(action)
        .resource_record_set(to_record_set(&change.record)?)
        .build()
}

fn from_health_check(check: &r53::HealthCheck) -> HealthCheck {
    let config = check.health_check_config();
    HealthCheck {
        id: check.id().to_string(),
        fqdn: config
            .and_then(|c| c.fully_qualified_domain_name())
            .map(String::from),
        port: config
            .and_then(|c| c.port())
            .and_then(|p| u16::try_from(p).ok()),
        resource_path: config.and_then(|c| c.resource_path()).map(String::from),
        check_type: config
            .map(|c| c.r#type().as_str().to_string())
            .unwrap_or_default(),
    }
}

fn from_observation(obs: &r53::HealthCheckObservation) -> HealthCheckObservation {
    let observer = obs
        .region()
        .map(|r| r.as_str().to_string())
        .or_else(|| obs.ip_address().map(String::from))
        .unwrap_or_default();
    let report = obs.status_report();
    HealthCheckObservation {
        observer,
        status: report
            .and_then(|r| r.status())
            .unwrap_or_default()
            .to_string(),
        checked_at: report
            .and_then(|r| r.checked_time())
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
    }
}

#[async_trait]
impl DnsRegistry for Route53Registry {
    async fn list_record_sets(&self, zone_id: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        const OP: &str = "ListResourceRecordSets";

        let mut records = Vec::new();
        let mut start: Option<(String, RrType, Option<String>)> = None;

        loop {
            let mut req = self.client.list_resource_record_sets().hosted_zone_id(zone_id);
            if let Some((name, rr_type, identifier)) = start.take() {
                req = req
                    .start_record_name(name)
                    .start_record_type(rr_type)
                    .set_start_record_identifier(identifier);
            }

            let resp = req.send().await.map_err(|e| sdk_error(OP, e))?;
            records.extend(resp.resource_record_sets().iter().map(from_record_set));

            if !resp.is_truncated() {
                break;
            }
            match (resp.next_record_name(), resp.next_record_type()) {
                (Some(name), Some(rr_type)) => {
                    start = Some((
                        name.to_string(),
                        rr_type.clone(),
                        resp.next_record_identifier().map(String::from),
                    ));
                }
                _ => break,
            }
        }

        debug!(zone_id, count = records.len(), "listed record sets");
        Ok(records)
    }

    async fn change_record_sets(&self, zone_id: &str, changes: &[Change]) -> Result<(), RegistryError> {
        const OP: &str = "ChangeResourceRecordSets";

        let mut batch = Vec::with_capacity(changes.len());
        for change in changes {
            batch.push(to_change(change).map_err(|e| build_error(OP, e))?);
        }
        let batch = ChangeBatch::builder()
            .set_changes(Some(batch))
            .build()
            .map_err(|e| build_error(OP, e))?;

        let resp = self
            .client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;

        debug!(
            zone_id,
            change_id = resp.change_info().map(|c| c.id()).unwrap_or_default(),
            "submitted change batch"
        );
        Ok(())
    }

    async fn list_health_checks(&self) -> Result<Vec<HealthCheck>, RegistryError> {
        const OP: &str = "ListHealthChecks";

        let mut checks = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let resp = self
                .client
                .list_health_checks()
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| sdk_error(OP, e))?;
            checks.extend(resp.health_checks().iter().map(from_health_check));

            match resp.next_marker() {
                Some(next) if resp.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }

        Ok(checks)
    }

    async fn create_health_check(
        &self,
        spec: &HealthCheckSpec,
        caller_reference: &str,
    ) -> Result<HealthCheck, RegistryError> {
        const OP: &str = "CreateHealthCheck";

        let config = HealthCheckConfig::builder()
            .r#type(HealthCheckType::Http)
            .fully_qualified_domain_name(&spec.fqdn)
            .port(i32::from(spec.port))
            .resource_path(&spec.resource_path)
            .failure_threshold(spec.failure_threshold as i32)
            .request_interval(spec.request_interval_secs as i32)
            .build()
            .map_err(|e| build_error(OP, e))?;

        let resp = self
            .client
            .create_health_check()
            .caller_reference(caller_reference)
            .health_check_config(config)
            .send()
            .await
            .map_err(|e| sdk_error(OP, e))?;

        resp.health_check()
            .map(from_health_check)
            .ok_or_else(|| RegistryError::Transport {
                operation: OP,
                message: "response did not include the created health check".into(),
            })
    }

    async fn delete_health_check(&self, id: &str) -> Result<(), RegistryError> {
        self.client
            .delete_health_check()
            .health_check_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("DeleteHealthCheck", e))?;
        Ok(())
    }

    async fn list_health_check_tags(&self, id: &str) -> Result<Vec<Tag>, RegistryError> {
        let resp = self
            .client
            .list_tags_for_resource()
            .resource_type(TagResourceType::Healthcheck)
            .resource_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("ListTagsForResource", e))?;

        let tags = resp
            .resource_tag_set()
            .map(|set| set.tags())
            .unwrap_or_default()
            .iter()
            .filter_map(|t| Some(Tag::new(t.key()?, t.value().unwrap_or_default())))
            .collect();
        Ok(tags)
    }

    async fn add_health_check_tags(&self, id: &str, tags: &[Tag]) -> Result<(), RegistryError> {
        let tags = tags
            .iter()
            .map(|t| r53::Tag::builder().key(&t.key).value(&t.value).build())
            .collect();

        self.client
            .change_tags_for_resource()
            .resource_type(TagResourceType::Healthcheck)
            .resource_id(id)
            .set_add_tags(Some(tags))
            .send()
            .await
            .map_err(|e| sdk_error("ChangeTagsForResource", e))?;
        Ok(())
    }

    async fn health_check_status(&self, id: &str) -> Result<Vec<HealthCheckObservation>, RegistryError> {
        let resp = self
            .client
            .get_health_check_status()
            .health_check_id(id)
            .send()
            .await
            .map_err(|e| sdk_error("GetHealthCheckStatus", e))?;

        Ok(resp
            .health_check_observations()
            .iter()
            .map(from_observation)
            .collect())
    }
}
