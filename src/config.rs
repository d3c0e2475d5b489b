//! Configuration types for route53-registrator.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::RegistratorError;
use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Registrator configuration.
    #[serde(default)]
    pub registrator: RegistratorConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// What to watch and where to register it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistratorConfig {
    /// Name of the container to watch.
    #[serde(default = "default_container")]
    pub container: String,

    /// Docker endpoint. Falls back to `DOCKER_HOST` and then the local socket.
    #[serde(default)]
    pub docker_host: Option<String>,

    /// Address of the EC2 metadata service.
    #[serde(default = "default_metadata_addr")]
    pub metadata_addr: String,

    /// Fixed host identity. When set the metadata service is not queried.
    #[serde(default)]
    pub host_value: Option<String>,

    /// AWS region for the Route53 client.
    #[serde(default = "default_region")]
    pub region: String,

    /// Route53 hosted zone id.
    #[serde(default)]
    pub zone_id: String,

    /// CNAME to publish the host under.
    #[serde(default)]
    pub cname: String,

    /// Weighted record parameters.
    #[serde(default)]
    pub record: RecordConfig,

    /// Health check parameters.
    #[serde(default)]
    pub health_check: HealthCheckSettings,

    /// Registry call timeouts and retries.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Liveness endpoint address. `None` disables it.
    #[serde(default = "default_status_addr")]
    pub status_addr: Option<SocketAddr>,

    /// Remove this host's record before exiting.
    #[serde(default)]
    pub deregister_on_shutdown: bool,

    /// Stop the event loop when a reconciliation fails with a fatal registry error.
    #[serde(default = "default_true")]
    pub exit_on_fatal: bool,
}

/// Weighted CNAME parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Record TTL in seconds.
    #[serde(default = "default_record_ttl")]
    pub ttl: u32,

    /// Routing weight (0-255).
    #[serde(default = "default_record_weight")]
    pub weight: u32,
}

/// Health check parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    /// Port the health check probes.
    #[serde(default = "default_health_check_port")]
    pub port: u16,

    /// HTTP path the health check requests.
    #[serde(default = "default_health_check_path")]
    pub path: String,

    /// Consecutive failures before the check is considered unhealthy.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds between probes (Route53 accepts 10 or 30).
    #[serde(default = "default_request_interval")]
    pub request_interval_secs: u32,

    /// Tag key marking health checks created by a registrator.
    #[serde(default = "default_owner_tag_key")]
    pub owner_tag_key: String,

    /// Tag value identifying this instance. Defaults to the host identity.
    #[serde(default)]
    pub owner_tag_value: Option<String>,

    /// How long a failure must persist before an owned check counts as stale.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,

    /// Delete the owned health check when the record is deregistered.
    #[serde(default = "default_true")]
    pub delete_on_deregister: bool,

    /// Interval between stale health check sweeps. `None` disables reaping.
    #[serde(default)]
    pub reap_interval_secs: Option<u64>,
}

/// Bounds applied to every registry call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Per-call deadline in seconds.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound on the retry delay.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "route53_registrator=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log line format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,

    /// OpenTelemetry configuration.
    #[serde(default)]
    pub opentelemetry: Option<OpenTelemetryConfig>,
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// OpenTelemetry exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTelemetryConfig {
    /// OTLP endpoint (e.g., "http://localhost:4317").
    pub endpoint: String,

    /// Service name for traces.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

impl RegistratorConfig {
    /// Check the values that have no usable default.
    pub fn validate(&self) -> Result<(), RegistratorError> {
        if self.container.trim().is_empty() {
            return Err(RegistratorError::Config("container must not be empty".into()));
        }
        if self.zone_id.trim().is_empty() {
            return Err(RegistratorError::Config("zone_id is required".into()));
        }
        if self.cname.trim_end_matches('.').is_empty() {
            return Err(RegistratorError::Config("cname is required".into()));
        }
        if self.record.ttl == 0 {
            return Err(RegistratorError::Config("record.ttl must be positive".into()));
        }
        if self.record.weight > 255 {
            return Err(RegistratorError::Config(format!(
                "record.weight must be in 0..=255, got {}",
                self.record.weight
            )));
        }
        if self.health_check.port == 0 {
            return Err(RegistratorError::Config("health_check.port must be non-zero".into()));
        }
        if !self.health_check.path.starts_with('/') {
            return Err(RegistratorError::Config(format!(
                "health_check.path must start with '/', got {:?}",
                self.health_check.path
            )));
        }
        if self.health_check.reap_interval_secs == Some(0) {
            return Err(RegistratorError::Config(
                "health_check.reap_interval_secs must be positive".into(),
            ));
        }
        if self.registry.call_timeout_secs == 0 {
            return Err(RegistratorError::Config("registry.call_timeout_secs must be positive".into()));
        }
        if self.registry.max_attempts == 0 {
            return Err(RegistratorError::Config("registry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Retry policy derived from the registry section.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            call_timeout: Duration::from_secs(self.registry.call_timeout_secs),
            max_attempts: self.registry.max_attempts,
            initial_backoff: Duration::from_millis(self.registry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.registry.max_backoff_ms),
        }
    }
}

impl Default for RegistratorConfig {
    fn default() -> Self {
        Self {
            container: default_container(),
            docker_host: None,
            metadata_addr: default_metadata_addr(),
            host_value: None,
            region: default_region(),
            zone_id: String::new(),
            cname: String::new(),
            record: RecordConfig::default(),
            health_check: HealthCheckSettings::default(),
            registry: RegistryConfig::default(),
            status_addr: default_status_addr(),
            deregister_on_shutdown: false,
            exit_on_fatal: true,
        }
    }
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            ttl: default_record_ttl(),
            weight: default_record_weight(),
        }
    }
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            port: default_health_check_port(),
            path: default_health_check_path(),
            failure_threshold: default_failure_threshold(),
            request_interval_secs: default_request_interval(),
            owner_tag_key: default_owner_tag_key(),
            owner_tag_value: None,
            grace_period_secs: default_grace_period(),
            delete_on_deregister: true,
            reap_interval_secs: None,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            prometheus_addr: None,
            opentelemetry: None,
        }
    }
}

fn default_container() -> String {
    "docker-registry".to_string()
}

fn default_metadata_addr() -> String {
    "169.254.169.254".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_status_addr() -> Option<SocketAddr> {
    Some(SocketAddr::from(([0, 0, 0, 0], 8080)))
}

fn default_true() -> bool {
    true
}

fn default_record_ttl() -> u32 {
    5
}

fn default_record_weight() -> u32 {
    50
}

fn default_health_check_port() -> u16 {
    80
}

fn default_health_check_path() -> String {
    "/".to_string()
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_request_interval() -> u32 {
    10
}

fn default_owner_tag_key() -> String {
    "route53-registrator".to_string()
}

fn default_grace_period() -> u64 {
    30
}

fn default_call_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "route53-registrator".to_string()
}
