//! Registrator setup and lifecycle management.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tripwire::Tripwire;

use crate::config::RegistratorConfig;
use crate::dispatch::{Dispatcher, ReapSchedule};
use crate::error::RegistratorError;
use crate::health::HealthCheckManager;
use crate::host::{HostIdentity, MetadataHostIdentity, StaticHostIdentity};
use crate::reconciler::{HealthCheckTarget, RecordTarget, Reconciler};
use crate::registry::{DnsRegistry, Route53Registry, Tag};
use crate::runtime::{ContainerRuntime, DockerRuntime};
use crate::status;

/// Keeps this host's record in sync with the watched container.
pub struct Registrator {
    config: RegistratorConfig,
}

impl Registrator {
    /// Create a registrator with the given configuration.
    pub fn new(config: RegistratorConfig) -> Self {
        Self { config }
    }

    /// Connect to Docker, Route53 and the metadata service, then run until
    /// the tripwire is triggered.
    pub async fn run(self, tripwire: Tripwire) -> Result<(), RegistratorError> {
        self.config.validate()?;

        info!(
            container = %self.config.container,
            zone_id = %self.config.zone_id,
            cname = %self.config.cname,
            region = %self.config.region,
            "Starting route53-registrator"
        );

        let docker = DockerRuntime::connect(self.config.docker_host.as_deref())?;
        docker.ping().await?;
        info!("Connected to Docker");

        let identity: Box<dyn HostIdentity> = match &self.config.host_value {
            Some(value) => Box::new(StaticHostIdentity(value.clone())),
            None => Box::new(MetadataHostIdentity::new(
                &self.config.metadata_addr,
                Duration::from_secs(self.config.registry.call_timeout_secs),
            )?),
        };
        let host_value = identity.resolve().await?;
        info!(host = %host_value, "Resolved host identity");

        let registry: Arc<dyn DnsRegistry> =
            Arc::new(Route53Registry::from_env(&self.config.region).await);

        self.run_with(Arc::new(docker), registry, host_value, tripwire)
            .await
    }

    /// Run against already-built collaborators.
    pub async fn run_with(
        self,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn DnsRegistry>,
        host_value: String,
        tripwire: Tripwire,
    ) -> Result<(), RegistratorError> {
        let dispatcher = self.build_dispatcher(runtime, registry, host_value);

        let status_handle = self.config.status_addr.map(|addr| {
            let shutdown = tripwire.clone();
            tokio::spawn(async move {
                if let Err(e) = status::serve(addr, shutdown).await {
                    error!("Status endpoint error: {}", e);
                }
            })
        });

        let result = self.run_dispatcher(&dispatcher, tripwire).await;

        if self.config.deregister_on_shutdown {
            info!("Deregistering before exit");
            if let Err(e) = dispatcher.deregister().await {
                warn!(error = %e, "Deregistration on shutdown failed");
            }
        }

        if let Some(handle) = status_handle {
            if result.is_err() {
                handle.abort();
            }
            let _ = handle.await;
        }

        info!("Registrator stopped");
        result
    }

    async fn run_dispatcher(
        &self,
        dispatcher: &Dispatcher,
        tripwire: Tripwire,
    ) -> Result<(), RegistratorError> {
        info!(host = dispatcher.host_value(), "Watching container events...");
        dispatcher.run(tripwire).await
    }

    fn build_dispatcher(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn DnsRegistry>,
        host_value: String,
    ) -> Dispatcher {
        let config = &self.config;
        let retry = config.retry_policy();

        let owner_value = config
            .health_check
            .owner_tag_value
            .clone()
            .unwrap_or_else(|| host_value.clone());
        let health = HealthCheckManager::new(
            registry.clone(),
            retry.clone(),
            Tag::new(&config.health_check.owner_tag_key, owner_value),
        )
        .with_probe_settings(
            config.health_check.failure_threshold,
            config.health_check.request_interval_secs,
        );

        let reconciler = Reconciler::new(
            registry,
            health.clone(),
            retry,
            RecordTarget {
                zone_id: config.zone_id.clone(),
                cname: config.cname.clone(),
                ttl: config.record.ttl,
                weight: config.record.weight,
            },
            Some(HealthCheckTarget {
                port: config.health_check.port,
                path: config.health_check.path.clone(),
                delete_on_deregister: config.health_check.delete_on_deregister,
            }),
        );

        let mut dispatcher = Dispatcher::new(runtime, reconciler, health, &config.container, host_value)
            .with_exit_on_fatal(config.exit_on_fatal);
        if let Some(secs) = config.health_check.reap_interval_secs {
            dispatcher = dispatcher.with_reaper(ReapSchedule {
                interval: Duration::from_secs(secs),
                grace_period: Duration::from_secs(config.health_check.grace_period_secs),
            });
        }
        dispatcher
    }
}
