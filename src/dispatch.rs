//! Event dispatch loop: one event at a time, in arrival order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::time::{interval_at, sleep, Instant, Interval};
use tracing::{debug, error, info, warn};

use crate::error::RegistratorError;
use crate::health::HealthCheckManager;
use crate::metrics;
use crate::reconciler::{Outcome, Reconciler};
use crate::runtime::{normalize_container_name, ContainerRuntime, ContainerStatus, LifecycleEvent};

const MAX_BACKOFF_SECS: u64 = 30;

/// Periodic deletion of stale owned health checks.
#[derive(Debug, Clone, Copy)]
pub struct ReapSchedule {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long a failure must persist before a check is reaped.
    pub grace_period: Duration,
}

/// Why [`Dispatcher::process_stream`] returned.
#[derive(Debug)]
pub enum StreamEnd {
    /// The shutdown future resolved.
    Shutdown,
    /// The runtime closed the stream.
    Closed,
    /// The stream yielded an error.
    Failed(RegistratorError),
}

/// Routes lifecycle events for the watched container to the reconciler.
pub struct Dispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    reconciler: Reconciler,
    health: HealthCheckManager,
    container: String,
    host_value: String,
    reap: Option<ReapSchedule>,
    exit_on_fatal: bool,
}

impl Dispatcher {
    /// Watch `container` and publish `host_value` for it.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        reconciler: Reconciler,
        health: HealthCheckManager,
        container: &str,
        host_value: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            reconciler,
            health,
            container: normalize_container_name(container),
            host_value: host_value.into(),
            reap: None,
            exit_on_fatal: true,
        }
    }

    /// Enable periodic reaping.
    pub fn with_reaper(mut self, schedule: ReapSchedule) -> Self {
        self.reap = Some(schedule);
        self
    }

    /// Whether a fatal reconciliation error stops the loop.
    pub fn with_exit_on_fatal(mut self, exit_on_fatal: bool) -> Self {
        self.exit_on_fatal = exit_on_fatal;
        self
    }

    /// The value published for this host.
    pub fn host_value(&self) -> &str {
        &self.host_value
    }

    /// Bring the registry in line with the container's current state.
    pub async fn sync_initial_state(&self) -> Result<Outcome, RegistratorError> {
        let running = self.runtime.is_running(&self.container).await?;
        info!(container = %self.container, running, "probed watched container");
        let outcome = if running {
            self.reconciler.register(&self.host_value).await?
        } else {
            self.reconciler.deregister(&self.host_value).await?
        };
        Ok(outcome)
    }

    /// Remove this host's record, e.g. before exiting.
    pub async fn deregister(&self) -> Result<Outcome, RegistratorError> {
        Ok(self.reconciler.deregister(&self.host_value).await?)
    }

    /// Handle one event. Returns `None` when the event is ignored.
    pub async fn handle_event(
        &self,
        event: &LifecycleEvent,
    ) -> Result<Option<Outcome>, RegistratorError> {
        let name = match &event.container_name {
            Some(name) => Some(name.clone()),
            None => self.runtime.container_name(&event.container_id).await?,
        };
        let matched = name
            .as_deref()
            .map(|n| normalize_container_name(n) == self.container)
            .unwrap_or(false);
        metrics::record_lifecycle_event(event.status.label(), matched);

        if !matched {
            debug!(
                container_id = %event.container_id,
                container_name = ?name,
                "ignoring event for other container"
            );
            return Ok(None);
        }

        let outcome = match &event.status {
            ContainerStatus::Started => {
                info!(container = %self.container, "watched container started");
                self.reconciler.register(&self.host_value).await?
            }
            ContainerStatus::Stopped => {
                info!(container = %self.container, "watched container stopped");
                self.reconciler.deregister(&self.host_value).await?
            }
            ContainerStatus::Other(action) => {
                debug!(container = %self.container, action = %action, "ignoring event");
                return Ok(None);
            }
        };

        debug!(outcome = ?outcome, "reconciled");
        Ok(Some(outcome))
    }

    /// Consume `events` until it ends, fails, or `shutdown` resolves.
    ///
    /// Errors from individual reconciliations are logged and the next event is
    /// processed, unless the error is fatal and `exit_on_fatal` is set.
    pub async fn process_stream<S, F>(
        &self,
        mut events: S,
        shutdown: F,
    ) -> Result<StreamEnd, RegistratorError>
    where
        S: Stream<Item = Result<LifecycleEvent, RegistratorError>> + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut reap_interval = self
            .reap
            .map(|s| interval_at(Instant::now() + s.interval, s.interval));

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("dispatch loop received shutdown signal");
                    return Ok(StreamEnd::Shutdown);
                }

                _ = tick(&mut reap_interval) => {
                    self.reap().await;
                }

                next = events.next() => {
                    match next {
                        Some(Ok(event)) => {
                            if let Err(e) = self.handle_event(&event).await {
                                if e.is_fatal() && self.exit_on_fatal {
                                    error!(error = %e, "fatal reconciliation error");
                                    return Err(e);
                                }
                                error!(
                                    container_id = %event.container_id,
                                    error = %e,
                                    "reconciliation failed, continuing"
                                );
                            }
                        }
                        Some(Err(e)) => return Ok(StreamEnd::Failed(e)),
                        None => return Ok(StreamEnd::Closed),
                    }
                }
            }
        }
    }

    /// Reconcile the container's current state, then dispatch its events
    /// until `shutdown` resolves. Whenever the subscription drops it is
    /// reopened with backoff and the state is reconciled again.
    ///
    /// Each subscription replays events from an instant taken before the
    /// probe, so a transition racing the probe is still delivered.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), RegistratorError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut backoff_secs = 1u64;

        loop {
            let since = Utc::now();
            match self.sync_initial_state().await {
                Ok(outcome) => info!(outcome = ?outcome, "reconciled current container state"),
                Err(e) if e.is_fatal() && self.exit_on_fatal => return Err(e),
                Err(e) => error!(error = %e, "reconciling current container state failed"),
            }

            let events = self.runtime.events(Some(since));
            let started = Instant::now();

            match self.process_stream(events, &mut shutdown).await? {
                StreamEnd::Shutdown => return Ok(()),
                StreamEnd::Closed => warn!("container event stream ended"),
                StreamEnd::Failed(e) => warn!(error = %e, "container event stream failed"),
            }
            metrics::record_event_stream_reconnect();

            // A subscription that stayed up for a while resets the backoff.
            if started.elapsed() > Duration::from_secs(MAX_BACKOFF_SECS) {
                backoff_secs = 1;
            }

            tokio::select! {
                biased;
                _ = &mut shutdown => return Ok(()),
                _ = sleep(Duration::from_secs(backoff_secs)) => {}
            }
            backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn reap(&self) {
        let Some(schedule) = self.reap else {
            return;
        };
        match self.health.reap_stale(schedule.grace_period).await {
            Ok(0) => debug!("no stale health checks"),
            Ok(count) => info!(count, "reaped stale health checks"),
            Err(e) => warn!(error = %e, "stale health check sweep failed"),
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
