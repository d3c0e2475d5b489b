//! Container runtime events, normalized for the dispatch loop.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::InspectContainerOptions;
use bollard::errors::Error as DockerError;
use bollard::models::EventMessage;
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use chrono::{DateTime, Timelike, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::debug;

use crate::error::RegistratorError;

/// Seconds before a Docker API request is abandoned.
const DOCKER_TIMEOUT_SECS: u64 = 120;

/// Normalized container status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerStatus {
    /// `start`
    Started,
    /// `die` or `stop`
    Stopped,
    /// Anything else, kept for logging.
    Other(String),
}

impl ContainerStatus {
    /// Map a runtime action name.
    pub fn from_action(action: &str) -> Self {
        match action {
            "start" => ContainerStatus::Started,
            "die" | "stop" => ContainerStatus::Stopped,
            other => ContainerStatus::Other(other.to_string()),
        }
    }

    /// Label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            ContainerStatus::Started => "started",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Other(_) => "other",
        }
    }
}

/// A container lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    /// Container id.
    pub container_id: String,
    /// What happened.
    pub status: ContainerStatus,
    /// Container name, if the event carried one.
    pub container_name: Option<String>,
    /// When the runtime recorded the transition.
    pub time: Option<DateTime<Utc>>,
}

/// Container names are reported with a leading `/` by inspect and without
/// one by events; compare the `/`-prefixed form.
pub fn normalize_container_name(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}

/// Stream of lifecycle events. Ends when the subscription closes.
pub type EventStream = BoxStream<'static, Result<LifecycleEvent, RegistratorError>>;

/// Source of container lifecycle events.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Subscribe to lifecycle events. With `since` set, events recorded at or
    /// after that instant are replayed before live ones.
    fn events(&self, since: Option<DateTime<Utc>>) -> EventStream;

    /// Name of the container with the given id, `None` if it no longer exists.
    async fn container_name(&self, container_id: &str) -> Result<Option<String>, RegistratorError>;

    /// True if a container with this name exists and is running.
    async fn is_running(&self, container_name: &str) -> Result<bool, RegistratorError>;
}

/// Docker Engine API runtime.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to `docker_host`, or to `DOCKER_HOST`/the local socket when `None`.
    pub fn connect(docker_host: Option<&str>) -> Result<Self, RegistratorError> {
        let docker = match docker_host {
            Some(host) if host.starts_with("tcp://") || host.starts_with("http://") => {
                Docker::connect_with_http(host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?
            }
            Some(host) => Docker::connect_with_local(host, DOCKER_TIMEOUT_SECS, API_DEFAULT_VERSION)?,
            None => Docker::connect_with_defaults()?,
        };
        Ok(Self { docker })
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> Result<(), RegistratorError> {
        self.docker.ping().await?;
        Ok(())
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn to_lifecycle_event(message: EventMessage) -> Option<LifecycleEvent> {
    let action = message.action?;
    let actor = message.actor?;
    let container_id = actor.id?;
    let container_name = actor
        .attributes
        .and_then(|mut attributes| attributes.remove("name"));

    Some(LifecycleEvent {
        container_id,
        status: ContainerStatus::from_action(&action),
        container_name,
        time: message.time.and_then(|secs| DateTime::from_timestamp(secs, 0)),
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn events(&self, since: Option<DateTime<Utc>>) -> EventStream {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);

        // The daemon compares whole seconds; flooring never skips an event.
        let since = since.map(|at| at.with_nanosecond(0).unwrap_or(at));
        let options = EventsOptions::<String> {
            since,
            filters,
            ..Default::default()
        };

        self.docker
            .events(Some(options))
            .filter_map(|result| async move {
                match result {
                    Ok(message) => {
                        let event = to_lifecycle_event(message);
                        if event.is_none() {
                            debug!("skipping container event without actor");
                        }
                        event.map(Ok)
                    }
                    Err(e) => Some(Err(RegistratorError::from(e))),
                }
            })
            .boxed()
    }

    async fn container_name(&self, container_id: &str) -> Result<Option<String>, RegistratorError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details.name),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_running(&self, container_name: &str) -> Result<bool, RegistratorError> {
        let name = container_name.trim_start_matches('/');
        match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::EventActor;

    #[test]
    fn test_normalize_adds_slash() {
        assert_eq!(normalize_container_name("docker-registry"), "/docker-registry");
    }

    #[test]
    fn test_normalize_keeps_existing_slash() {
        assert_eq!(normalize_container_name("/docker-registry"), "/docker-registry");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(ContainerStatus::from_action("start"), ContainerStatus::Started);
        assert_eq!(ContainerStatus::from_action("die"), ContainerStatus::Stopped);
        assert_eq!(ContainerStatus::from_action("stop"), ContainerStatus::Stopped);
        assert_eq!(
            ContainerStatus::from_action("pause"),
            ContainerStatus::Other("pause".into())
        );
    }

    #[test]
    fn test_event_message_conversion() {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), "docker-registry".to_string());
        let message = EventMessage {
            action: Some("die".into()),
            time: Some(1_700_000_000),
            actor: Some(EventActor {
                id: Some("abc123".into()),
                attributes: Some(attributes),
            }),
            ..Default::default()
        };

        let event = to_lifecycle_event(message).unwrap();
        assert_eq!(event.container_id, "abc123");
        assert_eq!(event.status, ContainerStatus::Stopped);
        assert_eq!(event.container_name.as_deref(), Some("docker-registry"));
        assert_eq!(event.time.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn test_event_without_actor_is_skipped() {
        let message = EventMessage {
            action: Some("start".into()),
            ..Default::default()
        };
        assert!(to_lifecycle_event(message).is_none());
    }
}
