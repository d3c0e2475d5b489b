//! Resolves the value this host publishes under the shared CNAME.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::RegistratorError;

/// Path of the public hostname in the EC2 metadata service.
const PUBLIC_HOSTNAME_PATH: &str = "latest/meta-data/public-hostname";

/// Source of the host's externally resolvable name.
#[async_trait]
pub trait HostIdentity: Send + Sync {
    /// The host's public name.
    async fn resolve(&self) -> Result<String, RegistratorError>;
}

/// Reads the public hostname from the EC2 metadata service.
#[derive(Debug, Clone)]
pub struct MetadataHostIdentity {
    client: reqwest::Client,
    url: String,
}

impl MetadataHostIdentity {
    /// `metadata_addr` is a host or `host:port`, e.g. `169.254.169.254`.
    pub fn new(metadata_addr: &str, timeout: Duration) -> Result<Self, RegistratorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: metadata_url(metadata_addr),
        })
    }
}

fn metadata_url(metadata_addr: &str) -> String {
    format!(
        "http://{}/{}",
        metadata_addr.trim_end_matches('/'),
        PUBLIC_HOSTNAME_PATH
    )
}

#[async_trait]
impl HostIdentity for MetadataHostIdentity {
    async fn resolve(&self) -> Result<String, RegistratorError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        let hostname = body.trim().to_string();
        if hostname.is_empty() {
            return Err(RegistratorError::Config(format!(
                "metadata service at {} returned an empty hostname",
                self.url
            )));
        }
        debug!(hostname = %hostname, "resolved host identity");
        Ok(hostname)
    }
}

/// A fixed host identity.
#[derive(Debug, Clone)]
pub struct StaticHostIdentity(pub String);

#[async_trait]
impl HostIdentity for StaticHostIdentity {
    async fn resolve(&self) -> Result<String, RegistratorError> {
        Ok(self.0.clone())
    }
}
