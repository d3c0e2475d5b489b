//! Route53 Registrator - keeps a weighted CNAME and its health check in sync
//! with one watched container.
//!
//! Every host running the watched container publishes a weighted CNAME entry
//! under a shared name, keyed by its own public hostname. When the container
//! starts the entry (and an HTTP health check gating it) is created; when the
//! container stops the entry is removed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     route53-registrator                      │
//! │                                                              │
//! │  ┌──────────────┐   ┌────────────┐   ┌──────────────────┐    │
//! │  │ Docker events│──▶│ Dispatcher │──▶│    Reconciler    │    │
//! │  │ (runtime)    │   │ (1 at once)│   │ probe → mutate   │    │
//! │  └──────────────┘   └─────┬──────┘   └───┬──────────┬───┘    │
//! │                           │ reap         │          │        │
//! │                           ▼              ▼          │        │
//! │                   ┌──────────────────────────┐      │        │
//! │                   │   HealthCheckManager     │      │        │
//! │                   └────────────┬─────────────┘      │        │
//! │                                ▼                    ▼        │
//! │                   ┌──────────────────────────────────────┐   │
//! │                   │      DnsRegistry (Route53)           │   │
//! │                   └──────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing is cached locally: each reconciliation lists the zone and the
//! health checks again before deciding what to change.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use route53_registrator::{Registrator, RegistratorConfig};
//! use tripwire::Tripwire;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = RegistratorConfig {
//!         zone_id: "Z1P7DHMHEAX6O3".to_string(),
//!         cname: "registry.example.com".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let (tripwire, worker) = Tripwire::new_signals();
//!     tokio::spawn(worker);
//!
//!     Registrator::new(config).run(tripwire).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod host;
pub mod metrics;
pub mod reconciler;
pub mod registrator;
pub mod registry;
pub mod retry;
pub mod runtime;
pub mod status;
pub mod telemetry;

// Re-export main types
pub use config::{Config, RegistratorConfig, TelemetryConfig};
pub use dispatch::Dispatcher;
pub use error::{ErrorClass, RegistratorError, RegistryError};
pub use health::HealthCheckManager;
pub use reconciler::{Outcome, Reconciler};
pub use registrator::Registrator;
pub use registry::DnsRegistry;
