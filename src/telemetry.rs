//! Logging, metrics export and trace export for route53-registrator.
//!
//! One subscriber is installed: an `EnvFilter` (RUST_LOG wins over the
//! configured level), a text or JSON fmt layer, and with the `otel` feature an
//! OTLP layer whose resource identifies the watched container and record.

#[cfg(feature = "prometheus")]
use std::net::SocketAddr;
#[cfg(any(feature = "prometheus", feature = "otel"))]
use tracing::info;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Config, LogFormat};

#[cfg(feature = "otel")]
static TRACER_PROVIDER: std::sync::OnceLock<opentelemetry_sdk::trace::SdkTracerProvider> =
    std::sync::OnceLock::new();

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Install the tracing subscriber and, when configured, the exporters.
pub fn init(config: &Config) -> Result<(), BoxError> {
    let telemetry = &config.telemetry;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&telemetry.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer(telemetry.log_format))
        .with(otel_layer(config)?)
        .init();

    #[cfg(feature = "otel")]
    if let Some(otel) = &telemetry.opentelemetry {
        info!(endpoint = %otel.endpoint, "OpenTelemetry tracing enabled");
    }

    #[cfg(feature = "prometheus")]
    if let Some(addr) = telemetry.prometheus_addr {
        start_prometheus_exporter(addr)?;
    }

    Ok(())
}

fn fmt_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Text => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    }
}

/// Resource fields describing this registrator instance.
///
/// The host identity is only known here when it is configured statically;
/// a metadata lookup happens after telemetry is up.
pub fn resource_fields(config: &Config) -> Vec<(&'static str, String)> {
    let registrator = &config.registrator;
    let service_name = config
        .telemetry
        .opentelemetry
        .as_ref()
        .map(|otel| otel.service_name.clone())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let mut fields = vec![
        ("service.name", service_name),
        ("service.version", env!("CARGO_PKG_VERSION").to_string()),
        ("cloud.region", registrator.region.clone()),
        ("r53.container", registrator.container.clone()),
        ("r53.zone_id", registrator.zone_id.clone()),
        ("r53.cname", registrator.cname.clone()),
    ];
    if let Some(host) = &registrator.host_value {
        fields.push(("host.name", host.clone()));
    }
    fields
}

#[cfg(feature = "otel")]
fn otel_layer<S>(config: &Config) -> Result<Option<Box<dyn Layer<S> + Send + Sync + 'static>>, BoxError>
where
    S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    use opentelemetry::trace::TracerProvider;
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use opentelemetry_sdk::Resource;

    let Some(otel) = &config.telemetry.opentelemetry else {
        return Ok(None);
    };

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&otel.endpoint)
        .build()?;

    let resource = Resource::builder()
        .with_attributes(
            resource_fields(config)
                .into_iter()
                .map(|(key, value)| KeyValue::new(key, value)),
        )
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource)
        .build();
    let tracer = provider.tracer(env!("CARGO_PKG_NAME"));
    let _ = TRACER_PROVIDER.set(provider);

    Ok(Some(tracing_opentelemetry::layer().with_tracer(tracer).boxed()))
}

#[cfg(not(feature = "otel"))]
fn otel_layer(_config: &Config) -> Result<Option<tracing_subscriber::layer::Identity>, BoxError> {
    Ok(None)
}

#[cfg(feature = "prometheus")]
fn start_prometheus_exporter(addr: SocketAddr) -> Result<(), BoxError> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new().with_http_listener(addr).install()?;
    info!(%addr, "Prometheus metrics exporter started");
    Ok(())
}

/// Flush buffered spans.
pub fn shutdown() {
    #[cfg(feature = "otel")]
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            tracing::warn!("Error shutting down tracer provider: {}", e);
        }
    }
}
