//! route53-registrator binary entry point.

use clap::Parser;
use route53_registrator::{telemetry, Config, Registrator};
use std::path::PathBuf;
use tracing::{error, info};
use tripwire::Tripwire;

/// Keeps a weighted Route53 CNAME in sync with a Docker container.
#[derive(Parser, Debug)]
#[command(name = "route53-registrator")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML). Optional.
    #[arg(short, long, default_value = "route53-registrator.toml")]
    config: PathBuf,

    /// The container to watch.
    #[arg(long, env = "R53_CONTAINER")]
    container: Option<String>,

    /// The address of the metadata service.
    #[arg(long, env = "R53_METADATA")]
    metadata: Option<String>,

    /// The region for route53 records.
    #[arg(long, env = "R53_REGION")]
    region: Option<String>,

    /// The route53 hosted zone id.
    #[arg(long, env = "R53_ZONE")]
    zone: Option<String>,

    /// The CNAME for the record set.
    #[arg(long, env = "R53_CNAME")]
    cname: Option<String>,

    /// Port probed by the health check.
    #[arg(long, env = "R53_HEALTH_CHECK_PORT")]
    health_check_port: Option<u16>,

    /// Path requested by the health check.
    #[arg(long, env = "R53_HEALTH_CHECK_PATH")]
    health_check_path: Option<String>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        let registrator = &mut config.registrator;
        if let Some(container) = self.container {
            registrator.container = container;
        }
        if let Some(metadata) = self.metadata {
            registrator.metadata_addr = metadata;
        }
        if let Some(region) = self.region {
            registrator.region = region;
        }
        if let Some(zone) = self.zone {
            registrator.zone_id = zone;
        }
        if let Some(cname) = self.cname {
            registrator.cname = cname;
        }
        if let Some(port) = self.health_check_port {
            registrator.health_check.port = port;
        }
        if let Some(path) = self.health_check_path {
            registrator.health_check.path = path;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration: file, then environment, then flags
    let mut config: Config = config::Config::builder()
        .add_source(config::File::from(args.config.clone()).required(false))
        .add_source(
            config::Environment::with_prefix("R53_REGISTRATOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;
    let config_file = args.config.clone();
    args.apply(&mut config);

    telemetry::init(&config).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        config_file = %config_file.display(),
        container = %config.registrator.container,
        zone_id = %config.registrator.zone_id,
        cname = %config.registrator.cname,
        "Starting route53-registrator"
    );

    // Setup graceful shutdown
    let (tripwire, tripwire_worker) = Tripwire::new_signals();
    tokio::spawn(tripwire_worker);

    let result = Registrator::new(config.registrator).run(tripwire).await;

    telemetry::shutdown();

    if let Err(e) = result {
        error!("Registrator error: {}", e);
        return Err(e.into());
    }

    info!("route53-registrator shutdown complete");
    Ok(())
}
