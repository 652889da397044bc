//! berth control service binary.
//!
//! Runs the control plane for deploying model-serving workers.

use tracing::info;
use tracing_subscriber::EnvFilter;

use berth_control::{ControlConfig, ControlService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("berth_control=info".parse()?),
        )
        .init();

    info!("berth control service starting");

    let config = ControlConfig::load().unwrap_or_else(|e| {
        info!(error = %e, "failed to load config, using defaults");
        ControlConfig::default()
    });

    let port_range = format!("{}-{}", config.ports.min, config.ports.max);
    info!(
        listen_addr = %config.server.listen_addr,
        catalog = %config.catalog.path.display(),
        port_range = %port_range,
        "configuration loaded"
    );

    let service = ControlService::new(config);
    service.run().await?;

    Ok(())
}
