//! gNMI telemetry gateway
//!
//! Subscribes to gNMI-enabled network devices, caches their telemetry and
//! serves it to downstream gNMI clients.

use tracing::info;

use gnmi_gateway::{GatewayConfig, GatewayRunner};
use gnmi_gateway_common::{ConfigFile, GatewayArgs, init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = GatewayArgs::parse();

    let config = GatewayConfig::load(&args.config)?;

    let logging = config
        .logging()
        .with_level_override(args.log_level.as_deref());
    init_tracing(&logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        targets = config.targets.len(),
        "Starting gNMI gateway"
    );

    GatewayRunner::new(config).run().await?;
    Ok(())
}
