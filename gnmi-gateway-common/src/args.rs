//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments for the gateway binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "gnmi-gateway")]
#[command(about = "gNMI telemetry gateway: caches target telemetry and serves it to many consumers")]
pub struct GatewayArgs {
    /// Path to configuration file.
    #[arg(short, long, default_value = "gnmi-gateway.json5")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl GatewayArgs {
    /// Parse arguments from the process command line.
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
