//! Gateway configuration

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use gnmi_gateway_common::{ConfigFile, Error, LoggingConfig};
use serde::{Deserialize, Serialize};

use crate::gnmi;
use crate::session::SessionConfig;

/// Top-level configuration for the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// gNMI server settings
    #[serde(default)]
    pub server: ServerSettings,

    /// Target devices
    #[serde(default)]
    pub targets: Vec<TargetConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings of the gNMI server exposed to consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Listen address (e.g., "0.0.0.0:9339")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Maximum concurrent subscribe streams
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: usize,

    /// Maximum concurrent Get/Set calls
    #[serde(default = "default_max_unary_rpc")]
    pub max_unary_rpc: usize,

    /// Sample interval used when a SAMPLE subscription asks for 0
    #[serde(default = "default_interval_ms")]
    pub default_sample_interval_ms: u64,

    /// Lower bound for sample intervals
    #[serde(default = "default_interval_ms")]
    pub min_sample_interval_ms: u64,

    /// Lower bound for heartbeat intervals
    #[serde(default = "default_interval_ms")]
    pub min_heartbeat_interval_ms: u64,

    /// TLS for the server side
    #[serde(default)]
    pub tls: Option<ServerTls>,
}

/// Server certificate and optional client CA
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerTls {
    /// Path to the PEM certificate
    pub cert: String,

    /// Path to the PEM private key
    pub key: String,

    /// Path to a CA used to verify client certificates
    #[serde(default)]
    pub client_ca: Option<String>,
}

/// A gNMI target device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Name clients use to address the target
    pub name: String,

    /// gRPC endpoint (e.g., "192.168.1.1:9339")
    pub address: String,

    /// Authentication credentials
    #[serde(default)]
    pub credentials: Option<Credentials>,

    /// TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Paths streamed from the target into the cache
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,

    /// gNMI encoding for requests
    #[serde(default)]
    pub encoding: GnmiEncoding,

    /// Per-request timeout for Get/Set in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// Delay before reconnecting a failed subscription, in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
}

/// Authentication credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Username for authentication
    pub username: String,

    /// Password for authentication
    pub password: String,
}

/// TLS configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Enable TLS
    #[serde(default)]
    pub enabled: bool,

    /// Skip certificate verification (not recommended for production)
    #[serde(default)]
    pub skip_verify: bool,

    /// Path to CA certificate file
    #[serde(default)]
    pub ca_cert: Option<String>,

    /// Path to client certificate file
    #[serde(default)]
    pub client_cert: Option<String>,

    /// Path to client key file
    #[serde(default)]
    pub client_key: Option<String>,
}

/// A subscription the gateway holds toward a target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// XPath-like path to subscribe to
    pub path: String,

    /// Subscription mode
    #[serde(default)]
    pub mode: SubscriptionMode,

    /// Sample interval in milliseconds (for SAMPLE mode)
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Suppress redundant updates
    #[serde(default)]
    pub suppress_redundant: bool,

    /// Heartbeat interval in milliseconds
    #[serde(default)]
    pub heartbeat_interval_ms: u64,
}

/// Subscription mode
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionMode {
    /// Stream updates as they occur
    #[default]
    OnChange,

    /// Sample at fixed intervals
    Sample,

    /// Target determines update timing
    TargetDefined,
}

/// gNMI encoding format
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GnmiEncoding {
    /// JSON encoding
    #[default]
    Json,

    /// JSON with IETF formatting
    JsonIetf,

    /// Protocol Buffers
    Proto,

    /// ASCII text
    Ascii,
}

fn default_listen() -> String {
    "0.0.0.0:9339".to_string()
}

fn default_max_subscriptions() -> usize {
    64
}

fn default_max_unary_rpc() -> usize {
    64
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_sample_interval() -> u64 {
    10000 // 10 seconds
}

fn default_timeout() -> u64 {
    10000
}

fn default_retry_interval() -> u64 {
    5000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_subscriptions: default_max_subscriptions(),
            max_unary_rpc: default_max_unary_rpc(),
            default_sample_interval_ms: default_interval_ms(),
            min_sample_interval_ms: default_interval_ms(),
            min_heartbeat_interval_ms: default_interval_ms(),
            tls: None,
        }
    }
}

impl ServerSettings {
    /// Parsed listen address.
    pub fn listen_addr(&self) -> gnmi_gateway_common::Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| Error::validation(format!("invalid listen address '{}': {}", self.listen, e)))
    }

    /// Interval bounds applied to subscribe sessions.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            default_sample_interval: Duration::from_millis(self.default_sample_interval_ms),
            min_sample_interval: Duration::from_millis(self.min_sample_interval_ms),
            min_heartbeat_interval: Duration::from_millis(self.min_heartbeat_interval_ms),
        }
    }
}

impl TargetConfig {
    /// Minimal target: no credentials, plain-text, no subscriptions.
    pub fn new(name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            credentials: None,
            tls: TlsConfig::default(),
            subscriptions: Vec::new(),
            encoding: GnmiEncoding::default(),
            timeout_ms: default_timeout(),
            retry_interval_ms: default_retry_interval(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

impl ConfigFile for GatewayConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> gnmi_gateway_common::Result<()> {
        self.server.listen_addr()?;

        if self.server.max_subscriptions == 0 || self.server.max_unary_rpc == 0 {
            return Err(Error::validation("admission limits must be greater than zero"));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.is_empty() {
                return Err(Error::validation("target name must not be empty"));
            }
            if target.address.is_empty() {
                return Err(Error::validation(format!(
                    "target '{}' has no address",
                    target.name
                )));
            }
            if !names.insert(target.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate target name '{}'",
                    target.name
                )));
            }
        }

        Ok(())
    }
}

impl SubscriptionMode {
    /// Convert to the gNMI proto subscription mode
    pub fn to_proto(self) -> gnmi::SubscriptionMode {
        match self {
            SubscriptionMode::OnChange => gnmi::SubscriptionMode::OnChange,
            SubscriptionMode::Sample => gnmi::SubscriptionMode::Sample,
            SubscriptionMode::TargetDefined => gnmi::SubscriptionMode::TargetDefined,
        }
    }
}

impl GnmiEncoding {
    /// Convert to the gNMI proto encoding
    pub fn to_proto(self) -> gnmi::Encoding {
        match self {
            GnmiEncoding::Json => gnmi::Encoding::Json,
            GnmiEncoding::JsonIetf => gnmi::Encoding::JsonIetf,
            GnmiEncoding::Proto => gnmi::Encoding::Proto,
            GnmiEncoding::Ascii => gnmi::Encoding::Ascii,
        }
    }
}
