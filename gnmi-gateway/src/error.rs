//! Error types for the gateway.

use thiserror::Error;
use tonic::Status;

use crate::admission::AdmissionError;
use crate::cache::CacheError;

/// Result type alias using [`GatewayError`].
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Errors surfaced by the gateway core and its RPC handlers.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed request from a client.
    #[error("Invalid request: {0}")]
    InvalidArgument(String),

    /// Target name that is neither registered nor present in the cache.
    #[error("Unknown target: {0}")]
    TargetNotFound(String),

    /// Admission limits reached.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// At least one per-target attempt of a fanned-out call failed.
    #[error("Request to target {target} failed: {}", .cause.message())]
    Aggregate { target: String, cause: Status },

    /// Cache rejected an operation.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// gRPC status returned by a peer.
    #[error("gRPC error: {0}")]
    Rpc(#[from] Status),

    /// gRPC transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Configuration loading or validation failure.
    #[error(transparent)]
    Config(#[from] gnmi_gateway_common::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Create an invalid-argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

impl From<GatewayError> for Status {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::InvalidArgument(msg) => Status::invalid_argument(msg),
            GatewayError::TargetNotFound(_) | GatewayError::Cache(CacheError::UnknownTarget(_)) => {
                Status::not_found(err.to_string())
            }
            GatewayError::Cache(CacheError::MissingTarget) => {
                Status::invalid_argument(err.to_string())
            }
            GatewayError::Admission(_) => Status::resource_exhausted(err.to_string()),
            GatewayError::Aggregate { .. } => Status::internal(err.to_string()),
            GatewayError::Rpc(status) => status,
            other => Status::unknown(other.to_string()),
        }
    }
}
