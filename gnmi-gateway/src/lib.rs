//! gNMI telemetry gateway
//!
//! The gateway subscribes to gNMI-enabled network devices ("targets"), keeps
//! the latest value of every leaf they report in a shared [`Cache`], and
//! serves those values to many downstream gNMI clients. Live updates are
//! routed to interested subscriptions through the [`Matcher`] and delivered
//! through a per-subscription [`CoalescingQueue`]. Point-in-time Get and Set
//! calls are fanned out to the targets directly by [`Fanout`].

pub mod admission;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod matcher;
pub mod path;
pub mod queue;
pub mod registry;
pub mod runner;
pub mod server;
pub mod session;
pub mod subscriber;

// Include the generated protobuf code
pub mod gnmi_ext {
    tonic::include_proto!("gnmi_ext");
}

pub mod gnmi {
    tonic::include_proto!("gnmi");
}

pub use admission::{AdmissionControl, AdmissionError};
pub use cache::{Cache, CacheError, Leaf, LeafValue};
pub use client::GrpcTargetClient;
pub use config::{GatewayConfig, ServerSettings, TargetConfig};
pub use error::{GatewayError, Result};
pub use fanout::{Fanout, TargetClient};
pub use matcher::{Matcher, QueryHandle};
pub use path::Elem;
pub use queue::{Coalesce, CoalescingQueue, QueueError};
pub use registry::TargetRegistry;
pub use runner::GatewayRunner;
pub use server::GnmiService;
pub use session::{Delivery, Session, SessionConfig, SessionState};
pub use subscriber::TargetSubscriber;

/// Current wall-clock time as gNMI nanoseconds since the Unix epoch.
pub fn timestamp_nanos() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
