//! gNMI service exposed to downstream consumers.
//!
//! Subscribe is served from the cache through a [`Session`] per call; Get and
//! Set are fanned out to the targets directly. Capabilities is answered
//! locally and is not admission controlled.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use crate::admission::AdmissionControl;
use crate::cache::Cache;
use crate::error::GatewayError;
use crate::fanout::Fanout;
use crate::gnmi::g_nmi_server::{GNmi, GNmiServer};
use crate::gnmi::subscribe_request::Request as SubscribeKind;
use crate::gnmi::{
    CapabilityRequest, CapabilityResponse, Encoding, GetRequest, GetResponse, SetRequest,
    SetResponse, SubscribeRequest, SubscribeResponse,
};
use crate::session::{Session, SessionConfig};

/// gNMI protocol version implemented by the gateway.
pub const GNMI_VERSION: &str = "0.7.0";

/// Outgoing messages buffered per subscribe stream.
const SUBSCRIBE_BUFFER: usize = 128;

/// Implementation of the gNMI gRPC service.
pub struct GnmiService {
    cache: Arc<Cache>,
    admission: AdmissionControl,
    fanout: Fanout,
    session_config: SessionConfig,
    shutdown: CancellationToken,
    next_session: AtomicU64,
}

impl GnmiService {
    pub fn new(
        cache: Arc<Cache>,
        admission: AdmissionControl,
        fanout: Fanout,
        session_config: SessionConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cache,
            admission,
            fanout,
            session_config,
            shutdown,
            next_session: AtomicU64::new(1),
        }
    }

    /// Wrap into a tonic service.
    pub fn into_server(self) -> GNmiServer<Self> {
        GNmiServer::new(self)
    }
}

#[tonic::async_trait]
impl GNmi for GnmiService {
    async fn capabilities(
        &self,
        _request: Request<CapabilityRequest>,
    ) -> Result<Response<CapabilityResponse>, Status> {
        Ok(Response::new(CapabilityResponse {
            supported_models: Vec::new(),
            supported_encodings: [
                Encoding::Json,
                Encoding::JsonIetf,
                Encoding::Proto,
                Encoding::Ascii,
            ]
            .map(|e| e as i32)
            .to_vec(),
            g_nmi_version: GNMI_VERSION.to_string(),
            ..Default::default()
        }))
    }

    async fn get(&self, request: Request<GetRequest>) -> Result<Response<GetResponse>, Status> {
        let _permit = self.admission.try_unary().map_err(GatewayError::from)?;
        let request = request.into_inner();

        if request.path.is_empty() {
            return Err(Status::invalid_argument("Get request has no paths"));
        }

        let response = self.fanout.get(request).await?;
        Ok(Response::new(response))
    }

    async fn set(&self, request: Request<SetRequest>) -> Result<Response<SetResponse>, Status> {
        let _permit = self.admission.try_unary().map_err(GatewayError::from)?;
        let request = request.into_inner();

        if request.delete.is_empty() && request.replace.is_empty() && request.update.is_empty() {
            return Err(Status::invalid_argument("Set request has no operations"));
        }

        let response = self.fanout.set(request).await?;
        Ok(Response::new(response))
    }

    type SubscribeStream = ReceiverStream<Result<SubscribeResponse, Status>>;

    async fn subscribe(
        &self,
        request: Request<Streaming<SubscribeRequest>>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let permit = self.admission.try_subscription().map_err(GatewayError::from)?;
        let mut inbound = request.into_inner();

        let list = match inbound.message().await? {
            Some(SubscribeRequest {
                request: Some(SubscribeKind::Subscribe(list)),
                ..
            }) => list,
            Some(_) => {
                return Err(Status::invalid_argument(
                    "first request must carry a subscription list",
                ));
            }
            None => return Err(Status::invalid_argument("no subscription list received")),
        };

        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(
            id,
            Arc::clone(&self.cache),
            self.session_config,
            list,
            &self.shutdown,
        )?;

        info!(session = id, "Subscription started");

        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        tokio::spawn(async move {
            // Released once the session has fully torn down
            let _permit = permit;
            if let Err(e) = session.run(inbound, tx).await {
                debug!(session = id, error = %e, "Subscription ended with error");
            }
            info!(session = id, "Subscription closed");
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
