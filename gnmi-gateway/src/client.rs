//! gRPC connections toward targets.

use std::collections::HashMap;

use parking_lot::Mutex;
use tonic::Request;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, warn};

use crate::config::{TargetConfig, TlsConfig};
use crate::error::{GatewayError, Result};
use crate::fanout::TargetClient;
use crate::gnmi::g_nmi_client::GNmiClient;
use crate::gnmi::{GetRequest, GetResponse, SetRequest, SetResponse};

/// Build an endpoint for a target, with TLS when enabled.
pub async fn endpoint(target: &TargetConfig) -> Result<Endpoint> {
    let scheme = if target.tls.enabled { "https" } else { "http" };
    let uri = format!("{}://{}", scheme, target.address);

    let mut endpoint = Endpoint::from_shared(uri)?.connect_timeout(target.timeout());

    if target.tls.enabled {
        let mut tls_config = ClientTlsConfig::new().with_native_roots();

        if target.tls.skip_verify {
            warn!(
                target_name = %target.name,
                "TLS verification cannot be disabled, verifying against configured roots"
            );
        }

        if let Some(ref ca_cert_path) = target.tls.ca_cert {
            let ca_cert = tokio::fs::read(ca_cert_path).await?;
            tls_config = tls_config.ca_certificate(Certificate::from_pem(ca_cert));
        }

        if let (Some(cert_path), Some(key_path)) = (&target.tls.client_cert, &target.tls.client_key)
        {
            let cert = tokio::fs::read(cert_path).await?;
            let key = tokio::fs::read(key_path).await?;
            tls_config = tls_config.identity(Identity::from_pem(cert, key));
        }

        endpoint = endpoint.tls_config(tls_config)?;
    }

    Ok(endpoint)
}

/// Connect to a target.
pub async fn connect(target: &TargetConfig) -> Result<Channel> {
    let channel = endpoint(target).await?.connect().await?;
    Ok(channel)
}

/// Wrap `message` in a request carrying the target's credentials.
pub fn authorized<T>(target: &TargetConfig, message: T) -> Result<Request<T>> {
    let mut request = Request::new(message);

    if let Some(ref creds) = target.credentials {
        let username: AsciiMetadataValue = creds
            .username
            .parse()
            .map_err(|_| GatewayError::invalid("username is not valid metadata"))?;
        let password: AsciiMetadataValue = creds
            .password
            .parse()
            .map_err(|_| GatewayError::invalid("password is not valid metadata"))?;
        request.metadata_mut().insert("username", username);
        request.metadata_mut().insert("password", password);
    }

    Ok(request)
}

// Connection settings a channel was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChannelKey {
    address: String,
    tls: TlsConfig,
    timeout_ms: u64,
}

impl ChannelKey {
    fn of(target: &TargetConfig) -> Self {
        Self {
            address: target.address.clone(),
            tls: target.tls.clone(),
            timeout_ms: target.timeout_ms,
        }
    }
}

/// [`TargetClient`] speaking gNMI over gRPC.
///
/// Channels are created lazily, on first use of a target, and reused while
/// the target's connection settings stay the same.
#[derive(Debug, Default)]
pub struct GrpcTargetClient {
    channels: Mutex<HashMap<String, (ChannelKey, Channel)>>,
}

impl GrpcTargetClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client(&self, target: &TargetConfig) -> Result<GNmiClient<Channel>> {
        let key = ChannelKey::of(target);
        let cached = self
            .channels
            .lock()
            .get(&target.name)
            .filter(|(cached_key, _)| *cached_key == key)
            .map(|(_, channel)| channel.clone());
        if let Some(channel) = cached {
            return Ok(GNmiClient::new(channel));
        }

        let channel = endpoint(target).await?.connect_lazy();
        debug!(target_name = %target.name, address = %target.address, "Created channel");
        self.channels
            .lock()
            .insert(target.name.clone(), (key, channel.clone()));
        Ok(GNmiClient::new(channel))
    }

    /// Drop the cached channel of a target.
    pub fn forget(&self, name: &str) {
        self.channels.lock().remove(name);
    }
}

#[tonic::async_trait]
impl TargetClient for GrpcTargetClient {
    async fn get(
        &self,
        target: &TargetConfig,
        request: GetRequest,
    ) -> std::result::Result<GetResponse, tonic::Status> {
        let mut client = self.client(target).await?;
        let response = client.get(authorized(target, request)?).await?;
        Ok(response.into_inner())
    }

    async fn set(
        &self,
        target: &TargetConfig,
        request: SetRequest,
    ) -> std::result::Result<SetResponse, tonic::Status> {
        let mut client = self.client(target).await?;
        let response = client.set(authorized(target, request)?).await?;
        Ok(response.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    #[test]
    fn test_authorized_adds_credentials() {
        let mut target = TargetConfig::new("r1", "127.0.0.1:9339");
        target.credentials = Some(Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        });

        let request = authorized(&target, ()).unwrap();
        let metadata = request.metadata();
        assert_eq!(metadata.get("username").unwrap().to_str().unwrap(), "admin");
        assert_eq!(metadata.get("password").unwrap().to_str().unwrap(), "secret");

        let plain = authorized(&TargetConfig::new("r2", "127.0.0.1:9339"), ()).unwrap();
        assert!(plain.metadata().get("username").is_none());
    }

    #[test]
    fn test_authorized_rejects_bad_metadata() {
        let mut target = TargetConfig::new("r1", "127.0.0.1:9339");
        target.credentials = Some(Credentials {
            username: "line\nbreak".to_string(),
            password: String::new(),
        });
        assert!(authorized(&target, ()).is_err());
    }

    #[tokio::test]
    async fn test_endpoint_scheme() {
        let target = TargetConfig::new("r1", "127.0.0.1:9339");
        let endpoint = endpoint(&target).await.unwrap();
        assert_eq!(endpoint.uri().scheme_str(), Some("http"));
        assert_eq!(endpoint.uri().port_u16(), Some(9339));

        let mut tls = TargetConfig::new("r2", "127.0.0.1:9339");
        tls.tls.enabled = true;
        tls.tls.ca_cert = Some("/nonexistent/ca.pem".to_string());
        assert!(matches!(
            super::endpoint(&tls).await,
            Err(GatewayError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_channels_are_reused() {
        let client = GrpcTargetClient::new();
        let target = TargetConfig::new("r1", "127.0.0.1:9339");

        client.client(&target).await.unwrap();
        client.client(&target).await.unwrap();
        assert_eq!(client.channels.lock().len(), 1);

        client.forget("r1");
        assert!(client.channels.lock().is_empty());
    }

    #[tokio::test]
    async fn test_changed_settings_replace_channel() {
        let client = GrpcTargetClient::new();
        client
            .client(&TargetConfig::new("r1", "127.0.0.1:9339"))
            .await
            .unwrap();

        let moved = TargetConfig::new("r1", "127.0.0.1:9340");
        client.client(&moved).await.unwrap();
        {
            let channels = client.channels.lock();
            assert_eq!(channels.len(), 1);
            assert_eq!(channels["r1"].0, ChannelKey::of(&moved));
        }

        let mut slower = moved.clone();
        slower.timeout_ms += 1000;
        client.client(&slower).await.unwrap();
        assert_eq!(client.channels.lock()["r1"].0, ChannelKey::of(&slower));
    }
}
