//! Gateway runner for lifecycle management.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{error, info, warn};

use crate::admission::AdmissionControl;
use crate::cache::Cache;
use crate::client::GrpcTargetClient;
use crate::config::{GatewayConfig, TargetConfig};
use crate::error::Result;
use crate::fanout::{Fanout, TargetClient};
use crate::matcher::Matcher;
use crate::registry::TargetRegistry;
use crate::server::GnmiService;
use crate::subscriber::TargetSubscriber;

// Ingest task of one target.
struct Ingest {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the shared gateway state and the tasks working on it.
///
/// Handles:
/// - One ingest task per target with configured subscriptions
/// - Adding and removing targets at runtime
/// - Serving the gNMI service until Ctrl+C or [`shutdown`](Self::shutdown)
///
/// # Example
///
/// ```ignore
/// let config = GatewayConfig::load("gnmi-gateway.json5")?;
/// let runner = GatewayRunner::new(config);
/// runner.run().await?;
/// ```
pub struct GatewayRunner {
    config: GatewayConfig,
    cache: Arc<Cache>,
    registry: Arc<TargetRegistry>,
    admission: AdmissionControl,
    client: Arc<GrpcTargetClient>,
    shutdown: CancellationToken,
    ingest: Mutex<HashMap<String, Ingest>>,
}

impl GatewayRunner {
    /// Build the shared state from configuration and start ingesting.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: GatewayConfig) -> Self {
        let cache = Arc::new(Cache::new(Arc::new(Matcher::new())));
        let registry = Arc::new(TargetRegistry::new());
        let admission = AdmissionControl::new(
            config.server.max_subscriptions,
            config.server.max_unary_rpc,
        );

        let runner = Self {
            cache,
            registry,
            admission,
            client: Arc::new(GrpcTargetClient::new()),
            shutdown: CancellationToken::new(),
            ingest: Mutex::new(HashMap::new()),
            config,
        };

        for target in runner.config.targets.clone() {
            runner.register(target);
        }
        runner
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    /// Client carrying Get/Set toward the registered targets.
    pub fn client(&self) -> &Arc<GrpcTargetClient> {
        &self.client
    }

    /// Token cancelled when the gateway shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop serving and cancel every task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Register a target, replacing any previous one with the same name.
    ///
    /// The replaced target's ingest task is stopped and its Get/Set channel
    /// dropped before the new configuration takes effect.
    pub async fn add_target(&self, target: TargetConfig) {
        self.stop_ingest(&target.name).await;
        self.client.forget(&target.name);
        self.register(target);
    }

    /// Unregister a target and drop its cached telemetry.
    ///
    /// The target's ingest task has finished when this returns, so nothing
    /// re-creates its cache entry afterwards.
    pub async fn remove_target(&self, name: &str) -> bool {
        self.stop_ingest(name).await;
        self.client.forget(name);
        let registered = self.registry.remove(name).is_some();
        let cached = self.cache.remove_target(name);

        if registered || cached {
            info!(target_name = %name, "Removed target");
        }
        registered || cached
    }

    // A target with subscriptions gets an ingest task feeding the cache.
    fn register(&self, target: TargetConfig) {
        let name = target.name.clone();

        if !target.subscriptions.is_empty() {
            let cancel = self.shutdown.child_token();
            let subscriber = TargetSubscriber::new(target.clone());
            let cache = Arc::clone(&self.cache);
            let token = cancel.clone();
            let handle = tokio::spawn(async move { subscriber.run(cache, token).await });
            self.ingest
                .lock()
                .insert(name.clone(), Ingest { cancel, handle });
        }

        if self.registry.insert(target).is_some() {
            info!(target_name = %name, "Replaced target");
        } else {
            info!(target_name = %name, "Added target");
        }
    }

    async fn stop_ingest(&self, name: &str) {
        let ingest = self.ingest.lock().remove(name);
        if let Some(ingest) = ingest {
            ingest.cancel.cancel();
            if let Err(e) = ingest.handle.await {
                warn!(target_name = %name, error = %e, "Ingest task failed");
            }
        }
    }

    /// Number of running ingest tasks.
    pub fn ingest_tasks(&self) -> usize {
        self.ingest.lock().len()
    }

    /// gNMI service over this gateway's state, dispatching Get/Set through
    /// `client`.
    pub fn service(&self, client: Arc<dyn TargetClient>) -> GnmiService {
        GnmiService::new(
            Arc::clone(&self.cache),
            self.admission.clone(),
            Fanout::new(Arc::clone(&self.registry), client),
            self.config.server.session_config(),
            self.shutdown.clone(),
        )
    }

    /// Serve on the configured address until Ctrl+C or shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.server.listen_addr()?;
        let shutdown = self.shutdown.clone();

        let ctrl_c = async move {
            tokio::select! {
                result = signal::ctrl_c() => {
                    if let Err(e) = result {
                        error!(error = %e, "Failed to listen for Ctrl+C");
                    }
                    info!("Received shutdown signal");
                }
                _ = shutdown.cancelled() => {}
            }
        };

        self.serve(addr, ctrl_c).await
    }

    /// Serve on `addr` until `signal` completes, then stop every task.
    pub async fn serve<F>(self, addr: SocketAddr, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let mut server = Server::builder();
        if let Some(tls) = &self.config.server.tls {
            let cert = tokio::fs::read(&tls.cert).await?;
            let key = tokio::fs::read(&tls.key).await?;
            let mut tls_config = ServerTlsConfig::new().identity(Identity::from_pem(cert, key));
            if let Some(ref client_ca) = tls.client_ca {
                let ca = tokio::fs::read(client_ca).await?;
                tls_config = tls_config.client_ca_root(Certificate::from_pem(ca));
            }
            server = server.tls_config(tls_config)?;
        }

        let service = self.service(Arc::clone(&self.client) as Arc<dyn TargetClient>);
        info!(
            listen = %addr,
            targets = self.registry.len(),
            ingest = self.ingest_tasks(),
            tls = self.config.server.tls.is_some(),
            "Gateway running. Press Ctrl+C to stop."
        );

        let result = server
            .add_service(service.into_server())
            .serve_with_shutdown(addr, signal)
            .await;

        self.stop().await;
        result?;
        info!("Gateway shutdown complete");
        Ok(())
    }

    async fn stop(&self) {
        self.shutdown.cancel();

        let tasks: Vec<(String, Ingest)> = self.ingest.lock().drain().collect();
        for (name, ingest) in tasks {
            if let Err(e) = ingest.handle.await {
                warn!(target_name = %name, error = %e, "Ingest task failed");
            }
        }
    }
}
