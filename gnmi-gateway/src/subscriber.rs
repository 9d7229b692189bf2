//! Device-side telemetry ingest.
//!
//! A [`TargetSubscriber`] keeps one STREAM subscription open toward its
//! target and writes every received notification into the [`Cache`],
//! reconnecting after failures until it is cancelled.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Cache;
use crate::client;
use crate::config::{Subscription, TargetConfig};
use crate::error::Result;
use crate::gnmi::g_nmi_client::GNmiClient;
use crate::gnmi::subscribe_response::Response;
use crate::gnmi::{self, Notification, SubscribeRequest, SubscriptionList};
use crate::path;

/// Streams telemetry from one target into the cache.
pub struct TargetSubscriber {
    target: TargetConfig,
}

impl TargetSubscriber {
    pub fn new(target: TargetConfig) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &TargetConfig {
        &self.target
    }

    /// Subscribe and ingest until `cancel` fires.
    ///
    /// Each failed or completed subscription is retried after the target's
    /// retry interval.
    pub async fn run(&self, cache: Arc<Cache>, cancel: CancellationToken) {
        info!(
            target_name = %self.target.name,
            address = %self.target.address,
            "Starting target subscriber"
        );

        while !cancel.is_cancelled() {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                outcome = self.subscribe(&cache) => outcome,
            };

            match outcome {
                Ok(()) => info!(target_name = %self.target.name, "Subscription ended"),
                Err(e) => error!(
                    target_name = %self.target.name,
                    error = %e,
                    retry_ms = self.target.retry_interval_ms,
                    "Subscription failed"
                ),
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.target.retry_interval()) => {}
            }
        }

        info!(target_name = %self.target.name, "Target subscriber stopped");
    }

    async fn subscribe(&self, cache: &Cache) -> Result<()> {
        let channel = client::connect(&self.target).await?;
        let mut client = GNmiClient::new(channel);

        let request = client::authorized(
            &self.target,
            tokio_stream::once(self.build_subscribe_request()),
        )?;
        let mut stream = client.subscribe(request).await?.into_inner();

        cache.add_target(&self.target.name);
        info!(target_name = %self.target.name, "gNMI subscription established");

        while let Some(msg) = stream.message().await? {
            match msg.response {
                Some(Response::Update(notification)) => self.ingest(cache, notification),
                Some(Response::SyncResponse(sync)) => {
                    debug!(target_name = %self.target.name, sync, "Received sync response");
                }
                #[allow(deprecated)]
                Some(Response::Error(err)) => {
                    warn!(target_name = %self.target.name, code = err.code, message = %err.message, "Received gNMI error");
                }
                None => {}
            }
        }

        Ok(())
    }

    fn ingest(&self, cache: &Cache, mut notification: Notification) {
        notification
            .prefix
            .get_or_insert_with(gnmi::Path::default)
            .target = self.target.name.clone();

        if let Err(e) = cache.update(&notification) {
            warn!(target_name = %self.target.name, error = %e, "Rejected notification");
        }
    }

    /// The STREAM subscription sent to the target.
    pub fn build_subscribe_request(&self) -> SubscribeRequest {
        let subscriptions: Vec<gnmi::Subscription> = self
            .target
            .subscriptions
            .iter()
            .map(build_subscription)
            .collect();

        let subscription_list = SubscriptionList {
            prefix: None,
            subscription: subscriptions,
            mode: gnmi::subscription_list::Mode::Stream as i32,
            encoding: self.target.encoding.to_proto() as i32,
            ..Default::default()
        };

        SubscribeRequest {
            request: Some(gnmi::subscribe_request::Request::Subscribe(
                subscription_list,
            )),
            extension: vec![],
        }
    }
}

fn build_subscription(sub: &Subscription) -> gnmi::Subscription {
    gnmi::Subscription {
        path: Some(path::to_proto(&path::parse(&sub.path))),
        mode: sub.mode.to_proto() as i32,
        sample_interval: sub.sample_interval_ms * 1_000_000, // Convert to nanoseconds
        suppress_redundant: sub.suppress_redundant,
        heartbeat_interval: sub.heartbeat_interval_ms * 1_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionMode;
    use crate::gnmi::subscribe_request::Request;
    use crate::matcher::Matcher;
    use std::time::Duration;

    fn target() -> TargetConfig {
        let mut target = TargetConfig::new("r1", "127.0.0.1:1");
        target.subscriptions = vec![Subscription {
            path: "/interfaces/interface[name=eth0]/state/counters".to_string(),
            mode: SubscriptionMode::Sample,
            sample_interval_ms: 5000,
            suppress_redundant: true,
            heartbeat_interval_ms: 60000,
        }];
        target
    }

    #[test]
    fn test_build_subscribe_request() {
        let request = TargetSubscriber::new(target()).build_subscribe_request();
        let Some(Request::Subscribe(list)) = request.request else {
            panic!("expected subscription list");
        };

        assert_eq!(list.mode, gnmi::subscription_list::Mode::Stream as i32);
        assert_eq!(list.subscription.len(), 1);

        let sub = &list.subscription[0];
        assert_eq!(sub.mode, gnmi::SubscriptionMode::Sample as i32);
        assert_eq!(sub.sample_interval, 5_000_000_000);
        assert_eq!(sub.heartbeat_interval, 60_000_000_000);
        assert!(sub.suppress_redundant);

        let elems = path::elems(sub.path.as_ref().unwrap());
        assert_eq!(elems.len(), 4);
        assert_eq!(elems[1].keys.get("name").map(String::as_str), Some("eth0"));
    }

    #[test]
    fn test_ingest_stamps_target() {
        let cache = Cache::new(Arc::new(Matcher::new()));
        cache.add_target("r1");
        let subscriber = TargetSubscriber::new(target());

        let notification = Notification {
            timestamp: 5,
            prefix: Some(gnmi::Path {
                target: "device-reported-name".to_string(),
                ..Default::default()
            }),
            update: vec![gnmi::Update {
                path: Some(path::to_proto(&path::parse("/system/state/hostname"))),
                val: Some(gnmi::TypedValue {
                    value: Some(gnmi::typed_value::Value::StringVal("r1".to_string())),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        subscriber.ingest(&cache, notification);

        let leaf = cache
            .get("r1", &path::parse("/system/state/hostname"))
            .unwrap();
        assert_eq!(leaf.timestamp(), 5);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cache = Arc::new(Cache::new(Arc::new(Matcher::new())));
        let mut config = target();
        config.retry_interval_ms = 50;
        let subscriber = TargetSubscriber::new(config);

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { subscriber.run(cache, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
