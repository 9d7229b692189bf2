//! Point-in-time Get/Set fan-out across targets.
//!
//! A request's prefix target selects one or more registered targets. Each
//! selected target gets its own concurrent attempt, bounded by that target's
//! timeout, and the call waits for every attempt before answering. If any
//! attempt fails, the whole call fails with the first error collected and the
//! records returned by the other targets are dropped.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;
use tonic::Status;
use tracing::{debug, error, warn};

use crate::config::TargetConfig;
use crate::error::{GatewayError, Result};
use crate::gnmi::{GetRequest, GetResponse, Path, SetRequest, SetResponse};
use crate::path::{self, WILDCARD};
use crate::registry::TargetRegistry;

/// Performs Get and Set against a single target.
#[tonic::async_trait]
pub trait TargetClient: Send + Sync + 'static {
    async fn get(&self, target: &TargetConfig, request: GetRequest)
    -> std::result::Result<GetResponse, Status>;

    async fn set(&self, target: &TargetConfig, request: SetRequest)
    -> std::result::Result<SetResponse, Status>;
}

// Requests whose prefix names the target they are sent to.
trait Targeted: Clone + Send + 'static {
    fn prefix(&self) -> Option<&Path>;
    fn prefix_mut(&mut self) -> &mut Option<Path>;

    fn selector(&self) -> &str {
        self.prefix().map(|p| p.target.as_str()).unwrap_or_default()
    }

    /// Name `target` in the prefix unless it already names a single target.
    fn stamp(&mut self, target: &str) {
        let prefix = self.prefix_mut().get_or_insert_with(Path::default);
        if prefix.target.is_empty() || prefix.target == WILDCARD || prefix.target.contains(',') {
            prefix.target = target.to_string();
        }
    }
}

impl Targeted for GetRequest {
    fn prefix(&self) -> Option<&Path> {
        self.prefix.as_ref()
    }

    fn prefix_mut(&mut self) -> &mut Option<Path> {
        &mut self.prefix
    }
}

impl Targeted for SetRequest {
    fn prefix(&self) -> Option<&Path> {
        self.prefix.as_ref()
    }

    fn prefix_mut(&mut self) -> &mut Option<Path> {
        &mut self.prefix
    }
}

/// Dispatches Get/Set to the targets a request selects.
#[derive(Clone)]
pub struct Fanout {
    registry: Arc<TargetRegistry>,
    client: Arc<dyn TargetClient>,
}

impl Fanout {
    pub fn new(registry: Arc<TargetRegistry>, client: Arc<dyn TargetClient>) -> Self {
        Self { registry, client }
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    /// Get from every selected target, merged into one response.
    ///
    /// Notifications without a prefix target are tagged with the name of the
    /// target that returned them.
    pub async fn get(&self, request: GetRequest) -> Result<GetResponse> {
        let responses = self
            .dispatch(request, |client, target, request| async move {
                client.get(&target, request).await
            })
            .await?;

        let mut merged = GetResponse::default();
        for (name, response) in responses {
            for mut notification in response.notification {
                let prefix = notification.prefix.get_or_insert_with(Path::default);
                if prefix.target.is_empty() {
                    prefix.target = name.clone();
                }
                merged.notification.push(notification);
            }
        }
        Ok(merged)
    }

    /// Set on every selected target, merged into one response.
    ///
    /// Each result's path is made absolute and names its target.
    pub async fn set(&self, request: SetRequest) -> Result<SetResponse> {
        let responses = self
            .dispatch(request, |client, target, request| async move {
                client.set(&target, request).await
            })
            .await?;

        let mut merged = SetResponse {
            timestamp: crate::timestamp_nanos(),
            ..Default::default()
        };
        for (name, response) in responses {
            let prefix = response.prefix.as_ref();
            for mut result in response.response {
                let relative = result.path.take().unwrap_or_default();
                let mut absolute = path::to_proto(&path::join(prefix, Some(&relative)));
                absolute.origin = match prefix {
                    Some(p) if relative.origin.is_empty() => p.origin.clone(),
                    _ => relative.origin,
                };
                absolute.target = name.clone();
                result.path = Some(absolute);
                merged.response.push(result);
            }
        }
        Ok(merged)
    }

    // One attempt per selected target; responses sorted by target name.
    async fn dispatch<Req, Resp, F, Fut>(&self, request: Req, call: F) -> Result<Vec<(String, Resp)>>
    where
        Req: Targeted,
        Resp: Send + 'static,
        F: Fn(Arc<dyn TargetClient>, TargetConfig, Req) -> Fut,
        Fut: Future<Output = std::result::Result<Resp, Status>> + Send + 'static,
    {
        let targets = self.registry.resolve(request.selector())?;
        let mut attempts = JoinSet::new();
        let mut names = HashMap::new();

        for target in targets {
            let mut request = request.clone();
            request.stamp(&target.name);

            let name = target.name.clone();
            let timeout = target.timeout();
            let attempt = call(Arc::clone(&self.client), target, request);

            let label = name.clone();
            let attempt = attempts.spawn(async move {
                let result = match tokio::time::timeout(timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(Status::deadline_exceeded(format!(
                        "no response within {}ms",
                        timeout.as_millis()
                    ))),
                };
                (name, result)
            });
            names.insert(attempt.id(), label);
        }

        let mut responses = Vec::new();
        let mut failure: Option<(String, Status)> = None;

        while let Some(joined) = attempts.join_next().await {
            let (name, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    let name = names.remove(&e.id()).unwrap_or_else(|| "unknown".to_string());
                    error!(target_name = %name, error = %e, "Target attempt aborted");
                    failure.get_or_insert_with(|| (name, Status::internal(e.to_string())));
                    continue;
                }
            };

            match result {
                Ok(response) => {
                    debug!(target_name = %name, "Target request succeeded");
                    responses.push((name, response));
                }
                Err(status) => {
                    warn!(target_name = %name, error = %status, "Target request failed");
                    if failure.is_none() {
                        failure = Some((name, status));
                    }
                }
            }
        }

        if let Some((target, cause)) = failure {
            if !responses.is_empty() {
                debug!(
                    succeeded = responses.len(),
                    "Dropping partial results of failed fan-out"
                );
            }
            return Err(GatewayError::Aggregate { target, cause });
        }

        responses.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnmi::{self, typed_value, update_result};
    use std::time::Duration;
    use tonic::Code;

    /// Target client answering from fixed per-target behaviour.
    #[derive(Default)]
    struct MockClient {
        delays: HashMap<String, Duration>,
        failures: HashMap<String, Status>,
        crashes: Vec<String>,
    }

    #[tonic::async_trait]
    impl TargetClient for MockClient {
        async fn get(
            &self,
            target: &TargetConfig,
            request: GetRequest,
        ) -> std::result::Result<GetResponse, Status> {
            if let Some(delay) = self.delays.get(&target.name) {
                tokio::time::sleep(*delay).await;
            }
            if let Some(status) = self.failures.get(&target.name) {
                return Err(status.clone());
            }
            if self.crashes.contains(&target.name) {
                panic!("driver for {} crashed", target.name);
            }
            assert_eq!(request.prefix.as_ref().unwrap().target, target.name);

            Ok(GetResponse {
                notification: vec![gnmi::Notification {
                    timestamp: 1,
                    update: vec![gnmi::Update {
                        path: request.path.first().cloned(),
                        val: Some(gnmi::TypedValue {
                            value: Some(typed_value::Value::StringVal(target.name.clone())),
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            })
        }

        async fn set(
            &self,
            target: &TargetConfig,
            request: SetRequest,
        ) -> std::result::Result<SetResponse, Status> {
            if let Some(status) = self.failures.get(&target.name) {
                return Err(status.clone());
            }
            Ok(SetResponse {
                prefix: request.prefix.clone(),
                response: request
                    .update
                    .iter()
                    .map(|u| gnmi::UpdateResult {
                        path: u.path.clone(),
                        op: update_result::Operation::Update as i32,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            })
        }
    }

    fn fanout(client: MockClient) -> Fanout {
        let registry = TargetRegistry::from_targets(["r1", "r2", "r3"].map(|name| {
            let mut target = TargetConfig::new(name, "127.0.0.1:1");
            target.timeout_ms = 200;
            target
        }));
        Fanout::new(Arc::new(registry), Arc::new(client))
    }

    fn get_request(target: &str) -> GetRequest {
        GetRequest {
            prefix: Some(Path {
                target: target.to_string(),
                ..Default::default()
            }),
            path: vec![path::to_proto(&path::parse("/system/state/hostname"))],
            ..Default::default()
        }
    }

    fn targets_of(response: &GetResponse) -> Vec<String> {
        response
            .notification
            .iter()
            .map(|n| n.prefix.as_ref().unwrap().target.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_get_wildcard_merges_all_targets() {
        let client = MockClient {
            delays: HashMap::from([
                ("r1".to_string(), Duration::from_millis(30)),
                ("r2".to_string(), Duration::from_millis(10)),
            ]),
            ..Default::default()
        };

        let response = fanout(client).get(get_request("*")).await.unwrap();
        assert_eq!(response.notification.len(), 3);
        assert_eq!(targets_of(&response), ["r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_aborted_attempt_names_its_target() {
        let client = MockClient {
            crashes: vec!["r2".to_string()],
            ..Default::default()
        };

        match fanout(client).get(get_request("*")).await {
            Err(GatewayError::Aggregate { target, cause }) => {
                assert_eq!(target, "r2");
                assert_eq!(cause.code(), Code::Internal);
            }
            other => panic!("expected aggregate failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_get_comma_list() {
        let response = fanout(MockClient::default())
            .get(get_request("r3,r1"))
            .await
            .unwrap();
        assert_eq!(targets_of(&response), ["r1", "r3"]);
    }

    #[tokio::test]
    async fn test_get_unknown_target() {
        let err = fanout(MockClient::default())
            .get(get_request("r1,r7"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::TargetNotFound(name) if name == "r7"));
    }

    #[tokio::test]
    async fn test_get_one_failure_fails_call() {
        let client = MockClient {
            failures: HashMap::from([("r2".to_string(), Status::unavailable("connection refused"))]),
            ..Default::default()
        };

        let err = fanout(client).get(get_request("")).await.unwrap_err();
        match &err {
            GatewayError::Aggregate { target, cause } => {
                assert_eq!(target, "r2");
                assert_eq!(cause.code(), Code::Unavailable);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(Status::from(err).code(), Code::Internal);
    }

    #[tokio::test]
    async fn test_get_timeout() {
        let client = MockClient {
            delays: HashMap::from([("r3".to_string(), Duration::from_secs(5))]),
            ..Default::default()
        };

        let err = fanout(client).get(get_request("*")).await.unwrap_err();
        match err {
            GatewayError::Aggregate { target, cause } => {
                assert_eq!(target, "r3");
                assert_eq!(cause.code(), Code::DeadlineExceeded);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_set_results_name_their_target() {
        let request = SetRequest {
            prefix: Some(Path {
                target: "r1,r2".to_string(),
                elem: path::to_proto(&path::parse("/system/config")).elem,
                ..Default::default()
            }),
            update: vec![gnmi::Update {
                path: Some(path::to_proto(&path::parse("/hostname"))),
                ..Default::default()
            }],
            ..Default::default()
        };

        let response = fanout(MockClient::default()).set(request).await.unwrap();
        assert_eq!(response.response.len(), 2);
        assert!(response.timestamp > 0);

        for (result, name) in response.response.iter().zip(["r1", "r2"]) {
            let path = result.path.as_ref().unwrap();
            assert_eq!(path.target, name);
            assert_eq!(path::elems(path), path::parse("/system/config/hostname"));
        }
    }

    #[test]
    fn test_stamp() {
        let mut request = GetRequest::default();
        request.stamp("r1");
        assert_eq!(request.selector(), "r1");

        request.stamp("r2");
        assert_eq!(request.selector(), "r1");

        let mut wildcard = get_request("*");
        wildcard.stamp("r2");
        assert_eq!(wildcard.selector(), "r2");
    }
}
