//! Subscribe session state machine.
//!
//! One [`Session`] serves one incoming Subscribe call. It interprets the
//! subscription list, feeds matching cache leaves into its own
//! [`CoalescingQueue`], and a paired sender task drains that queue onto the
//! outgoing stream. States move `Init -> {Once | Poll | Stream} -> Draining
//! -> Closed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, trace, warn};

use crate::cache::{Cache, Leaf, LeafValue};
use crate::error::{GatewayError, Result};
use crate::gnmi::subscribe_request::Request;
use crate::gnmi::subscribe_response::Response;
use crate::gnmi::subscription_list::Mode;
use crate::gnmi::{
    self, SubscribeRequest, SubscribeResponse, SubscriptionList, SubscriptionMode, TypedValue,
};
use crate::matcher::QueryHandle;
use crate::path::{self, Elem, WILDCARD};
use crate::queue::{Coalesce, CoalescingQueue, QueueError};

/// Outgoing half of a Subscribe call.
pub type Responses = mpsc::Sender<std::result::Result<SubscribeResponse, Status>>;

/// Item queued for delivery to a subscriber.
#[derive(Debug, Clone)]
pub enum Delivery {
    Leaf(Arc<Leaf>),
    /// All currently known matching data has been queued.
    Sync,
}

impl Coalesce for Delivery {
    type Key = String;

    fn coalesce_key(&self) -> Option<String> {
        match self {
            Delivery::Leaf(leaf) => Some(leaf.key().to_string()),
            Delivery::Sync => None,
        }
    }
}

pub type DeliveryQueue = CoalescingQueue<Delivery>;

/// Interval bounds applied to requested subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Used when a SAMPLE subscription requests an interval of 0
    pub default_sample_interval: Duration,
    pub min_sample_interval: Duration,
    pub min_heartbeat_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_sample_interval: Duration::from_secs(1),
            min_sample_interval: Duration::from_secs(1),
            min_heartbeat_interval: Duration::from_secs(1),
        }
    }
}

impl SessionConfig {
    fn sample_interval(&self, requested_ns: u64) -> Duration {
        let requested = if requested_ns == 0 {
            self.default_sample_interval
        } else {
            Duration::from_nanos(requested_ns)
        };
        requested.max(self.min_sample_interval)
    }

    fn heartbeat_interval(&self, requested_ns: u64) -> Option<Duration> {
        (requested_ns > 0)
            .then(|| Duration::from_nanos(requested_ns).max(self.min_heartbeat_interval))
    }
}

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Once,
    Poll,
    Stream,
    Draining,
    Closed,
}

// How the active phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    /// Deliver everything still queued, then close.
    Drain,
    /// Stop delivering immediately.
    Abort,
}

/// Re-queries one subscription path and queues what it finds.
#[derive(Clone)]
struct Sampler {
    cache: Arc<Cache>,
    target: String,
    pattern: Vec<Elem>,
    queue: Arc<DeliveryQueue>,
    // Last value queued per leaf key, shared by the whole session
    last_sent: Arc<Mutex<HashMap<String, TypedValue>>>,
}

impl Sampler {
    /// Queue every matching leaf, or with `suppress` only those whose value
    /// differs from the last one queued. Returns the number queued.
    fn sample(&self, suppress: bool) -> Result<usize> {
        let mut last_sent = self.last_sent.lock();
        let mut queued = 0;

        self.cache.query(&self.target, &self.pattern, |leaf| {
            let LeafValue::Update(value) = leaf.value() else {
                return;
            };
            if suppress && last_sent.get(leaf.key()) == Some(value) {
                return;
            }
            last_sent.insert(leaf.key().to_string(), value.clone());
            if self.queue.insert(Delivery::Leaf(Arc::clone(leaf))).is_ok() {
                queued += 1;
            }
        })?;

        Ok(queued)
    }
}

/// State of one Subscribe call.
pub struct Session {
    id: u64,
    cache: Arc<Cache>,
    config: SessionConfig,
    mode: Mode,
    target: String,
    prefix: Option<gnmi::Path>,
    subscriptions: Vec<gnmi::Subscription>,
    updates_only: bool,
    queue: Arc<DeliveryQueue>,
    state: SessionState,
    cancel: CancellationToken,
    samplers: CancellationToken,
    tasks: JoinSet<()>,
    registrations: Vec<QueryHandle>,
    last_sent: Arc<Mutex<HashMap<String, TypedValue>>>,
}

impl Session {
    /// Validate a subscription list and prepare a session for it.
    ///
    /// The session stops when `shutdown` is cancelled.
    pub fn new(
        id: u64,
        cache: Arc<Cache>,
        config: SessionConfig,
        list: SubscriptionList,
        shutdown: &CancellationToken,
    ) -> Result<Self> {
        if list.subscription.is_empty() {
            return Err(GatewayError::invalid("subscription list is empty"));
        }

        let mode = Mode::try_from(list.mode).map_err(|_| {
            GatewayError::invalid(format!("unknown subscription list mode {}", list.mode))
        })?;

        if mode == Mode::Stream {
            for sub in &list.subscription {
                SubscriptionMode::try_from(sub.mode).map_err(|_| {
                    GatewayError::invalid(format!("unknown subscription mode {}", sub.mode))
                })?;
            }
        }

        let target = match list.prefix.as_ref().map(|p| p.target.as_str()) {
            None | Some("") => WILDCARD.to_string(),
            Some(target) => target.to_string(),
        };
        if target != WILDCARD && !cache.has_target(&target) {
            return Err(GatewayError::TargetNotFound(target));
        }

        let cancel = shutdown.child_token();
        Ok(Self {
            id,
            cache,
            config,
            mode,
            target,
            prefix: list.prefix,
            subscriptions: list.subscription,
            updates_only: list.updates_only,
            queue: Arc::new(DeliveryQueue::new()),
            state: SessionState::Init,
            samplers: cancel.child_token(),
            cancel,
            tasks: JoinSet::new(),
            registrations: Vec::new(),
            last_sent: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Serve the call until the subscription completes, the client goes
    /// away, or an error ends it.
    ///
    /// `inbound` carries the requests that follow the subscription list. An
    /// error is also sent to `responses` as the final status.
    pub async fn run<S>(mut self, mut inbound: S, responses: Responses) -> Result<()>
    where
        S: Stream<Item = std::result::Result<SubscribeRequest, Status>> + Unpin + Send,
    {
        let sender = tokio::spawn(forward(
            self.id,
            Arc::clone(&self.queue),
            responses.clone(),
            self.cancel.clone(),
        ));
        let (errors, mut failures) = mpsc::unbounded_channel();
        let cancel = self.cancel.clone();

        let outcome = tokio::select! {
            result = self.drive(&mut inbound, &errors) => result,
            Some(err) = failures.recv() => Err(err),
            _ = responses.closed() => Ok(Ending::Abort),
            _ = cancel.cancelled() => Ok(Ending::Abort),
        };

        self.transition(SessionState::Draining);
        self.registrations.clear();
        self.samplers.cancel();
        while self.tasks.join_next().await.is_some() {}

        if !matches!(outcome, Ok(Ending::Drain)) {
            self.cancel.cancel();
        }
        self.queue.close();
        if let Err(e) = sender.await {
            warn!(session = self.id, error = %e, "Sender task failed");
        }
        self.transition(SessionState::Closed);

        match outcome {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(session = self.id, error = %err, "Session failed");
                let status = Status::from(err);
                let _ = responses.send(Err(status.clone())).await;
                Err(status.into())
            }
        }
    }

    async fn drive<S>(
        &mut self,
        inbound: &mut S,
        errors: &mpsc::UnboundedSender<GatewayError>,
    ) -> Result<Ending>
    where
        S: Stream<Item = std::result::Result<SubscribeRequest, Status>> + Unpin + Send,
    {
        match self.mode {
            Mode::Once => {
                self.transition(SessionState::Once);
                self.cycle(!self.updates_only)?;
                Ok(Ending::Drain)
            }
            Mode::Poll => {
                self.transition(SessionState::Poll);
                self.cycle(!self.updates_only)?;

                loop {
                    match inbound.next().await {
                        Some(Ok(SubscribeRequest {
                            request: Some(Request::Poll(_)),
                            ..
                        })) => {
                            trace!(session = self.id, "Poll");
                            self.cycle(true)?;
                        }
                        Some(Ok(_)) => {
                            return Err(GatewayError::invalid(
                                "only poll requests are accepted on a POLL subscription",
                            ));
                        }
                        Some(Err(status)) => {
                            debug!(session = self.id, error = %status, "Inbound stream failed");
                            return Ok(Ending::Abort);
                        }
                        None => return Ok(Ending::Drain),
                    }
                }
            }
            Mode::Stream => {
                self.transition(SessionState::Stream);
                for sub in self.subscriptions.clone() {
                    self.setup(&sub, errors)?;
                }
                self.enqueue(Delivery::Sync);

                match inbound.next().await {
                    Some(Ok(_)) => Err(GatewayError::invalid(
                        "no further requests are accepted on a STREAM subscription",
                    )),
                    Some(Err(status)) => {
                        debug!(session = self.id, error = %status, "Inbound stream failed");
                        Ok(Ending::Abort)
                    }
                    None => {
                        self.cancel.cancelled().await;
                        Ok(Ending::Abort)
                    }
                }
            }
        }
    }

    // Queue the current value of every subscribed path, then one sync marker.
    fn cycle(&self, with_data: bool) -> Result<()> {
        if with_data {
            for sub in &self.subscriptions {
                self.snapshot(&self.pattern(sub))?;
            }
        }
        self.enqueue(Delivery::Sync);
        Ok(())
    }

    fn snapshot(&self, pattern: &[Elem]) -> Result<()> {
        self.cache.query(&self.target, pattern, |leaf| {
            let _ = self.queue.insert(Delivery::Leaf(Arc::clone(leaf)));
        })?;
        Ok(())
    }

    fn setup(
        &mut self,
        sub: &gnmi::Subscription,
        errors: &mpsc::UnboundedSender<GatewayError>,
    ) -> Result<()> {
        let pattern = self.pattern(sub);
        let mode = SubscriptionMode::try_from(sub.mode)
            .map_err(|_| GatewayError::invalid(format!("unknown subscription mode {}", sub.mode)))?;
        let sampler = Sampler {
            cache: Arc::clone(&self.cache),
            target: self.target.clone(),
            pattern: pattern.clone(),
            queue: Arc::clone(&self.queue),
            last_sent: Arc::clone(&self.last_sent),
        };

        debug!(
            session = self.id,
            path = %path::to_string(&pattern),
            mode = ?mode,
            "Subscription setup"
        );

        match mode {
            SubscriptionMode::OnChange | SubscriptionMode::TargetDefined => {
                let mut full = Vec::with_capacity(pattern.len() + 1);
                full.push(Elem::new(self.target.clone()));
                full.extend(pattern.iter().cloned());

                let queue = Arc::clone(&self.queue);
                let handle = self.cache.matcher().add_query(
                    full,
                    Arc::new(move |leaf: &Arc<Leaf>| {
                        let _ = queue.insert(Delivery::Leaf(Arc::clone(leaf)));
                    }),
                );
                self.registrations.push(handle);

                if !self.updates_only {
                    self.snapshot(&pattern)?;
                }
                if let Some(heartbeat) = self.config.heartbeat_interval(sub.heartbeat_interval) {
                    self.spawn_periodic(sampler, heartbeat, false, errors);
                }
            }
            SubscriptionMode::Sample => {
                let interval = self.config.sample_interval(sub.sample_interval);
                if !self.updates_only {
                    sampler.sample(sub.suppress_redundant)?;
                }
                if sub.suppress_redundant {
                    if let Some(heartbeat) = self.config.heartbeat_interval(sub.heartbeat_interval)
                    {
                        self.spawn_periodic(sampler.clone(), heartbeat, false, errors);
                    }
                }
                self.spawn_periodic(sampler, interval, sub.suppress_redundant, errors);
            }
        }
        Ok(())
    }

    fn spawn_periodic(
        &mut self,
        sampler: Sampler,
        period: Duration,
        suppress: bool,
        errors: &mpsc::UnboundedSender<GatewayError>,
    ) {
        let cancel = self.samplers.clone();
        let errors = errors.clone();
        let id = self.id;

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match sampler.sample(suppress) {
                        Ok(queued) => trace!(session = id, queued, suppress, "Sampled"),
                        Err(e) => {
                            let _ = errors.send(e);
                            break;
                        }
                    },
                }
            }
        });
    }

    // Prefix joined with the subscription path.
    fn pattern(&self, sub: &gnmi::Subscription) -> Vec<Elem> {
        path::join(self.prefix.as_ref(), sub.path.as_ref())
    }

    fn enqueue(&self, item: Delivery) {
        if let Err(QueueError::Closed) = self.queue.insert(item) {
            trace!(session = self.id, "Queue closed, item dropped");
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = self.id, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}

// Drain the queue onto the outgoing stream until it is closed or cancelled.
async fn forward(
    id: u64,
    queue: Arc<DeliveryQueue>,
    responses: Responses,
    cancel: CancellationToken,
) {
    loop {
        let (item, duplicates) = match queue.next(&cancel).await {
            Ok(next) => next,
            Err(QueueError::Closed) | Err(QueueError::Cancelled) => break,
        };

        let response = match item {
            Delivery::Leaf(leaf) => Response::Update(leaf.to_notification(duplicates)),
            Delivery::Sync => Response::SyncResponse(true),
        };
        let response = SubscribeResponse {
            response: Some(response),
            ..Default::default()
        };

        if responses.send(Ok(response)).await.is_err() {
            debug!(session = id, "Client went away");
            cancel.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gnmi::typed_value;
    use crate::matcher::Matcher;
    use crate::path::parse;
    use tokio::time::timeout;
    use tokio_stream::wrappers::ReceiverStream;
    use tonic::Code;

    const IN_OCTETS: &str = "/interfaces/interface[name=eth0]/state/counters/in-octets";

    type Inbound = std::result::Result<SubscribeRequest, Status>;
    type Outbound = mpsc::Receiver<std::result::Result<SubscribeResponse, Status>>;

    fn no_requests() -> tokio_stream::Empty<Inbound> {
        tokio_stream::empty()
    }

    fn uint(v: u64) -> TypedValue {
        TypedValue {
            value: Some(typed_value::Value::UintVal(v)),
        }
    }

    fn cache_with(targets: &[&str]) -> Arc<Cache> {
        let cache = Arc::new(Cache::new(Arc::new(Matcher::new())));
        for target in targets {
            cache.add_target(target);
        }
        cache
    }

    fn put(cache: &Cache, target: &str, path: &str, value: u64) {
        cache
            .update(&gnmi::Notification {
                timestamp: crate::timestamp_nanos(),
                prefix: Some(gnmi::Path {
                    target: target.to_string(),
                    ..Default::default()
                }),
                update: vec![gnmi::Update {
                    path: Some(path::to_proto(&parse(path))),
                    val: Some(uint(value)),
                    ..Default::default()
                }],
                ..Default::default()
            })
            .unwrap();
    }

    fn list(target: &str, mode: Mode, subs: Vec<gnmi::Subscription>) -> SubscriptionList {
        SubscriptionList {
            prefix: Some(gnmi::Path {
                target: target.to_string(),
                ..Default::default()
            }),
            subscription: subs,
            mode: mode as i32,
            ..Default::default()
        }
    }

    fn sub(path: &str, mode: SubscriptionMode) -> gnmi::Subscription {
        gnmi::Subscription {
            path: Some(path::to_proto(&parse(path))),
            mode: mode as i32,
            ..Default::default()
        }
    }

    fn poll_request() -> SubscribeRequest {
        SubscribeRequest {
            request: Some(Request::Poll(gnmi::Poll {})),
            ..Default::default()
        }
    }

    async fn recv(rx: &mut Outbound) -> Option<std::result::Result<SubscribeResponse, Status>> {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for response")
    }

    async fn expect_value(rx: &mut Outbound) -> u64 {
        match recv(rx).await {
            Some(Ok(SubscribeResponse {
                response: Some(Response::Update(n)),
                ..
            })) => match n.update[0].val.as_ref().and_then(|v| v.value.clone()) {
                Some(typed_value::Value::UintVal(v)) => v,
                other => panic!("unexpected value {:?}", other),
            },
            other => panic!("expected update, got {:?}", other),
        }
    }

    async fn expect_sync(rx: &mut Outbound) {
        match recv(rx).await {
            Some(Ok(SubscribeResponse {
                response: Some(Response::SyncResponse(true)),
                ..
            })) => {}
            other => panic!("expected sync, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_once_returns_value_then_sync() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", IN_OCTETS, 12345);

        let session = Session::new(
            1,
            cache,
            SessionConfig::default(),
            list("r1", Mode::Once, vec![sub(IN_OCTETS, SubscriptionMode::TargetDefined)]),
            &CancellationToken::new(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        session.run(no_requests(), tx).await.unwrap();

        let first = recv(&mut rx).await.unwrap().unwrap();
        let Some(Response::Update(notification)) = first.response else {
            panic!("expected update");
        };
        assert_eq!(notification.prefix.as_ref().unwrap().target, "r1");
        assert_eq!(
            path::elems(notification.update[0].path.as_ref().unwrap()),
            parse(IN_OCTETS)
        );
        assert_eq!(notification.update[0].val, Some(uint(12345)));

        expect_sync(&mut rx).await;
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_once_updates_only_sends_sync() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", IN_OCTETS, 1);

        let mut subscriptions = list("r1", Mode::Once, vec![sub(IN_OCTETS, SubscriptionMode::OnChange)]);
        subscriptions.updates_only = true;
        let session = Session::new(
            1,
            cache,
            SessionConfig::default(),
            subscriptions,
            &CancellationToken::new(),
        )
        .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        session.run(no_requests(), tx).await.unwrap();

        expect_sync(&mut rx).await;
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_poll_repeats_on_each_poll() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", IN_OCTETS, 1);

        let session = Session::new(
            2,
            Arc::clone(&cache),
            SessionConfig::default(),
            list("r1", Mode::Poll, vec![sub("/interfaces", SubscriptionMode::OnChange)]),
            &CancellationToken::new(),
        )
        .unwrap();

        let (requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        assert_eq!(expect_value(&mut rx).await, 1);
        expect_sync(&mut rx).await;

        put(&cache, "r1", IN_OCTETS, 2);
        requests.send(Ok(poll_request())).await.unwrap();
        assert_eq!(expect_value(&mut rx).await, 2);
        expect_sync(&mut rx).await;

        drop(requests);
        handle.await.unwrap().unwrap();
        assert!(recv(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_poll_rejects_other_requests() {
        let cache = cache_with(&["r1"]);
        let session = Session::new(
            3,
            cache,
            SessionConfig::default(),
            list("r1", Mode::Poll, vec![sub("/interfaces", SubscriptionMode::OnChange)]),
            &CancellationToken::new(),
        )
        .unwrap();

        let (requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        expect_sync(&mut rx).await;
        requests
            .send(Ok(SubscribeRequest {
                request: Some(Request::Subscribe(SubscriptionList::default())),
                ..Default::default()
            }))
            .await
            .unwrap();

        let err = recv(&mut rx).await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_stream_delivers_live_changes_and_unregisters() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", IN_OCTETS, 10);

        let shutdown = CancellationToken::new();
        let session = Session::new(
            4,
            Arc::clone(&cache),
            SessionConfig::default(),
            list(
                "r1",
                Mode::Stream,
                vec![sub("/interfaces/interface[name=*]/state", SubscriptionMode::OnChange)],
            ),
            &shutdown,
        )
        .unwrap();

        let (_requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        assert_eq!(expect_value(&mut rx).await, 10);
        expect_sync(&mut rx).await;
        assert_eq!(cache.matcher().len(), 1);

        put(&cache, "r1", IN_OCTETS, 11);
        assert_eq!(expect_value(&mut rx).await, 11);

        // Not under the subscribed path
        put(&cache, "r1", "/system/state/hostname", 1);
        put(&cache, "r1", "/interfaces/interface[name=eth1]/state/oper-status", 12);
        assert_eq!(expect_value(&mut rx).await, 12);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(cache.matcher().is_empty());
    }

    #[tokio::test]
    async fn test_stream_rejects_second_request() {
        let cache = cache_with(&["r1"]);
        let session = Session::new(
            5,
            Arc::clone(&cache),
            SessionConfig::default(),
            list("r1", Mode::Stream, vec![sub("/interfaces", SubscriptionMode::OnChange)]),
            &CancellationToken::new(),
        )
        .unwrap();

        let (requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        expect_sync(&mut rx).await;
        requests.send(Ok(poll_request())).await.unwrap();

        let err = recv(&mut rx).await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        assert!(handle.await.unwrap().is_err());
        assert!(cache.matcher().is_empty());
    }

    #[tokio::test]
    async fn test_stream_ends_when_client_goes_away() {
        let cache = cache_with(&["r1"]);
        let session = Session::new(
            6,
            Arc::clone(&cache),
            SessionConfig::default(),
            list("r1", Mode::Stream, vec![sub("/interfaces", SubscriptionMode::OnChange)]),
            &CancellationToken::new(),
        )
        .unwrap();

        let (_requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        expect_sync(&mut rx).await;
        drop(rx);

        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(cache.matcher().is_empty());
    }

    #[tokio::test]
    async fn test_stream_sample_sends_initial_sample() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", IN_OCTETS, 7);

        let shutdown = CancellationToken::new();
        let mut sampled = sub("/interfaces", SubscriptionMode::Sample);
        sampled.sample_interval = Duration::from_secs(60).as_nanos() as u64;
        let session = Session::new(
            7,
            Arc::clone(&cache),
            SessionConfig::default(),
            list("r1", Mode::Stream, vec![sampled]),
            &shutdown,
        )
        .unwrap();

        let (_requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        assert_eq!(expect_value(&mut rx).await, 7);
        expect_sync(&mut rx).await;

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    fn fast_ticks() -> SessionConfig {
        SessionConfig {
            default_sample_interval: Duration::from_secs(10),
            min_sample_interval: Duration::from_millis(10),
            min_heartbeat_interval: Duration::from_millis(10),
        }
    }

    fn nanos(ms: u64) -> u64 {
        Duration::from_millis(ms).as_nanos() as u64
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_suppresses_redundant_until_heartbeat() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", "/a/x", 10);
        put(&cache, "r1", "/a/y", 20);

        let shutdown = CancellationToken::new();
        let mut sampled = sub("/a", SubscriptionMode::Sample);
        sampled.sample_interval = nanos(100);
        sampled.suppress_redundant = true;
        sampled.heartbeat_interval = nanos(1000);
        let session = Session::new(
            8,
            Arc::clone(&cache),
            fast_ticks(),
            list("r1", Mode::Stream, vec![sampled]),
            &shutdown,
        )
        .unwrap();

        let (_requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        assert_eq!(expect_value(&mut rx).await, 10);
        assert_eq!(expect_value(&mut rx).await, 20);
        expect_sync(&mut rx).await;
        let start = Instant::now();

        // Only the changed leaf is sampled
        put(&cache, "r1", "/a/y", 21);
        assert_eq!(expect_value(&mut rx).await, 21);
        assert!(start.elapsed() < Duration::from_millis(1000));

        // Unchanged leaves return with the heartbeat
        assert_eq!(expect_value(&mut rx).await, 10);
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert_eq!(expect_value(&mut rx).await, 21);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sample_without_suppression_resends_every_tick() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", "/a/x", 10);

        let shutdown = CancellationToken::new();
        let mut sampled = sub("/a", SubscriptionMode::Sample);
        sampled.sample_interval = nanos(100);
        let session = Session::new(
            9,
            Arc::clone(&cache),
            fast_ticks(),
            list("r1", Mode::Stream, vec![sampled]),
            &shutdown,
        )
        .unwrap();

        let (_requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        assert_eq!(expect_value(&mut rx).await, 10);
        expect_sync(&mut rx).await;
        let start = Instant::now();

        assert_eq!(expect_value(&mut rx).await, 10);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(expect_value(&mut rx).await, 10);
        assert!(start.elapsed() >= Duration::from_millis(200));

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_change_heartbeat_resends_unchanged_values() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", "/a/x", 10);
        put(&cache, "r1", "/a/y", 20);

        let shutdown = CancellationToken::new();
        let mut on_change = sub("/a", SubscriptionMode::OnChange);
        on_change.heartbeat_interval = nanos(300);
        let session = Session::new(
            10,
            Arc::clone(&cache),
            fast_ticks(),
            list("r1", Mode::Stream, vec![on_change]),
            &shutdown,
        )
        .unwrap();

        let (_requests, inbound) = mpsc::channel::<Inbound>(4);
        let (tx, mut rx) = mpsc::channel(16);
        let handle = tokio::spawn(session.run(ReceiverStream::new(inbound), tx));

        assert_eq!(expect_value(&mut rx).await, 10);
        assert_eq!(expect_value(&mut rx).await, 20);
        expect_sync(&mut rx).await;
        let start = Instant::now();

        for beat in 1..=2 {
            assert_eq!(expect_value(&mut rx).await, 10);
            assert_eq!(expect_value(&mut rx).await, 20);
            assert!(start.elapsed() >= Duration::from_millis(300 * beat));
        }

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_sampler_suppresses_unchanged_values() {
        let cache = cache_with(&["r1"]);
        put(&cache, "r1", "/interfaces/interface[name=eth0]/state/counters/in-octets", 1);
        put(&cache, "r1", "/interfaces/interface[name=eth1]/state/counters/in-octets", 1);

        let sampler = Sampler {
            cache: Arc::clone(&cache),
            target: "r1".to_string(),
            pattern: parse("/interfaces"),
            queue: Arc::new(DeliveryQueue::new()),
            last_sent: Arc::new(Mutex::new(HashMap::new())),
        };

        assert_eq!(sampler.sample(true).unwrap(), 2);
        assert_eq!(sampler.sample(true).unwrap(), 0);

        put(&cache, "r1", "/interfaces/interface[name=eth1]/state/counters/in-octets", 2);
        assert_eq!(sampler.sample(true).unwrap(), 1);

        // Heartbeat ignores suppression
        assert_eq!(sampler.sample(false).unwrap(), 2);
    }

    #[test]
    fn test_rejects_invalid_lists() {
        let cache = cache_with(&["r1"]);
        let shutdown = CancellationToken::new();
        let new = |list| Session::new(1, Arc::clone(&cache), SessionConfig::default(), list, &shutdown);

        let empty = new(list("r1", Mode::Stream, vec![]));
        assert!(matches!(empty, Err(GatewayError::InvalidArgument(_))));

        let mut bad_mode = list("r1", Mode::Once, vec![sub("/a", SubscriptionMode::OnChange)]);
        bad_mode.mode = 9;
        assert!(matches!(new(bad_mode), Err(GatewayError::InvalidArgument(_))));

        let mut bad_sub = sub("/a", SubscriptionMode::OnChange);
        bad_sub.mode = 9;
        let bad_sub = new(list("r1", Mode::Stream, vec![bad_sub]));
        assert!(matches!(bad_sub, Err(GatewayError::InvalidArgument(_))));

        let unknown = new(list("r9", Mode::Once, vec![sub("/a", SubscriptionMode::OnChange)]));
        assert!(matches!(unknown, Err(GatewayError::TargetNotFound(t)) if t == "r9"));

        let all = new(list("", Mode::Once, vec![sub("/a", SubscriptionMode::OnChange)])).unwrap();
        assert_eq!(all.state(), SessionState::Init);
    }

    #[test]
    fn test_interval_clamping() {
        let config = SessionConfig {
            default_sample_interval: Duration::from_secs(5),
            min_sample_interval: Duration::from_secs(1),
            min_heartbeat_interval: Duration::from_secs(2),
        };

        assert_eq!(config.sample_interval(0), Duration::from_secs(5));
        assert_eq!(config.sample_interval(1_000), Duration::from_secs(1));
        assert_eq!(
            config.sample_interval(Duration::from_secs(30).as_nanos() as u64),
            Duration::from_secs(30)
        );
        assert_eq!(config.heartbeat_interval(0), None);
        assert_eq!(config.heartbeat_interval(1), Some(Duration::from_secs(2)));
    }
}
