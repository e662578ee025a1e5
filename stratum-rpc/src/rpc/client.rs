//! Stratum RPC client.
//!
//! [`StratumClient`] multiplexes ordinary calls, batches, and subscriptions
//! over one connection. Calls never block on the network: they register a
//! [`PendingResult`] and queue the encoded line, connecting first if needed.
//! Replies are matched back by id no matter the order they arrive in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::connection::{ConnectionHandle, LinkEvents};
use super::correlation::{CorrelationTable, SettleOutcome};
use super::error::{FramingError, RpcError, RpcResult};
use super::framer::{DEFAULT_MAX_LINE_LENGTH, LineFramer};
use super::lifecycle::{ConnectionState, Lifecycle, SendOutcome};
use super::messages::{ClientEvent, Inbound, Request};
use super::method::{MethodPath, is_subscription, validate_method};
use super::pending::PendingResult;
use super::subscriptions::{ListenerId, Subscription, SubscriptionRegistry};
use super::transport::Connector;
use crate::legacy;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client software name sent in the version handshake
    pub client_name: String,

    /// Protocol version requested in the version handshake
    pub protocol_version: String,

    /// Send `server.version` as the first message of every connection
    pub announce_version: bool,

    /// One-off session: skip the idle keepalive
    pub short_term: bool,

    /// Idle time before a keepalive ping
    pub keepalive_interval: Duration,

    /// Limit on opening the stream, and separately on the version handshake
    pub connect_timeout: Duration,

    /// Longest inbound line accepted
    pub max_line_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: concat!("stratum-rpc/", env!("CARGO_PKG_VERSION")).to_string(),
            protocol_version: "1.4".to_string(),
            announce_version: true,
            short_term: false,
            // Servers drop idle clients after about ten minutes
            keepalive_interval: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(30),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_announce_version(mut self, announce: bool) -> Self {
        self.announce_version = announce;
        self
    }

    pub fn with_short_term(mut self, short_term: bool) -> Self {
        self.short_term = short_term;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }
}

/// Server identity learned from the version handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    /// Server software, e.g. "ElectrumX 1.16.0"
    pub software: String,
    /// Negotiated protocol version
    pub protocol: String,
}

impl ServerVersion {
    /// Parse a `server.version` result.
    ///
    /// Current servers answer `[software, protocol]`; very old ones answer
    /// with just the software string, in which case the requested protocol
    /// is assumed.
    fn from_reply(reply: &Value, requested: &str) -> Option<Self> {
        match reply {
            Value::Array(items) => match items.as_slice() {
                [Value::String(software), Value::String(protocol), ..] => Some(Self {
                    software: software.clone(),
                    protocol: protocol.clone(),
                }),
                _ => None,
            },
            Value::String(software) => Some(Self {
                software: software.clone(),
                protocol: requested.to_string(),
            }),
            _ => None,
        }
    }
}

/// Diagnostic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Single requests written
    pub requests_sent: u64,
    /// Batches written
    pub batches_sent: u64,
    /// Response frames received
    pub responses: u64,
    /// Notifications received
    pub notifications: u64,
    /// Lines dropped as unparseable or unclassifiable
    pub malformed_frames: u64,
    /// Responses whose id matched nothing
    pub unknown_responses: u64,
    /// Notifications nobody was listening for
    pub unexpected_notifications: u64,
    /// Connections established
    pub connects: u64,
    /// Connections lost or closed
    pub disconnects: u64,
}

#[derive(Default)]
struct Counters {
    requests_sent: AtomicU64,
    batches_sent: AtomicU64,
    responses: AtomicU64,
    notifications: AtomicU64,
    malformed_frames: AtomicU64,
    unknown_responses: AtomicU64,
    unexpected_notifications: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClientStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        ClientStats {
            requests_sent: get(&self.requests_sent),
            batches_sent: get(&self.batches_sent),
            responses: get(&self.responses),
            notifications: get(&self.notifications),
            malformed_frames: get(&self.malformed_frames),
            unknown_responses: get(&self.unknown_responses),
            unexpected_notifications: get(&self.unexpected_notifications),
            connects: get(&self.connects),
            disconnects: get(&self.disconnects),
        }
    }
}

/// Stratum RPC client for one server.
///
/// Cheap to clone; clones share the connection. Must be used from within a
/// Tokio runtime. Dropping the last clone closes the connection and fails
/// anything still outstanding with [`RpcError::ConnectionLost`].
#[derive(Clone)]
pub struct StratumClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    connector: Box<dyn Connector>,

    /// Last id handed out; the first request gets 2
    last_id: AtomicU64,

    table: CorrelationTable,
    subscriptions: Arc<SubscriptionRegistry>,
    lifecycle: Lifecycle,

    /// Where to send events, if anyone cares
    events: Option<mpsc::Sender<ClientEvent>>,

    server_version: Mutex<Option<ServerVersion>>,
    counters: Counters,
}

impl StratumClient {
    /// Create a client. Nothing connects until the first call.
    pub fn new(connector: impl Connector + 'static, config: ClientConfig) -> Self {
        Self::build(Box::new(connector), config, None)
    }

    /// Create a client that reports lifecycle and traffic anomalies on
    /// `event_tx`.
    pub fn with_events(
        connector: impl Connector + 'static,
        config: ClientConfig,
        event_tx: mpsc::Sender<ClientEvent>,
    ) -> Self {
        Self::build(Box::new(connector), config, Some(event_tx))
    }

    fn build(
        connector: Box<dyn Connector>,
        config: ClientConfig,
        events: Option<mpsc::Sender<ClientEvent>>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                last_id: AtomicU64::new(1),
                table: CorrelationTable::with_registry(Arc::clone(&subscriptions)),
                subscriptions,
                lifecycle: Lifecycle::new(),
                events,
                server_version: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Destination description, for logs.
    pub fn describe(&self) -> String {
        self.inner.connector.describe()
    }

    /// Issue a single call.
    ///
    /// Fails synchronously only for an invalid method name or an
    /// unconvertible legacy address argument; everything else settles
    /// through the returned result.
    pub fn call(&self, method: &str, params: Vec<Value>) -> RpcResult<PendingResult<Value>> {
        self.inner.call(method, params)
    }

    /// Issue several calls as one batch.
    ///
    /// Resolves to the results in request order once every reply is in. If
    /// any member fails, the whole batch fails with the first failing
    /// member's error.
    pub fn call_batch<I, S>(&self, items: I) -> RpcResult<PendingResult<Vec<Value>>>
    where
        I: IntoIterator<Item = (S, Vec<Value>)>,
        S: AsRef<str>,
    {
        let prepared = items
            .into_iter()
            .map(|(method, params)| prepare(method.as_ref(), params))
            .collect::<RpcResult<Vec<_>>>()?;
        if prepared.is_empty() {
            return Err(RpcError::EmptyBatch);
        }

        let requests: Vec<Request> = prepared
            .into_iter()
            .map(|(method, params)| Request::new(self.inner.allocate_id(), method, params))
            .collect();
        let key = requests[0].id;
        let line = LineFramer::encode_line(&requests)?.freeze();

        debug!(msg_id = key, size = requests.len(), "Sending batch");
        let pending = self.inner.table.register_batch(requests)?;
        Counters::bump(&self.inner.counters.batches_sent);
        self.inner.dispatch(key, line);
        Ok(pending)
    }

    /// Subscribe to a notification stream.
    ///
    /// The returned result settles with the server's initial reply; the
    /// [`Subscription`] yields every later notification for the method. The
    /// listener is in place before the request goes out, so nothing that
    /// arrives alongside the reply is missed.
    pub fn subscribe(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> RpcResult<(PendingResult<Value>, Subscription)> {
        validate_method(method)?;
        if !is_subscription(method) {
            return Err(RpcError::NotASubscription(method.to_string()));
        }
        let (method, params) = legacy::rewrite_address_method(method, params)?;

        let subscription = self.inner.subscriptions.register(&method);
        match self
            .inner
            .send_call(method, params, Some(subscription.listener_id()))
        {
            Ok(pending) => Ok((pending, subscription)),
            Err(e) => {
                self.unsubscribe(&subscription);
                Err(e)
            }
        }
    }

    /// Stop delivering notifications to `subscription`.
    ///
    /// Local only: servers offer no general way to cancel a subscription.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.inner
            .subscriptions
            .unsubscribe(subscription.method(), subscription.listener_id())
    }

    /// Start a dotted method name, e.g. `client.method("server").push("banner")`.
    pub fn method(&self, segment: &str) -> MethodPath<'_> {
        MethodPath::new(self, segment)
    }

    /// Connect now instead of on the first call.
    pub async fn connect(&self) -> RpcResult<()> {
        self.inner.ensure_connected().await
    }

    /// Close the connection.
    ///
    /// Outstanding calls fail with [`RpcError::ConnectionLost`] and every
    /// subscription stream ends. Idempotent; a later call reconnects.
    pub fn close(&self) {
        self.inner.close();
    }

    /// True when ordinary traffic can flow without connecting first.
    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.state() == ConnectionState::Connected
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.lifecycle.state()
    }

    /// Server identity from the most recent version handshake.
    pub fn server_version(&self) -> Option<ServerVersion> {
        self.inner.server_version.lock().clone()
    }

    /// Number of requests (batches count once) awaiting replies.
    pub fn in_flight(&self) -> usize {
        self.inner.table.len()
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> ClientStats {
        self.inner.counters.snapshot()
    }
}

impl std::fmt::Debug for StratumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StratumClient")
            .field("server", &self.inner.connector.describe())
            .field("state", &self.inner.lifecycle.state())
            .field("in_flight", &self.inner.table.len())
            .finish()
    }
}

/// Validate a method and apply the legacy address rewrite.
fn prepare(method: &str, params: Vec<Value>) -> RpcResult<(String, Vec<Value>)> {
    validate_method(method)?;
    legacy::rewrite_address_method(method, params)
}

impl Inner {
    fn allocate_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn call(
        self: &Arc<Self>,
        method: &str,
        params: Vec<Value>,
    ) -> RpcResult<PendingResult<Value>> {
        let (method, params) = prepare(method, params)?;
        self.send_call(method, params, None)
    }

    /// Register and dispatch one request. `listener` marks a subscribe call
    /// whose listener goes away if the request fails.
    fn send_call(
        self: &Arc<Self>,
        method: String,
        params: Vec<Value>,
        listener: Option<ListenerId>,
    ) -> RpcResult<PendingResult<Value>> {
        let request = Request::new(self.allocate_id(), method, params);
        let id = request.id;
        let line = LineFramer::encode_line(&request)?.freeze();

        let pending = match listener {
            Some(listener) => self.table.register_subscription(request, listener)?,
            None => self.table.register_call(request)?,
        };
        Counters::bump(&self.counters.requests_sent);
        self.dispatch(id, line);
        Ok(pending)
    }

    /// Put a registered request on the wire, connecting first if needed.
    fn dispatch(self: &Arc<Self>, key: u64, line: Bytes) {
        match self.lifecycle.send_ready(line) {
            SendOutcome::Queued => {}
            SendOutcome::WriterGone => {
                self.table.abandon(key);
            }
            SendOutcome::NotConnected(line) => {
                tokio::spawn(Arc::clone(self).connect_then_send(key, line));
            }
        }
    }

    async fn connect_then_send(self: Arc<Self>, key: u64, line: Bytes) {
        // Failed by close() before this task ran; nothing left to connect for
        if !self.table.contains(key) {
            trace!(msg_id = key, "Request settled before connecting");
            return;
        }

        if let Err(e) = self.ensure_connected().await {
            self.table.reject(key, e);
            return;
        }

        // Closed while we waited; the request was already failed
        if !self.table.contains(key) {
            return;
        }

        if !matches!(self.lifecycle.send_ready(line), SendOutcome::Queued) {
            self.table.abandon(key);
        }
    }

    /// Bring up a connection unless one is ready.
    ///
    /// Attempts are serialized. Callers that queued behind an attempt share
    /// its outcome instead of starting their own. A close() while waiting
    /// ends the wait with [`RpcError::ConnectionLost`].
    async fn ensure_connected(self: &Arc<Self>) -> RpcResult<()> {
        if self.lifecycle.state() == ConnectionState::Connected {
            return Ok(());
        }

        let epoch = self.lifecycle.close_epoch();
        let seen = self.lifecycle.attempts_finished();
        let _guard = self.lifecycle.connect_lock().lock().await;

        if self.lifecycle.close_epoch() != epoch {
            debug!("Closed while waiting to connect");
            return Err(RpcError::ConnectionLost);
        }
        if self.lifecycle.state() == ConnectionState::Connected {
            return Ok(());
        }
        if self.lifecycle.attempts_finished() != seen {
            if let Some(error) = self.lifecycle.last_failure() {
                return Err(error);
            }
        }

        let result = self.attempt_connect(epoch).await;
        // An attempt discarded by close() is not a failure to share
        let failure = result.as_ref().err().filter(|e| !e.is_connection_lost());
        self.lifecycle.finish_attempt(failure);
        result
    }

    async fn attempt_connect(self: &Arc<Self>, epoch: u64) -> RpcResult<()> {
        self.lifecycle.set_state(ConnectionState::Connecting);
        debug!(server = %self.connector.describe(), "Connecting");

        let timeout = self.config.connect_timeout;
        let streams = match tokio::time::timeout(timeout, self.connector.connect()).await {
            Ok(Ok(streams)) => streams,
            Ok(Err(e)) => {
                warn!(server = %self.connector.describe(), error = %e, "Connect failed");
                self.lifecycle.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                warn!(server = %self.connector.describe(), "Connect timed out");
                self.lifecycle.set_state(ConnectionState::Disconnected);
                return Err(RpcError::Timeout);
            }
        };

        if self.lifecycle.close_epoch() != epoch {
            debug!("Discarding connection opened across close()");
            self.lifecycle.set_state(ConnectionState::Disconnected);
            return Err(RpcError::ConnectionLost);
        }

        let generation = self.lifecycle.next_generation();
        let handle = ConnectionHandle::spawn(
            streams,
            generation,
            self.config.max_line_length,
            Arc::downgrade(self),
        );
        let peer = handle.peer();
        let keepalive_token = handle.child_token();
        self.lifecycle.install(handle);

        if self.config.announce_version {
            if let Err(e) = self.handshake().await {
                warn!(error = %e, "Version handshake failed");
                if let Some(handle) = self.lifecycle.take_if_current(generation) {
                    handle.shutdown();
                }
                self.lifecycle.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        }

        if self.lifecycle.close_epoch() != epoch || !self.lifecycle.mark_connected(generation) {
            debug!(generation, "Connection went away during handshake");
            return Err(RpcError::ConnectionLost);
        }

        if !self.config.short_term {
            tokio::spawn(keepalive(
                Arc::downgrade(self),
                keepalive_token,
                self.config.keepalive_interval,
            ));
        }

        Counters::bump(&self.counters.connects);
        debug!(server = %self.connector.describe(), generation, peer = ?peer, "Connected");
        self.emit(ClientEvent::Connected { generation, peer });
        Ok(())
    }

    /// Announce ourselves with `server.version` ahead of any other traffic.
    async fn handshake(&self) -> RpcResult<()> {
        let request = Request::new(
            self.allocate_id(),
            "server.version",
            vec![
                json!(self.config.client_name),
                json!(self.config.protocol_version),
            ],
        );
        let id = request.id;
        let line = LineFramer::encode_line(&request)?.freeze();

        let pending = self.table.register_call(request)?;
        Counters::bump(&self.counters.requests_sent);
        if !self.lifecycle.send_any(line) {
            self.table.abandon(id);
        }

        let reply = match tokio::time::timeout(self.config.connect_timeout, pending).await {
            Ok(reply) => reply?,
            Err(_) => {
                self.table.abandon(id);
                return Err(RpcError::Timeout);
            }
        };
        match ServerVersion::from_reply(&reply, &self.config.protocol_version) {
            Some(version) => {
                debug!(
                    software = %version.software,
                    protocol = %version.protocol,
                    "Server version"
                );
                *self.server_version.lock() = Some(version);
            }
            None => warn!(reply = %reply, "Unrecognized server.version reply"),
        }
        Ok(())
    }

    fn close(&self) {
        let handle = self.lifecycle.begin_close();
        let generation = handle.as_ref().map(ConnectionHandle::generation);
        drop(handle);

        let abandoned = self.table.abandon_all();
        let listeners = self.subscriptions.clear();
        self.lifecycle.finish_close();

        if let Some(generation) = generation {
            debug!(generation, abandoned, listeners, "Connection closed");
            Counters::bump(&self.counters.disconnects);
            self.emit(ClientEvent::Disconnected {
                generation,
                abandoned,
            });
        }
    }

    fn note_outcome(&self, outcome: SettleOutcome) {
        if let SettleOutcome::UnknownId(id) = outcome {
            Counters::bump(&self.counters.unknown_responses);
            self.emit(ClientEvent::UnknownResponse { id });
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(tx) = &self.events {
            if tx.try_send(event).is_err() {
                trace!("Event observer not keeping up; event dropped");
            }
        }
    }
}

impl LinkEvents for Inner {
    fn on_message(&self, value: Value) {
        match Inbound::classify(value) {
            Ok(Inbound::Response(response)) => {
                Counters::bump(&self.counters.responses);
                let outcome = self.table.settle(response);
                self.note_outcome(outcome);
            }
            Ok(Inbound::Batch(responses)) => {
                Counters::bump(&self.counters.responses);
                let outcome = self.table.settle_batch(responses);
                self.note_outcome(outcome);
            }
            Ok(Inbound::Notification(notification)) => {
                Counters::bump(&self.counters.notifications);
                let kept = self.events.as_ref().map(|_| notification.params.clone());
                let delivered = self
                    .subscriptions
                    .notify(&notification.method, notification.params);
                if delivered == 0 {
                    Counters::bump(&self.counters.unexpected_notifications);
                    if let Some(params) = kept {
                        self.emit(ClientEvent::UnexpectedNotification {
                            method: notification.method,
                            params,
                        });
                    }
                }
            }
            Ok(Inbound::ServerRequest { id, method }) => {
                warn!(msg_id = %id, method = %method, "Server sent a request; ignoring");
                Counters::bump(&self.counters.unexpected_notifications);
            }
            Err(e) => {
                warn!(error = %e, "Discarding unclassifiable message");
                Counters::bump(&self.counters.malformed_frames);
                self.emit(ClientEvent::MalformedFrame(e.to_string()));
            }
        }
    }

    fn on_malformed(&self, error: FramingError) {
        warn!(error = %error, "Discarding malformed line");
        Counters::bump(&self.counters.malformed_frames);
        self.emit(ClientEvent::MalformedFrame(error.to_string()));
    }

    fn on_closed(&self, generation: u64, error: Option<RpcError>) {
        let Some(handle) = self.lifecycle.take_if_current(generation) else {
            trace!(generation, "Ignoring loss of a replaced connection");
            return;
        };
        drop(handle);

        // Anything allocated from here on waits for the next connection
        let last_id = self.last_id.load(Ordering::Relaxed);
        let abandoned = self.table.abandon_through(last_id);
        let listeners = self.subscriptions.clear();
        match error {
            Some(e) => warn!(generation, abandoned, listeners, error = %e, "Connection lost"),
            None => warn!(generation, abandoned, listeners, "Connection lost"),
        }

        Counters::bump(&self.counters.disconnects);
        self.emit(ClientEvent::Disconnected {
            generation,
            abandoned,
        });
    }
}

/// Ping the server whenever the connection has been idle for `interval`.
///
/// Ends with the connection (its token is a child of the connection's) or
/// with the client.
async fn keepalive(inner: Weak<Inner>, token: CancellationToken, interval: Duration) {
    loop {
        let wait = match inner.upgrade() {
            Some(inner) => interval.saturating_sub(inner.lifecycle.idle_for()),
            None => return,
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        let Some(client) = inner.upgrade() else {
            return;
        };
        if client.lifecycle.state() != ConnectionState::Connected {
            return;
        }
        if client.lifecycle.idle_for() < interval {
            continue;
        }

        debug!("Connection idle; sending keepalive");
        let ping = client.call("server.ping", vec![]);
        drop(client);

        let result = match ping {
            Ok(pending) => pending.await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => trace!("Keepalive answered"),
            Err(e) if e.is_connection_lost() => debug!("Keepalive abandoned with connection"),
            Err(e) => warn!(error = %e, "Keepalive ping failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::transport::mock::{MockAcceptor, MockConnector, MockServer};
    use tokio_stream::StreamExt;

    fn quiet_config() -> ClientConfig {
        ClientConfig::default()
            .with_announce_version(false)
            .with_short_term(true)
    }

    /// Client with a connection already established; no handshake.
    async fn connected(config: ClientConfig) -> (StratumClient, MockServer, MockAcceptor) {
        let (connector, mut acceptor) = MockConnector::pair();
        let client = StratumClient::new(connector, config);
        client.connect().await.unwrap();
        let server = acceptor.accept().await;
        (client, server, acceptor)
    }

    #[tokio::test]
    async fn test_server_version_call() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let pending = client
            .call("server.version", vec![json!("X"), json!("1.4")])
            .unwrap();
        assert_eq!(pending.id(), 2);

        let request = server.recv_value().await.unwrap();
        assert_eq!(
            request,
            json!({"id": 2, "method": "server.version", "params": ["X", "1.4"]})
        );

        server
            .send_value(json!({"id": 2, "result": ["ElectrumX 1.13.0", "1.4"]}))
            .await;
        assert_eq!(pending.await.unwrap(), json!(["ElectrumX 1.13.0", "1.4"]));
    }

    #[tokio::test]
    async fn test_first_call_connects_lazily() {
        let (connector, mut acceptor) = MockConnector::pair();
        let client = StratumClient::new(connector, quiet_config());
        assert_eq!(client.state(), ConnectionState::Disconnected);

        let pending = client.call("server.ping", vec![]).unwrap();
        let mut server = acceptor.accept().await;

        let request = server.recv_request().await;
        assert_eq!(request.method, "server.ping");
        server.respond(request.id, Value::Null).await;

        assert_eq!(pending.await.unwrap(), Value::Null);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let first = client.call("blockchain.headers.get", vec![json!(1)]).unwrap();
        let second = client.call("blockchain.headers.get", vec![json!(2)]).unwrap();
        let a = server.recv_request().await;
        let b = server.recv_request().await;

        server.respond(b.id, json!("two")).await;
        server.respond(a.id, json!("one")).await;

        assert_eq!(second.await.unwrap(), json!("two"));
        assert_eq!(first.await.unwrap(), json!("one"));
    }

    #[tokio::test]
    async fn test_batch_resolves_in_request_order() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        // Burn ids 2..=9 so the batch gets 10 and 11
        for _ in 0..8 {
            let _ = client.inner.allocate_id();
        }

        let pending = client
            .call_batch(vec![("a.b", vec![json!(1)]), ("a.c", vec![json!(2)])])
            .unwrap();
        assert_eq!(pending.id(), 10);

        let batch = server.recv_batch().await;
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![10, 11]);
        assert_eq!(batch[1].method, "a.c");

        server
            .send_value(json!([{"id": 11, "result": "Y"}, {"id": 10, "result": "X"}]))
            .await;
        assert_eq!(pending.await.unwrap(), vec![json!("X"), json!("Y")]);
    }

    #[tokio::test]
    async fn test_batch_item_error_fails_batch() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let pending = client
            .call_batch(vec![("a.b", vec![]), ("a.c", vec![])])
            .unwrap();
        let batch = server.recv_batch().await;

        server
            .send_value(json!([
                {"id": batch[0].id, "result": 1},
                {"id": batch[1].id, "error": {"code": -32601, "message": "unknown method"}},
            ]))
            .await;

        match pending.await {
            Err(RpcError::Server { error, request }) => {
                assert_eq!(error.code(), Some(-32601));
                assert_eq!(request.method, "a.c");
            }
            other => panic!("Expected server error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_batch_settles_despite_unusable_element() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let pending = client
            .call_batch(vec![("a.b", vec![]), ("a.c", vec![])])
            .unwrap();
        let batch = server.recv_batch().await;

        server
            .send_value(json!([
                {"id": batch[0].id, "result": 1},
                {"id": null, "error": {"code": -32600, "message": "invalid request"}},
            ]))
            .await;

        assert_eq!(pending.await.unwrap(), vec![json!(1), Value::Null]);
        assert_eq!(client.in_flight(), 0);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_peers_subscription() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let (initial, mut peers) = client.subscribe("server.peers.subscribe", vec![]).unwrap();
        let request = server.recv_request().await;
        assert_eq!(request.method, "server.peers.subscribe");

        let three = json!([
            ["1.2.3.4", "a", ["t"]],
            ["5.6.7.8", "b", ["t"]],
            ["9.9.9.9", "c", ["s"]]
        ]);
        server.respond(request.id, three.clone()).await;
        server.notify("server.peers.subscribe", json!(["N1"])).await;
        server.notify("server.peers.subscribe", json!(["N2"])).await;

        assert_eq!(initial.await.unwrap(), three);
        assert_eq!(peers.next().await, Some(json!(["N1"])));
        assert_eq!(peers.next().await, Some(json!(["N2"])));
    }

    #[tokio::test]
    async fn test_notification_before_reply_is_captured() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let (initial, mut headers) = client
            .subscribe("blockchain.headers.subscribe", vec![])
            .unwrap();
        let request = server.recv_request().await;

        server
            .notify("blockchain.headers.subscribe", json!([{"height": 101}]))
            .await;
        server.respond(request.id, json!({"height": 100})).await;

        assert_eq!(initial.await.unwrap(), json!({"height": 100}));
        assert_eq!(headers.recv().await, Some(json!([{"height": 101}])));
    }

    #[tokio::test]
    async fn test_subscription_ends_when_connect_fails() {
        let (connector, acceptor) = MockConnector::pair();
        acceptor.fail_next(1);
        let client = StratumClient::new(connector, quiet_config());

        let (initial, mut sub) = client.subscribe("a.subscribe", vec![]).unwrap();
        assert!(matches!(initial.await, Err(RpcError::ConnectFailed(_))));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let (_initial, mut sub) = client.subscribe("a.subscribe", vec![]).unwrap();
        let _ = server.recv_request().await;

        assert!(client.unsubscribe(&sub));
        server.notify("a.subscribe", json!(1)).await;

        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_disconnect_rejects_all_in_flight() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let calls: Vec<_> = (0..5)
            .map(|i| client.call("blockchain.block.header", vec![json!(i)]).unwrap())
            .collect();
        let (_initial, mut sub) = client.subscribe("a.subscribe", vec![]).unwrap();
        for _ in 0..6 {
            let _ = server.recv_request().await;
        }
        assert_eq!(client.in_flight(), 6);

        drop(server);

        for pending in calls {
            assert!(pending.await.unwrap_err().is_connection_lost());
        }
        assert_eq!(sub.recv().await, None);
        assert_eq!(client.in_flight(), 0);
        assert!(!client.is_connected());
        assert_eq!(client.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_loss() {
        let (client, server, mut acceptor) = connected(quiet_config()).await;
        let pending = client.call("server.ping", vec![]).unwrap();
        drop(server);
        assert!(pending.await.unwrap_err().is_connection_lost());

        // Nothing is replayed; the next call opens a fresh connection
        let pending = client.call("server.banner", vec![]).unwrap();
        let mut server = acceptor.accept().await;
        let request = server.recv_request().await;
        assert_eq!(request.method, "server.banner");
        server.respond(request.id, json!("hello")).await;

        assert_eq!(pending.await.unwrap(), json!("hello"));
        assert_eq!(acceptor.attempts(), 2);
    }

    #[tokio::test]
    async fn test_malformed_line_between_replies() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let a = client.call("a.a", vec![]).unwrap();
        let b = client.call("a.b", vec![]).unwrap();
        let ra = server.recv_request().await;
        let rb = server.recv_request().await;

        let lines = format!(
            "{{\"id\":{},\"result\":\"A\"}}\n{{not json\n{{\"id\":{},\"result\":\"B\"}}\n",
            ra.id, rb.id
        );
        server.send_raw(lines.as_bytes()).await;

        assert_eq!(a.await.unwrap(), json!("A"));
        assert_eq!(b.await.unwrap(), json!("B"));
        assert_eq!(client.stats().malformed_frames, 1);
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_reply_and_stray_notification_are_reported() {
        let (connector, mut acceptor) = MockConnector::pair();
        let (event_tx, mut events) = mpsc::channel(16);
        let client = StratumClient::with_events(connector, quiet_config(), event_tx);
        client.connect().await.unwrap();
        let mut server = acceptor.accept().await;

        assert!(matches!(
            events.recv().await,
            Some(ClientEvent::Connected { generation: 1, .. })
        ));

        server.respond(999, json!(true)).await;
        server.notify("nobody.subscribe", json!([1])).await;

        assert_eq!(events.recv().await, Some(ClientEvent::UnknownResponse { id: 999 }));
        assert_eq!(
            events.recv().await,
            Some(ClientEvent::UnexpectedNotification {
                method: "nobody.subscribe".to_string(),
                params: json!([1]),
            })
        );

        let stats = client.stats();
        assert_eq!(stats.unknown_responses, 1);
        assert_eq!(stats.unexpected_notifications, 1);
    }

    #[tokio::test]
    async fn test_contract_violations_fail_synchronously() {
        let (connector, acceptor) = MockConnector::pair();
        let client = StratumClient::new(connector, quiet_config());

        assert!(matches!(client.call("ping", vec![]), Err(RpcError::InvalidMethod(_))));
        assert!(matches!(client.call("", vec![]), Err(RpcError::InvalidMethod(_))));
        assert!(matches!(
            client.call_batch(Vec::<(&str, Vec<Value>)>::new()),
            Err(RpcError::EmptyBatch)
        ));
        assert!(matches!(
            client.subscribe("server.version", vec![]),
            Err(RpcError::NotASubscription(_))
        ));
        assert!(matches!(
            client.call("blockchain.address.get_balance", vec![json!("nope")]),
            Err(RpcError::InvalidAddress(_))
        ));

        // No ids consumed, nothing registered, nothing connected
        assert_eq!(client.inner.allocate_id(), 2);
        assert_eq!(client.in_flight(), 0);
        assert_eq!(acceptor.attempts(), 0);
    }

    #[tokio::test]
    async fn test_legacy_address_method_rewritten() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let _pending = client
            .call(
                "blockchain.address.get_balance",
                vec![json!("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa")],
            )
            .unwrap();

        let request = server.recv_request().await;
        assert_eq!(request.method, "blockchain.scripthash.get_balance");
        assert_eq!(
            request.params,
            vec![json!("8b01df4e368ea28f8dc0423bcf7a4923e3a12d307c875e47a0cfbf90b5c39161")]
        );
    }

    #[tokio::test]
    async fn test_version_handshake_on_connect() {
        let (connector, mut acceptor) = MockConnector::pair();
        let config = ClientConfig::default()
            .with_client_name("test-client")
            .with_short_term(true);
        let client = StratumClient::new(connector, config);

        let pending = client.call("server.banner", vec![]).unwrap();
        let mut server = acceptor.accept().await;

        // Handshake goes first even though the banner call was issued first
        let version = server.answer_version("ElectrumX 1.16.0", "1.4").await;
        assert_eq!(version.params, vec![json!("test-client"), json!("1.4")]);

        let banner = server.recv_request().await;
        assert_eq!(banner.method, "server.banner");
        server.respond(banner.id, json!("welcome")).await;

        assert_eq!(pending.await.unwrap(), json!("welcome"));
        assert_eq!(
            client.server_version(),
            Some(ServerVersion {
                software: "ElectrumX 1.16.0".to_string(),
                protocol: "1.4".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_rejected_handshake_fails_waiting_calls() {
        let (connector, mut acceptor) = MockConnector::pair();
        let client = StratumClient::new(connector, ClientConfig::default().with_short_term(true));

        let pending = client.call("server.banner", vec![]).unwrap();
        let mut server = acceptor.accept().await;
        let version = server.recv_request().await;
        server
            .send_value(json!({
                "id": version.id,
                "error": {"code": 1, "message": "unsupported protocol version"},
            }))
            .await;

        match pending.await {
            Err(RpcError::Server { request, .. }) => assert_eq!(request.method, "server.version"),
            other => panic!("Expected handshake error, got {:?}", other),
        }
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_concurrent_calls_share_one_connect() {
        let (connector, mut acceptor) = MockConnector::pair_with_delay(Duration::from_millis(20));
        let client = StratumClient::new(connector, quiet_config());

        let calls: Vec<_> = (0..5)
            .map(|_| client.call("server.ping", vec![]).unwrap())
            .collect();

        let mut server = acceptor.accept().await;
        for _ in 0..5 {
            let request = server.recv_request().await;
            server.respond(request.id, Value::Null).await;
        }
        for pending in calls {
            pending.await.unwrap();
        }
        assert_eq!(acceptor.attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_connect_rejects_triggering_calls() {
        let (connector, acceptor) = MockConnector::pair_with_delay(Duration::from_millis(20));
        acceptor.fail_next(1);
        let client = StratumClient::new(connector, quiet_config());

        let a = client.call("server.ping", vec![]).unwrap();
        let b = client.call("server.ping", vec![]).unwrap();

        assert!(matches!(a.await, Err(RpcError::ConnectFailed(_))));
        assert!(matches!(b.await, Err(RpcError::ConnectFailed(_))));
        assert_eq!(acceptor.attempts(), 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let (connector, _acceptor) = MockConnector::pair_with_delay(Duration::from_secs(60));
        let config = quiet_config().with_connect_timeout(Duration::from_secs(5));
        let client = StratumClient::new(connector, config);

        assert!(matches!(client.connect().await, Err(RpcError::Timeout)));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_reconnects_later() {
        let (client, server, mut acceptor) = connected(quiet_config()).await;
        let pending = client.call("server.ping", vec![]).unwrap();

        client.close();
        client.close();
        assert!(pending.await.unwrap_err().is_connection_lost());
        assert_eq!(client.state(), ConnectionState::Disconnected);
        drop(server);

        let again = client.call("server.ping", vec![]).unwrap();
        let mut server = acceptor.accept().await;
        let request = server.recv_request().await;
        server.respond(request.id, Value::Null).await;
        again.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_right_after_call_does_not_connect() {
        let (connector, acceptor) = MockConnector::pair();
        let client = StratumClient::new(connector, quiet_config());

        let pending = client.call("server.ping", vec![]).unwrap();
        client.close();
        assert!(pending.await.unwrap_err().is_connection_lost());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acceptor.attempts(), 0);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_waiters_behind_closed_attempt_do_not_reconnect() {
        let (connector, mut acceptor) = MockConnector::pair_with_delay(Duration::from_millis(50));
        let client = StratumClient::new(connector, quiet_config());

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move { client.connect().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close();

        for waiter in waiters {
            assert!(waiter.await.unwrap().unwrap_err().is_connection_lost());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(acceptor.attempts(), 1);
        assert!(!client.is_connected());

        // The one stream that was opened is dropped unused
        let mut server = acceptor.accept().await;
        assert!(server.recv_value().await.is_none());
    }

    #[tokio::test]
    async fn test_close_during_connect_discards_connection() {
        let (connector, mut acceptor) = MockConnector::pair_with_delay(Duration::from_millis(50));
        let client = StratumClient::new(connector, quiet_config());

        let connecting = {
            let client = client.clone();
            tokio::spawn(async move { client.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        client.close();

        assert!(connecting.await.unwrap().unwrap_err().is_connection_lost());
        assert!(!client.is_connected());

        // The discarded stream is dropped by the client
        let mut server = acceptor.accept().await;
        assert!(server.recv_value().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_pings_when_idle() {
        let config = quiet_config()
            .with_short_term(false)
            .with_keepalive_interval(Duration::from_secs(300));
        let (_client, mut server, _acceptor) = connected(config).await;

        let started = tokio::time::Instant::now();
        let ping = server.recv_request().await;
        assert_eq!(ping.method, "server.ping");
        assert!(started.elapsed() >= Duration::from_secs(299));
        server.respond(ping.id, Value::Null).await;

        let ping = server.recv_request().await;
        assert_eq!(ping.method, "server.ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_short_term_session_has_no_keepalive() {
        let (_client, mut server, _acceptor) = connected(quiet_config()).await;

        let idle = tokio::time::timeout(Duration::from_secs(3600), server.recv_value()).await;
        assert!(idle.is_err());
    }

    #[tokio::test]
    async fn test_method_path_builder() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;

        let path = client.method("blockchain").push("headers").push("subscribe");
        assert_eq!(path.path(), "blockchain.headers.subscribe");
        let (_initial, _sub) = path.subscribe(vec![]).unwrap();

        let _pending = client.method("server").push("banner").call(vec![]).unwrap();

        assert_eq!(server.recv_request().await.method, "blockchain.headers.subscribe");
        assert_eq!(server.recv_request().await.method, "server.banner");
    }

    #[tokio::test]
    async fn test_dropping_client_fails_outstanding() {
        let (client, mut server, _acceptor) = connected(quiet_config()).await;
        let pending = client.call("server.ping", vec![]).unwrap();
        let _ = server.recv_request().await;

        drop(client);
        assert!(pending.await.unwrap_err().is_connection_lost());
        assert!(server.recv_value().await.is_none());
    }

    #[test]
    fn test_server_version_reply_shapes() {
        assert_eq!(
            ServerVersion::from_reply(&json!(["ElectrumX 1.16.0", "1.4"]), "1.4"),
            Some(ServerVersion {
                software: "ElectrumX 1.16.0".to_string(),
                protocol: "1.4".to_string(),
            })
        );
        assert_eq!(
            ServerVersion::from_reply(&json!("ElectrumX 1.0"), "1.2").map(|v| v.protocol),
            Some("1.2".to_string())
        );
        assert_eq!(ServerVersion::from_reply(&json!(42), "1.4"), None);
    }
}
