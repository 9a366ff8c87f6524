//! The hub connection: the RPC state machine on top of a connection.
//!
//! A [`HubConnection`] drives the hub handshake, demultiplexes inbound
//! messages to pending invocations and registered client methods, tracks
//! invocation IDs, and keeps the connection alive with periodic pings.
//! Lifecycle notifications reach the application through a
//! [`HubConnectionDelegate`], always on the configured callback queue.

pub mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_channel::{mpsc, oneshot};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::callback::CallbackQueue;
use crate::config::{HttpConnectionOptions, HubConnectionOptions};
use crate::connection::{
    Connection, ConnectionEvent, ConnectionFactory, HttpConnection, NoReconnectPolicy,
    ReconnectPolicy, ReconnectableConnection,
};
use crate::error::HubError;
use crate::hub::registry::{ArgumentExtractor, InvocationRegistry, PendingInvocation};
use crate::protocol::{handshake, HubMessage, HubProtocol, JsonHubProtocol};
use crate::transport::{TransportFactory, WebSocketTransportFactory};

/// Observer of hub lifecycle events.
///
/// All methods default to no-ops and run on the callback queue, never
/// under an internal lock.
pub trait HubConnectionDelegate: Send + Sync + 'static {
    fn connection_did_open(&self) {}
    fn connection_did_fail_to_open(&self, _error: HubError) {}
    fn connection_did_close(&self, _error: Option<HubError>) {}
    fn connection_will_reconnect(&self, _error: HubError) {}
    fn connection_did_reconnect(&self) {}
    fn connection_reconnect_attempt(&self, _attempt: u32) {}
}

/// Identifies a streaming invocation for cancellation.
#[derive(Debug, Clone, Default)]
pub struct StreamHandle {
    invocation_id: String,
}

impl StreamHandle {
    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }
}

/// Where the hub handshake stands for the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeStatus {
    /// The next inbound frame must start with the server's handshake
    /// reply. `reconnecting` selects which open event fires afterwards.
    NeedsHandling { reconnecting: bool },
    Handled,
}

struct HubInner {
    registry: InvocationRegistry,
    handshake_status: HandshakeStatus,
    keep_alive: Option<JoinHandle<()>>,
    keep_alive_enabled: bool,
}

/// A connection to a hub: remote invocations out, streams and client
/// method calls in.
pub struct HubConnection {
    connection: Arc<dyn Connection>,
    protocol: Arc<dyn HubProtocol>,
    options: HubConnectionOptions,
    callback_queue: CallbackQueue,
    delegate: Mutex<Option<Arc<dyn HubConnectionDelegate>>>,
    inner: Mutex<HubInner>,
    invocations_issued: AtomicU64,
    weak_self: Weak<HubConnection>,
}

impl HubConnection {
    /// Builds a hub connection over `connection`, consuming its event
    /// stream. Must be called from within a tokio runtime.
    pub fn new(
        connection: Arc<dyn Connection>,
        events: mpsc::UnboundedReceiver<ConnectionEvent>,
        protocol: Arc<dyn HubProtocol>,
        options: HubConnectionOptions,
    ) -> Arc<Self> {
        let callback_queue = options.callback_queue.clone().unwrap_or_default();
        let hub = Arc::new_cyclic(|weak| Self {
            connection,
            protocol,
            options,
            callback_queue,
            delegate: Mutex::new(None),
            inner: Mutex::new(HubInner {
                registry: InvocationRegistry::new(),
                handshake_status: HandshakeStatus::NeedsHandling {
                    reconnecting: false,
                },
                keep_alive: None,
                keep_alive_enabled: false,
            }),
            invocations_issued: AtomicU64::new(0),
            weak_self: weak.clone(),
        });

        let weak = Arc::downgrade(&hub);
        let mut events = events;
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(hub) = weak.upgrade() else { break };
                hub.handle_connection_event(event).await;
            }
        });

        hub
    }

    pub async fn set_delegate(&self, delegate: Arc<dyn HubConnectionDelegate>) {
        *self.delegate.lock().await = Some(delegate);
    }

    pub async fn start(&self) {
        info!("starting hub connection");
        self.connection.start().await;
    }

    pub async fn stop(&self) {
        self.connection.stop(None).await;
    }

    /// Registers a handler for a server-to-client method. Re-registering
    /// a name replaces the previous handler.
    pub async fn on<F>(&self, method: &str, handler: F)
    where
        F: Fn(ArgumentExtractor) -> Result<(), HubError> + Send + Sync + 'static,
    {
        self.inner
            .lock()
            .await
            .registry
            .register_method(method.to_string(), Arc::new(handler));
    }

    /// Fire-and-forget invocation: no ID, no completion.
    pub async fn send(&self, method: &str, arguments: Vec<Value>) -> Result<(), HubError> {
        self.ensure_handshake_handled().await?;
        let message = HubMessage::Invocation {
            invocation_id: None,
            target: method.to_string(),
            arguments,
        };
        self.write_message(&message).await
    }

    /// Invokes a hub method and decodes its single result.
    pub async fn invoke<R: DeserializeOwned>(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<R, HubError> {
        let (invocation_id, result) = {
            let mut inner = self.inner.lock().await;
            if inner.handshake_status != HandshakeStatus::Handled {
                return Err(handshake_not_handled());
            }
            let invocation_id = self.next_invocation_id();
            let (sender, result) = oneshot::channel();
            inner
                .registry
                .register(invocation_id.clone(), PendingInvocation::Single(sender));
            (invocation_id, result)
        };

        let message = HubMessage::Invocation {
            invocation_id: Some(invocation_id.clone()),
            target: method.to_string(),
            arguments,
        };
        if let Err(error) = self.write_message(&message).await {
            self.inner.lock().await.registry.take(&invocation_id);
            return Err(error);
        }

        let value = result
            .await
            .map_err(|_| HubError::HubInvocationCancelled)??;
        serde_json::from_value(value.unwrap_or(Value::Null))
            .map_err(|e| HubError::InvalidOperation(format!("result decode failed: {e}")))
    }

    /// Starts a streaming invocation. Items arrive on the returned
    /// stream; the handle cancels it.
    pub async fn stream<R: DeserializeOwned + Send + 'static>(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<
        (
            StreamHandle,
            impl Stream<Item = Result<R, HubError>> + Unpin + Send,
        ),
        HubError,
    > {
        let (invocation_id, items) = {
            let mut inner = self.inner.lock().await;
            if inner.handshake_status != HandshakeStatus::Handled {
                return Err(handshake_not_handled());
            }
            let invocation_id = self.next_invocation_id();
            let (sender, items) = mpsc::unbounded();
            inner
                .registry
                .register(invocation_id.clone(), PendingInvocation::Stream(sender));
            (invocation_id, items)
        };

        let message = HubMessage::StreamInvocation {
            invocation_id: invocation_id.clone(),
            target: method.to_string(),
            arguments,
        };
        if let Err(error) = self.write_message(&message).await {
            self.inner.lock().await.registry.take(&invocation_id);
            return Err(error);
        }

        let items = items.map(|item: Result<Value, HubError>| {
            item.and_then(|value| {
                serde_json::from_value::<R>(value).map_err(|e| {
                    HubError::InvalidOperation(format!("stream item decode failed: {e}"))
                })
            })
        });
        Ok((StreamHandle { invocation_id }, items))
    }

    /// Asks the server to cancel a streaming invocation. The local
    /// handler stays registered until the server's completion arrives.
    pub async fn cancel_stream_invocation(&self, handle: &StreamHandle) -> Result<(), HubError> {
        if handle.invocation_id.is_empty() {
            return Err(HubError::InvalidOperation("empty stream handle".into()));
        }
        self.ensure_handshake_handled().await?;
        let message = HubMessage::CancelInvocation {
            invocation_id: handle.invocation_id.clone(),
        };
        self.write_message(&message).await
    }

    fn next_invocation_id(&self) -> String {
        (self.invocations_issued.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    async fn ensure_handshake_handled(&self) -> Result<(), HubError> {
        if self.inner.lock().await.handshake_status == HandshakeStatus::Handled {
            Ok(())
        } else {
            Err(handshake_not_handled())
        }
    }

    /// Encodes and sends one message; a successful write re-arms the
    /// keep-alive timer.
    async fn write_message(&self, message: &HubMessage) -> Result<(), HubError> {
        let payload = self.protocol.encode(message)?;
        self.connection.send(payload).await?;
        let mut inner = self.inner.lock().await;
        self.arm_keep_alive(&mut inner);
        Ok(())
    }

    async fn with_delegate<F>(&self, callback: F)
    where
        F: FnOnce(&Arc<dyn HubConnectionDelegate>) + Send + 'static,
    {
        let delegate = self.delegate.lock().await.clone();
        if let Some(delegate) = delegate {
            self.callback_queue.post(move || callback(&delegate));
        }
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { .. } | ConnectionEvent::Reconnected => {
                self.initiate_handshake().await;
            }
            ConnectionEvent::FailedToOpen(error) => {
                warn!(%error, "connection failed to open");
                self.with_delegate(move |d| d.connection_did_fail_to_open(error))
                    .await;
            }
            ConnectionEvent::Data(data) => self.handle_data(&data).await,
            ConnectionEvent::Closed(error) => self.handle_closed(error).await,
            ConnectionEvent::WillReconnect(error) => self.handle_will_reconnect(error).await,
            ConnectionEvent::ReconnectAttempt(attempt) => {
                debug!(attempt, "reconnect attempt");
                self.with_delegate(move |d| d.connection_reconnect_attempt(attempt))
                    .await;
            }
        }
    }

    async fn initiate_handshake(&self) {
        debug!(protocol = self.protocol.name(), "sending hub handshake");
        let request =
            handshake::create_handshake_request(self.protocol.name(), self.protocol.version());
        if let Err(error) = self.connection.send(request).await {
            warn!(%error, "failed to send handshake request");
            self.with_delegate(move |d| d.connection_did_fail_to_open(error))
                .await;
        }
    }

    async fn handle_data(&self, data: &[u8]) {
        let mut inner = self.inner.lock().await;
        let mut remainder = data;

        if let HandshakeStatus::NeedsHandling { reconnecting } = inner.handshake_status {
            match handshake::parse_handshake_response(remainder) {
                Err(error) => {
                    drop(inner);
                    warn!(%error, "handshake response could not be parsed");
                    self.with_delegate(move |d| d.connection_did_fail_to_open(error))
                        .await;
                    return;
                }
                Ok((response, rest)) => {
                    if let Some(message) = response.error {
                        drop(inner);
                        let error = HubError::HandshakeFailed(message);
                        warn!(%error, "server rejected the handshake");
                        self.with_delegate(move |d| d.connection_did_fail_to_open(error))
                            .await;
                        return;
                    }
                    debug!("hub handshake completed");
                    inner.handshake_status = HandshakeStatus::Handled;
                    inner.keep_alive_enabled = self.options.keep_alive_interval.is_some()
                        && !self.connection.inherent_keep_alive().await;
                    self.arm_keep_alive(&mut inner);
                    if reconnecting {
                        self.with_delegate(|d| d.connection_did_reconnect()).await;
                    } else {
                        self.with_delegate(|d| d.connection_did_open()).await;
                    }
                    remainder = rest;
                }
            }
        }

        if remainder.is_empty() {
            return;
        }
        let messages = match self.protocol.parse(remainder) {
            Ok(messages) => messages,
            Err(error) => {
                // A malformed frame never tears down the connection
                warn!(%error, "discarding unparseable frame");
                return;
            }
        };
        for message in messages {
            self.dispatch_message(&mut inner, message).await;
        }
    }

    async fn dispatch_message(&self, inner: &mut HubInner, message: HubMessage) {
        match message {
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                debug!(%invocation_id, "completion received");
                inner.registry.complete(&invocation_id, result, error);
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => inner.registry.deliver_stream_item(&invocation_id, item),
            HubMessage::Invocation {
                target, arguments, ..
            } => match inner.registry.method(&target) {
                Some(handler) => {
                    self.callback_queue.post(move || {
                        if let Err(error) = handler(ArgumentExtractor::new(arguments)) {
                            warn!(%error, "client method handler failed");
                        }
                    });
                }
                None => warn!(method = %target, "no handler for client invocation"),
            },
            HubMessage::Close { error, .. } => {
                info!(?error, "server requested close");
                self.connection
                    .stop(Some(HubError::ServerClose(error)))
                    .await;
            }
            HubMessage::Ping => trace!("ping received"),
            other => debug!(
                message_type = other.message_type(),
                "ignoring unexpected message"
            ),
        }
    }

    async fn handle_will_reconnect(&self, error: HubError) {
        let mut inner = self.inner.lock().await;
        inner.handshake_status = HandshakeStatus::NeedsHandling { reconnecting: true };
        drop(inner);
        self.with_delegate(move |d| d.connection_will_reconnect(error))
            .await;
    }

    async fn handle_closed(&self, error: Option<HubError>) {
        let mut inner = self.inner.lock().await;
        self.clean_up_keep_alive(&mut inner);
        let abort_error = error.clone().unwrap_or(HubError::HubInvocationCancelled);
        inner.registry.abort_all(abort_error);
        inner.handshake_status = HandshakeStatus::NeedsHandling {
            reconnecting: false,
        };
        drop(inner);
        info!(?error, "hub connection closed");
        self.with_delegate(move |d| d.connection_did_close(error))
            .await;
    }

    /// (Re)schedules the keep-alive ping. Must run under the connection's
    /// serialising lock.
    fn arm_keep_alive(&self, inner: &mut HubInner) {
        if !inner.keep_alive_enabled {
            return;
        }
        let Some(interval) = self.options.keep_alive_interval else {
            return;
        };
        if let Some(timer) = inner.keep_alive.take() {
            timer.abort();
        }
        let weak = self.weak_self.clone();
        inner.keep_alive = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(hub) = weak.upgrade() {
                hub.send_ping().await;
            }
        }));
    }

    fn clean_up_keep_alive(&self, inner: &mut HubInner) {
        if let Some(timer) = inner.keep_alive.take() {
            timer.abort();
        }
    }

    async fn send_ping(&self) {
        match self.protocol.encode(&HubMessage::Ping) {
            // A ping that cannot be serialised or sent is only logged;
            // the next successful write re-arms the timer
            Err(error) => warn!(%error, "failed to serialise ping"),
            Ok(payload) => match self.connection.send(payload).await {
                Err(error) => warn!(%error, "keep-alive ping failed"),
                Ok(()) => {
                    trace!("ping sent");
                    let mut inner = self.inner.lock().await;
                    self.arm_keep_alive(&mut inner);
                }
            },
        }
    }
}

fn handshake_not_handled() -> HubError {
    HubError::InvalidOperation("hub handshake has not completed".into())
}

/// Assembles the connection stack behind a [`HubConnection`].
pub struct HubConnectionBuilder {
    url: String,
    http_options: HttpConnectionOptions,
    hub_options: HubConnectionOptions,
    protocol: Arc<dyn HubProtocol>,
    policy: Arc<dyn ReconnectPolicy>,
}

impl HubConnectionBuilder {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            http_options: HttpConnectionOptions::default(),
            hub_options: HubConnectionOptions::default(),
            protocol: Arc::new(JsonHubProtocol),
            policy: Arc::new(NoReconnectPolicy),
        }
    }

    pub fn with_http_options(mut self, options: HttpConnectionOptions) -> Self {
        self.http_options = options;
        self
    }

    pub fn with_hub_options(mut self, options: HubConnectionOptions) -> Self {
        self.hub_options = options;
        self
    }

    pub fn with_protocol(mut self, protocol: impl HubProtocol) -> Self {
        self.protocol = Arc::new(protocol);
        self
    }

    pub fn with_reconnect_policy(mut self, policy: impl ReconnectPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Reconnects with the default 0s/2s/10s/30s ladder.
    pub fn with_automatic_reconnect(mut self) -> Self {
        self.policy = Arc::new(crate::connection::DefaultReconnectPolicy::default());
        self
    }

    /// Builds the hub connection. Must be called from within a tokio
    /// runtime; the connection is not started.
    pub fn build(self) -> Result<Arc<HubConnection>, HubError> {
        let url = Url::parse(&self.url)?;
        let format = self.protocol.transfer_format();
        let transport_factory: Arc<dyn TransportFactory> = Arc::new(WebSocketTransportFactory);
        let http_options = self.http_options;

        let factory: ConnectionFactory = Box::new(move || {
            let (events, events_rx) = mpsc::unbounded();
            let connection: Arc<dyn Connection> = HttpConnection::new(
                url.clone(),
                http_options.clone(),
                transport_factory.clone(),
                format,
                events,
            );
            (connection, events_rx)
        });

        let (events, events_rx) = mpsc::unbounded();
        let connection = ReconnectableConnection::new(factory, self.policy, events);
        Ok(HubConnection::new(
            connection,
            events_rx,
            self.protocol,
            self.hub_options,
        ))
    }
}
