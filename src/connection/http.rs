//! A single connection attempt: negotiation, transport start, connected,
//! stop.
//!
//! Instances are single-use; after `Stopped` the object is inert and a new
//! attempt needs a new instance (the reconnect layer creates them through
//! a factory).

use std::sync::Arc;

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{AccessTokenProvider, HttpConnectionOptions};
use crate::connection::{Connection, ConnectionEvent};
use crate::error::HubError;
use crate::negotiate::{self, NegotiateOutcome};
use crate::protocol::TransferFormat;
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportStartOptions};

const NEGOTIATE_REDIRECT_LIMIT: u32 = 100;

/// Lifecycle of a single connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpConnectionState {
    Initial,
    Connecting,
    Connected,
    Stopped,
}

/// One transport attempt, owned end to end.
pub struct HttpConnection {
    options: HttpConnectionOptions,
    transport_factory: Arc<dyn TransportFactory>,
    transfer_format: TransferFormat,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    transport_events: mpsc::UnboundedSender<TransportEvent>,
    http_client: reqwest::Client,

    state: Mutex<HttpConnectionState>,
    url: Mutex<Url>,
    token_provider: Mutex<Option<AccessTokenProvider>>,
    transport: Mutex<Option<Arc<dyn Transport>>>,
    connection_id: Mutex<Option<String>>,
    connection_token: Mutex<Option<String>>,
    stop_error: Mutex<Option<HubError>>,
    // Single-latch start gate: held (false) from the beginning of start
    // until the attempt reaches a terminal outcome. `stop` waits on it so
    // teardown never races a half-started transport.
    start_gate: watch::Sender<bool>,
}

impl HttpConnection {
    pub fn new(
        url: Url,
        options: HttpConnectionOptions,
        transport_factory: Arc<dyn TransportFactory>,
        transfer_format: TransferFormat,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Arc<Self> {
        let (transport_events, mut transport_events_rx) = mpsc::unbounded();
        let http_client = options.http_client.clone().unwrap_or_default();
        let token_provider = options.access_token_provider.clone();
        let (start_gate, _) = watch::channel(true);

        let connection = Arc::new(Self {
            options,
            transport_factory,
            transfer_format,
            events,
            transport_events,
            http_client,
            state: Mutex::new(HttpConnectionState::Initial),
            url: Mutex::new(url),
            token_provider: Mutex::new(token_provider),
            transport: Mutex::new(None),
            connection_id: Mutex::new(None),
            connection_token: Mutex::new(None),
            stop_error: Mutex::new(None),
            start_gate,
        });

        let weak = Arc::downgrade(&connection);
        tokio::spawn(async move {
            while let Some(event) = transport_events_rx.next().await {
                let Some(connection) = weak.upgrade() else { break };
                connection.handle_transport_event(event).await;
            }
        });

        connection
    }

    /// Changes the state to `to` if the current state is `from` (or
    /// unconditionally when `from` is `None`), returning the previous
    /// state on success.
    async fn change_state(
        &self,
        from: Option<HttpConnectionState>,
        to: HttpConnectionState,
    ) -> Option<HttpConnectionState> {
        let mut state = self.state.lock().await;
        if from.map_or(true, |expected| expected == *state) {
            let previous = *state;
            *state = to;
            debug!(?previous, current = ?to, "connection state changed");
            Some(previous)
        } else {
            None
        }
    }

    fn enter_start_gate(&self) {
        self.start_gate.send_replace(false);
    }

    fn leave_start_gate(&self) {
        self.start_gate.send_replace(true);
    }

    async fn wait_start_gate(&self) {
        let mut gate = self.start_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.unbounded_send(event);
    }

    async fn start_internal(&self) -> Result<(), HubError> {
        let transport = if self.options.skip_negotiation {
            debug!("skipping negotiation");
            self.transport_factory.create_default(self.transfer_format)?
        } else {
            self.negotiate().await?
        };
        *self.transport.lock().await = Some(transport.clone());

        if *self.state.lock().await != HttpConnectionState::Connecting {
            // A stop raced the start; it is waiting on the gate for us
            return Err(HubError::ConnectionIsBeingClosed);
        }

        let url = self.start_url().await;
        let options = TransportStartOptions {
            headers: self.options.headers.clone(),
            access_token: self.current_access_token().await,
            maximum_message_size: self.options.maximum_websocket_message_size,
            transfer_format: self.transfer_format,
        };
        transport
            .start(url, options, self.transport_events.clone())
            .await
    }

    /// Runs the negotiate exchange, following redirects and waiting out
    /// informational responses, and selects a transport from the final
    /// offer.
    async fn negotiate(&self) -> Result<Arc<dyn Transport>, HubError> {
        let mut redirects = 0;
        loop {
            let url = self.url.lock().await.clone();
            let token = self.current_access_token().await;
            match negotiate::negotiate(&self.http_client, &url, &self.options.headers, token)
                .await?
            {
                NegotiateOutcome::AwaitTerminal => continue,
                NegotiateOutcome::Redirect { url, access_token } => {
                    redirects += 1;
                    if redirects > NEGOTIATE_REDIRECT_LIMIT {
                        return Err(HubError::InvalidNegotiationResponse(
                            "negotiate redirect limit exceeded".into(),
                        ));
                    }
                    debug!(%url, "negotiate redirected");
                    *self.url.lock().await = url;
                    if let Some(token) = access_token {
                        *self.token_provider.lock().await =
                            Some(Arc::new(move || Some(token.clone())));
                    }
                }
                NegotiateOutcome::Negotiated(response) => {
                    debug!(connection_id = %response.connection_id, "negotiation complete");
                    *self.connection_id.lock().await = Some(response.connection_id);
                    *self.connection_token.lock().await = response.connection_token;
                    return self
                        .transport_factory
                        .create(&response.available_transports, self.transfer_format);
                }
            }
        }
    }

    async fn current_access_token(&self) -> Option<String> {
        self.token_provider
            .lock()
            .await
            .as_ref()
            .and_then(|provider| provider())
    }

    /// The transport URL: the hub URL with `?id=` appended when an
    /// identifier was negotiated.
    async fn start_url(&self) -> Url {
        let mut url = self.url.lock().await.clone();
        let token = self.connection_token.lock().await.clone();
        let id = match token {
            Some(token) => Some(token),
            None => self.connection_id.lock().await.clone(),
        };
        if let Some(id) = id {
            url.query_pairs_mut().append_pair("id", &id);
        }
        url
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.transport_did_open().await,
            TransportEvent::Data(data) => self.emit(ConnectionEvent::Data(data)),
            TransportEvent::Closed(error) => self.transport_did_close(error).await,
        }
    }

    async fn transport_did_open(&self) {
        if self
            .change_state(
                Some(HttpConnectionState::Connecting),
                HttpConnectionState::Connected,
            )
            .await
            .is_some()
        {
            let connection_id = self.connection_id.lock().await.clone();
            info!(?connection_id, "connection opened");
            self.emit(ConnectionEvent::Opened { connection_id });
        }
        self.leave_start_gate();
    }

    async fn transport_did_close(&self, error: Option<HubError>) {
        let previous = self.change_state(None, HttpConnectionState::Stopped).await;
        let stop_error = self.stop_error.lock().await.take();
        let error = stop_error.or(error);
        if previous == Some(HttpConnectionState::Connecting) {
            self.leave_start_gate();
            self.emit(ConnectionEvent::FailedToOpen(
                error.unwrap_or(HubError::ConnectionIsBeingClosed),
            ));
        } else {
            debug!(?error, "connection closed");
            *self.connection_id.lock().await = None;
            self.emit(ConnectionEvent::Closed(error));
        }
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn start(&self) {
        debug!("starting connection");
        if self
            .change_state(
                Some(HttpConnectionState::Initial),
                HttpConnectionState::Connecting,
            )
            .await
            .is_none()
        {
            warn!("start attempted in a non-initial state");
            self.emit(ConnectionEvent::FailedToOpen(HubError::InvalidState));
            return;
        }

        self.enter_start_gate();
        if let Err(error) = self.start_internal().await {
            self.leave_start_gate();
            self.change_state(None, HttpConnectionState::Stopped).await;
            let stop_error = self.stop_error.lock().await.take();
            self.emit(ConnectionEvent::FailedToOpen(stop_error.unwrap_or(error)));
        }
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), HubError> {
        if *self.state.lock().await != HttpConnectionState::Connected {
            return Err(HubError::InvalidState);
        }
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(HubError::InvalidState)?;
        transport.send(data).await
    }

    async fn stop(&self, stop_error: Option<HubError>) {
        let previous = self.change_state(None, HttpConnectionState::Stopped).await;
        if matches!(
            previous,
            Some(HttpConnectionState::Initial) | Some(HttpConnectionState::Stopped)
        ) {
            debug!(?previous, "stop is a no-op");
            return;
        }

        *self.stop_error.lock().await = stop_error;
        self.wait_start_gate().await;

        let transport = self.transport.lock().await.clone();
        match transport {
            Some(transport) => transport.close().await,
            None => {
                let error = self.stop_error.lock().await.take();
                self.emit(ConnectionEvent::Closed(error));
            }
        }
    }

    async fn inherent_keep_alive(&self) -> bool {
        match self.transport.lock().await.as_ref() {
            Some(transport) => transport.inherent_keep_alive(),
            None => false,
        }
    }
}
