//! Transport abstraction.
//!
//! A transport is a duplex byte-message channel whose lifecycle is driven
//! by the connection that owns it. Inbound traffic and lifecycle changes
//! surface as [`TransportEvent`]s on a channel handed to
//! [`Transport::start`], so the owner observes them in arrival order
//! without the transport holding a reference back to it.

mod websocket;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_channel::mpsc;
use url::Url;

pub use websocket::{WebSocketTransport, WebSocketTransportFactory};

use crate::error::HubError;
use crate::negotiate::AvailableTransport;
use crate::protocol::TransferFormat;

/// Notifications from a transport to its owning connection.
#[derive(Debug)]
pub enum TransportEvent {
    /// The channel is open and ready to send.
    Opened,
    /// One complete inbound message.
    Data(Vec<u8>),
    /// The channel is gone. Emitted exactly once, for both clean and
    /// failed closes.
    Closed(Option<HubError>),
}

/// Per-start parameters resolved by the connection.
#[derive(Clone)]
pub struct TransportStartOptions {
    pub headers: HashMap<String, String>,
    pub access_token: Option<String>,
    pub maximum_message_size: Option<usize>,
    pub transfer_format: TransferFormat,
}

/// A duplex byte-message channel.
///
/// `start` may be called at most once per instance. After a successful
/// `start` the transport emits `Opened`, then any number of `Data` events,
/// then exactly one `Closed`; `close` initiates that final event rather
/// than producing it synchronously.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether the transport's own traffic makes hub-level pings
    /// unnecessary.
    fn inherent_keep_alive(&self) -> bool {
        false
    }

    /// Opens the channel to `url` and begins delivering events.
    async fn start(
        &self,
        url: Url,
        options: TransportStartOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), HubError>;

    /// Sends one complete message.
    async fn send(&self, data: Vec<u8>) -> Result<(), HubError>;

    /// Initiates shutdown. The final `Closed` event follows asynchronously.
    async fn close(&self);
}

/// Creates transports, either from a negotiated offer or directly.
pub trait TransportFactory: Send + Sync + 'static {
    /// Selects a transport from the server's offer that supports `format`.
    fn create(
        &self,
        available: &[AvailableTransport],
        format: TransferFormat,
    ) -> Result<Arc<dyn Transport>, HubError>;

    /// Creates the default transport without a negotiated offer
    /// (skip-negotiation path).
    fn create_default(&self, format: TransferFormat) -> Result<Arc<dyn Transport>, HubError>;
}
