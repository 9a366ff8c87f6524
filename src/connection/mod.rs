//! Connection lifecycle management.
//!
//! [`HttpConnection`] owns one transport attempt from negotiation to
//! close; [`ReconnectableConnection`] wraps a factory of such attempts
//! behind a retry policy and presents the same surface. Both notify their
//! owner through a channel of [`ConnectionEvent`]s, so each layer runs its
//! own event pump without back-references to the layer above.

mod http;
mod reconnect;
mod retry;

use async_trait::async_trait;

pub use http::{HttpConnection, HttpConnectionState};
pub use reconnect::{ConnectionFactory, ReconnectableConnection, ReconnectableState};
pub use retry::{
    DefaultReconnectPolicy, ExponentialBackoffPolicy, NoReconnectPolicy, ReconnectPolicy,
    RetryContext,
};

use crate::error::HubError;

/// Notifications from a connection to its owner.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// The connection is open and ready to send.
    Opened { connection_id: Option<String> },
    /// A start attempt failed before the connection opened.
    FailedToOpen(HubError),
    /// One inbound data frame.
    Data(Vec<u8>),
    /// The connection is gone. For a reconnectable connection this is
    /// emitted only when reconnecting is over (or never started).
    Closed(Option<HubError>),
    /// The connection was lost and a reconnect episode is beginning.
    WillReconnect(HubError),
    /// A reconnect episode ended successfully.
    Reconnected,
    /// A reconnect attempt is being scheduled; carries the number of
    /// failures so far.
    ReconnectAttempt(u32),
}

/// The operations a hub connection needs from the layer below it.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Begins opening the connection. The outcome arrives as an
    /// [`ConnectionEvent::Opened`] or [`ConnectionEvent::FailedToOpen`].
    async fn start(&self);

    /// Sends one complete frame.
    async fn send(&self, data: Vec<u8>) -> Result<(), HubError>;

    /// Initiates shutdown; `stop_error` is reported with the resulting
    /// close. Idempotent.
    async fn stop(&self, stop_error: Option<HubError>);

    /// Whether the current transport produces its own periodic traffic.
    async fn inherent_keep_alive(&self) -> bool;
}
