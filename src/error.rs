use std::sync::Arc;

use thiserror::Error;

/// Errors that can occur in a hub connection.
///
/// The type is `Clone` because a single close error is fanned out to every
/// pending invocation; sources that are not themselves `Clone` are wrapped
/// in an [`Arc`].
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// An operation was attempted in a state that does not allow it.
    #[error("operation attempted in an invalid state")]
    InvalidState,

    /// The caller misused the protocol surface.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The negotiation endpoint returned a payload this client cannot use.
    #[error("invalid negotiation response: {0}")]
    InvalidNegotiationResponse(String),

    /// Negotiation or the WebSocket upgrade failed at the HTTP level.
    #[error("request failed with HTTP status {0}")]
    WebError(u16),

    /// The operation raced the closing transition.
    #[error("connection is being closed")]
    ConnectionIsBeingClosed,

    /// A send was issued while the connection was reconnecting.
    #[error("connection is reconnecting")]
    ConnectionIsReconnecting,

    /// The server sent a `Close` message.
    #[error("server closed the connection: {}", .0.as_deref().unwrap_or("no reason given"))]
    ServerClose(Option<String>),

    /// A pending invocation was aborted by connection close without a more
    /// specific error.
    #[error("invocation cancelled because the connection closed")]
    HubInvocationCancelled,

    /// The server completed an invocation with an error.
    #[error("hub invocation failed: {0}")]
    HubInvocationError(String),

    /// The hub handshake was rejected by the server.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(Arc<http::Error>),

    #[error("HTTP request failed: {0}")]
    Reqwest(Arc<reqwest::Error>),

    #[error("WebSocket error: {0}")]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),

    #[error("protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

impl From<http::Error> for HubError {
    fn from(error: http::Error) -> Self {
        Self::Http(Arc::new(error))
    }
}

impl From<http::header::InvalidHeaderName> for HubError {
    fn from(error: http::header::InvalidHeaderName) -> Self {
        Self::Http(Arc::new(error.into()))
    }
}

impl From<http::header::InvalidHeaderValue> for HubError {
    fn from(error: http::header::InvalidHeaderValue) -> Self {
        Self::Http(Arc::new(error.into()))
    }
}

impl From<reqwest::Error> for HubError {
    fn from(error: reqwest::Error) -> Self {
        Self::Reqwest(Arc::new(error))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubError {
    fn from(error: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Arc::new(error))
    }
}
