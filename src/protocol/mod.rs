//! Hub protocol implementation.
//!
//! This module provides the message model, the connection handshake, and
//! two interchangeable wire codecs: JSON (text frames, record-separator
//! framing) and MessagePack (binary frames, varint length prefixes).

pub mod handshake;

mod frame;
mod json;
mod messagepack;

use std::sync::Arc;

pub use frame::{HubMessage, TransferFormat};
pub use json::JsonHubProtocol;
pub use messagepack::MessagePackHubProtocol;

/// Errors that can occur during protocol encoding or decoding.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ProtocolError {
    /// Failed to encode or decode JSON.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// Failed to encode a message to MessagePack.
    #[error("MessagePack encode error: {0}")]
    Encode(Arc<rmp_serde::encode::Error>),

    /// Failed to decode MessagePack data into a message.
    #[error("MessagePack decode error: {0}")]
    Decode(Arc<rmp_serde::decode::Error>),

    /// A frame ended in the middle of a message.
    #[error("incomplete message frame")]
    IncompleteMessage,

    /// A message did not have the shape its type requires.
    #[error("malformed {0} message")]
    MalformedMessage(&'static str),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(error: serde_json::Error) -> Self {
        Self::Json(Arc::new(error))
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        Self::Encode(Arc::new(error))
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(error: rmp_serde::decode::Error) -> Self {
        Self::Decode(Arc::new(error))
    }
}

/// A wire codec for hub messages.
///
/// Implementations encode one outbound message per call and parse every
/// complete message carried by an inbound frame, in order. Messages with a
/// type number the codec does not recognise are skipped with a warning so
/// that newer servers do not break older clients.
pub trait HubProtocol: Send + Sync + 'static {
    /// Protocol name sent in the handshake, e.g. `"json"`.
    fn name(&self) -> &str;

    /// Protocol version sent in the handshake.
    fn version(&self) -> u32;

    /// Whether frames travel as text or binary WebSocket messages.
    fn transfer_format(&self) -> TransferFormat;

    /// Encodes a single message, including its framing.
    fn encode(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError>;

    /// Parses every complete message in `data`, in order.
    fn parse(&self, data: &[u8]) -> Result<Vec<HubMessage>, ProtocolError>;
}
