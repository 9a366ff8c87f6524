//! Hub protocol messages.
//!
//! [`HubMessage`] represents every message type exchanged after the
//! handshake. The shapes are codec-agnostic; arguments and results are
//! carried as [`serde_json::Value`] and decoded to concrete types at the
//! call sites that know them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a protocol's frames are text or binary on the wire.
///
/// Also the shape used by the negotiation payload's `transferFormats`
/// lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferFormat {
    Text,
    Binary,
}

/// A hub protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// A method call. Client-bound invocations dispatch to a registered
    /// handler; outbound invocations without an ID expect no completion.
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },

    /// One item of a server-to-client stream.
    StreamItem { invocation_id: String, item: Value },

    /// Terminates an invocation or a stream.
    ///
    /// At most one of `result` and `error` is present.
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },

    /// Client-to-server request to start a streaming method.
    StreamInvocation {
        invocation_id: String,
        target: String,
        arguments: Vec<Value>,
    },

    /// Client-to-server request to cancel a streaming invocation.
    CancelInvocation { invocation_id: String },

    /// Keep-alive. Either side may send one; no response is required.
    Ping,

    /// Graceful termination of the connection.
    Close {
        error: Option<String>,
        allow_reconnect: Option<bool>,
    },
}

impl HubMessage {
    /// Wire-level message type number.
    pub fn message_type(&self) -> u8 {
        match self {
            Self::Invocation { .. } => 1,
            Self::StreamItem { .. } => 2,
            Self::Completion { .. } => 3,
            Self::StreamInvocation { .. } => 4,
            Self::CancelInvocation { .. } => 5,
            Self::Ping => 6,
            Self::Close { .. } => 7,
        }
    }
}
