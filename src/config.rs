//! Configuration for hub connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::callback::CallbackQueue;

/// Produces the bearer token attached to negotiation and transport
/// requests. Returning `None` sends no token.
pub type AccessTokenProvider = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Options for the HTTP/WebSocket layer of a connection.
#[derive(Clone)]
pub struct HttpConnectionOptions {
    /// Headers applied to the negotiate request and the WebSocket upgrade.
    pub headers: HashMap<String, String>,
    /// Bearer token source. A negotiation redirect carrying an access token
    /// replaces this provider for the rest of the connection.
    pub access_token_provider: Option<AccessTokenProvider>,
    /// HTTP client used for negotiation. Defaults to a fresh
    /// `reqwest::Client`; inject one to control TLS, proxies, or timeouts.
    pub http_client: Option<reqwest::Client>,
    /// Skip the negotiate request and open a WebSocket directly.
    pub skip_negotiation: bool,
    /// Upper bound on inbound WebSocket message size.
    pub maximum_websocket_message_size: Option<usize>,
}

impl Default for HttpConnectionOptions {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            access_token_provider: None,
            http_client: None,
            skip_negotiation: false,
            maximum_websocket_message_size: None,
        }
    }
}

/// Options for the hub layer.
#[derive(Clone, Default)]
pub struct HubConnectionOptions {
    /// Interval between keep-alive pings. Keep-alive is disabled when
    /// absent, and when the transport has inherent keep-alive.
    pub keep_alive_interval: Option<Duration>,
    /// Queue on which delegate callbacks and client method handlers run.
    /// A connection-private queue is created when absent.
    pub callback_queue: Option<CallbackQueue>,
}
