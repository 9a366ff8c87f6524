//! Client for bidirectional RPC-over-WebSocket hub connections.
//!
//! A [`HubConnection`] negotiates a transport over HTTP, opens a
//! WebSocket, performs the hub protocol handshake, and then exchanges
//! invocations and server-to-client streams with the hub. Lost
//! connections are re-established according to a pluggable
//! [`ReconnectPolicy`](connection::ReconnectPolicy).
//!
//! # Quick start
//!
//! ```no_run
//! use hubwire::{HubConnectionBuilder, HubError};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), HubError> {
//! let hub = HubConnectionBuilder::new("http://localhost:5000/chathub")
//!     .with_automatic_reconnect()
//!     .build()?;
//! hub.start().await;
//!
//! hub.on("NewsUpdate", |mut args| {
//!     let title: String = args.argument()?;
//!     println!("news: {title}");
//!     Ok(())
//! })
//! .await;
//!
//! let sum: i64 = hub.invoke("Add", vec![json!(1), json!(2)]).await?;
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod negotiate;
pub mod protocol;
pub mod transport;

pub use callback::CallbackQueue;
pub use config::{HttpConnectionOptions, HubConnectionOptions};
pub use error::HubError;
pub use hub::{
    registry::ArgumentExtractor, HubConnection, HubConnectionBuilder, HubConnectionDelegate,
    StreamHandle,
};
pub use protocol::{
    HubMessage, HubProtocol, JsonHubProtocol, MessagePackHubProtocol, TransferFormat,
};
