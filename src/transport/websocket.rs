//! WebSocket transport over `tokio-tungstenite`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_channel::mpsc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use crate::error::HubError;
use crate::negotiate::AvailableTransport;
use crate::protocol::TransferFormat;
use crate::transport::{Transport, TransportEvent, TransportFactory, TransportStartOptions};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A WebSocket duplex channel.
pub struct WebSocketTransport {
    sink: Mutex<Option<WsSink>>,
    text_frames: AtomicBool,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self {
            sink: Mutex::new(None),
            text_frames: AtomicBool::new(false),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(
        &self,
        url: Url,
        options: TransportStartOptions,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), HubError> {
        let ws_url = websocket_url(&url)?;
        debug!(url = %ws_url, "starting websocket transport");

        let mut request = ws_url.as_str().into_client_request()?;
        for (name, value) in &options.headers {
            request.headers_mut().insert(
                http::header::HeaderName::from_bytes(name.as_bytes())?,
                http::header::HeaderValue::from_str(value)?,
            );
        }
        if let Some(token) = &options.access_token {
            request.headers_mut().insert(
                http::header::AUTHORIZATION,
                http::header::HeaderValue::from_str(&format!("Bearer {token}"))?,
            );
        }

        let mut config = WebSocketConfig::default();
        config.max_message_size = options.maximum_message_size;

        let (stream, _response) = connect_async_with_config(request, Some(config), false).await?;
        let (sink, stream) = stream.split();

        self.text_frames.store(
            options.transfer_format == TransferFormat::Text,
            Ordering::Relaxed,
        );
        *self.sink.lock().await = Some(sink);

        let _ = events.unbounded_send(TransportEvent::Opened);
        tokio::spawn(read_loop(stream, events));
        Ok(())
    }

    async fn send(&self, data: Vec<u8>) -> Result<(), HubError> {
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(HubError::InvalidState)?;
        let message = if self.text_frames.load(Ordering::Relaxed) {
            let text = String::from_utf8(data).map_err(|_| {
                HubError::InvalidOperation("outbound text frame is not valid UTF-8".into())
            })?;
            Message::Text(text)
        } else {
            Message::Binary(data)
        };
        sink.send(message).await?;
        Ok(())
    }

    async fn close(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(sink) = guard.as_mut() {
            if let Err(error) = sink.close().await {
                debug!(%error, "websocket close failed");
            }
        }
    }
}

/// Forwards inbound frames until the stream ends.
async fn read_loop(mut stream: WsStream, events: mpsc::UnboundedSender<TransportEvent>) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Binary(data))) => {
                if events.unbounded_send(TransportEvent::Data(data)).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Text(text))) => {
                if events
                    .unbounded_send(TransportEvent::Data(text.into_bytes()))
                    .is_err()
                {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                debug!(?frame, "websocket closed by peer");
                let _ = events.unbounded_send(TransportEvent::Closed(None));
                break;
            }
            // Ping/pong and raw frames are handled by tungstenite
            Some(Ok(_)) => {}
            Some(Err(error)) => {
                warn!(%error, "websocket read failed");
                let _ = events.unbounded_send(TransportEvent::Closed(Some(error.into())));
                break;
            }
            None => {
                let _ = events.unbounded_send(TransportEvent::Closed(None));
                break;
            }
        }
    }
}

fn websocket_url(url: &Url) -> Result<Url, HubError> {
    let mut ws_url = url.clone();
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(HubError::InvalidOperation(format!(
                "cannot open a websocket over the {other} scheme"
            )))
        }
    };
    if ws_url.set_scheme(scheme).is_err() {
        return Err(HubError::InvalidOperation(
            "hub URL cannot carry a websocket scheme".into(),
        ));
    }
    Ok(ws_url)
}

/// Selects the WebSocket transport from a negotiated offer.
pub struct WebSocketTransportFactory;

impl TransportFactory for WebSocketTransportFactory {
    fn create(
        &self,
        available: &[AvailableTransport],
        format: TransferFormat,
    ) -> Result<Arc<dyn Transport>, HubError> {
        let offered = available
            .iter()
            .any(|t| t.transport == "WebSockets" && t.transfer_formats.contains(&format));
        if !offered {
            return Err(HubError::InvalidNegotiationResponse(
                "no compatible WebSocket transport offered".into(),
            ));
        }
        self.create_default(format)
    }

    fn create_default(&self, _format: TransferFormat) -> Result<Arc<dyn Transport>, HubError> {
        Ok(Arc::new(WebSocketTransport::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_schemes_map_to_websocket_schemes() {
        let ws = websocket_url(&Url::parse("http://host:5000/hub?id=1").unwrap()).unwrap();
        assert_eq!(ws.as_str(), "ws://host:5000/hub?id=1");
        let wss = websocket_url(&Url::parse("https://host/hub").unwrap()).unwrap();
        assert_eq!(wss.scheme(), "wss");
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        assert!(websocket_url(&Url::parse("ftp://host/hub").unwrap()).is_err());
    }

    #[test]
    fn factory_requires_a_compatible_offer() {
        let factory = WebSocketTransportFactory;
        let offer = vec![AvailableTransport {
            transport: "ServerSentEvents".into(),
            transfer_formats: vec![TransferFormat::Text],
        }];
        assert!(factory.create(&offer, TransferFormat::Text).is_err());

        let offer = vec![AvailableTransport {
            transport: "WebSockets".into(),
            transfer_formats: vec![TransferFormat::Text],
        }];
        assert!(factory.create(&offer, TransferFormat::Text).is_ok());
        assert!(factory.create(&offer, TransferFormat::Binary).is_err());
    }
}
