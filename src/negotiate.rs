//! Negotiation with the hub server.
//!
//! Before opening a WebSocket the client POSTs to the `/negotiate`
//! endpoint to select a transport and obtain connection identifiers. The
//! server may instead redirect the client to a different URL, optionally
//! handing it an access token for that URL.
//!
//! This module builds the negotiate request and interprets the response;
//! the redirect/await loop is driven by the connection.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::error::HubError;
use crate::protocol::TransferFormat;

/// One transport the server offers, with the frame formats it supports.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AvailableTransport {
    pub transport: String,
    pub transfer_formats: Vec<TransferFormat>,
}

/// A terminal negotiation payload.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationResponse {
    pub connection_id: String,
    #[serde(default)]
    pub connection_token: Option<String>,
    #[serde(default)]
    pub available_transports: Vec<AvailableTransport>,
}

/// What a single negotiate round produced.
#[derive(Debug, Clone)]
pub enum NegotiateOutcome {
    /// An informational (1xx) response; keep waiting for a terminal one.
    AwaitTerminal,
    /// The server redirected the client elsewhere.
    Redirect {
        url: Url,
        access_token: Option<String>,
    },
    /// Transport selection can proceed.
    Negotiated(NegotiationResponse),
}

/// Builds the negotiate endpoint URL for `hub_url`.
///
/// The path gains a `/negotiate` segment and the query advertises the
/// negotiate protocol version; an existing query and a trailing slash in
/// the path are both tolerated.
pub fn negotiate_url(hub_url: &Url) -> Result<Url, HubError> {
    let mut url = hub_url.clone();

    let mut path = url.path().to_string();
    if path.ends_with('/') && path.len() > 1 {
        path.pop();
    }
    path.push_str("/negotiate");
    url.set_path(&path);

    url.set_fragment(None);
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url)
}

/// Interprets one negotiate HTTP response.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<NegotiateOutcome, HubError> {
    match status {
        100..=199 => {
            debug!(status, "informational negotiate response, awaiting a terminal one");
            Ok(NegotiateOutcome::AwaitTerminal)
        }
        200 => {
            let value: serde_json::Value = serde_json::from_slice(body)
                .map_err(|e| HubError::InvalidNegotiationResponse(e.to_string()))?;
            if let Some(redirect) = value.get("url") {
                let raw = redirect.as_str().ok_or_else(|| {
                    HubError::InvalidNegotiationResponse("redirect url is not a string".into())
                })?;
                Ok(NegotiateOutcome::Redirect {
                    url: Url::parse(raw)?,
                    access_token: value
                        .get("accessToken")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_owned),
                })
            } else {
                let response: NegotiationResponse = serde_json::from_value(value)
                    .map_err(|e| HubError::InvalidNegotiationResponse(e.to_string()))?;
                Ok(NegotiateOutcome::Negotiated(response))
            }
        }
        status => Err(HubError::WebError(status)),
    }
}

/// Performs one negotiate round.
pub async fn negotiate(
    client: &reqwest::Client,
    hub_url: &Url,
    headers: &HashMap<String, String>,
    access_token: Option<String>,
) -> Result<NegotiateOutcome, HubError> {
    let url = negotiate_url(hub_url)?;
    debug!(%url, "negotiating");

    let mut request = client
        .post(url.as_str())
        .header("Accept", "application/json");
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    if let Some(token) = access_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await?;
    let status = response.status().as_u16();
    let body = response.bytes().await?;
    interpret_response(status, &body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiate_url_appends_segment_and_version() {
        let hub = Url::parse("http://localhost:5000/chathub").unwrap();
        let url = negotiate_url(&hub).unwrap();
        assert_eq!(url.path(), "/chathub/negotiate");
        assert_eq!(url.query(), Some("negotiateVersion=1"));
    }

    #[test]
    fn negotiate_url_tolerates_trailing_slash_and_query() {
        let hub = Url::parse("https://example.com/hub/?tenant=a#frag").unwrap();
        let url = negotiate_url(&hub).unwrap();
        assert_eq!(url.path(), "/hub/negotiate");
        assert_eq!(url.query(), Some("tenant=a&negotiateVersion=1"));
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn informational_status_awaits_terminal() {
        assert!(matches!(
            interpret_response(100, b"").unwrap(),
            NegotiateOutcome::AwaitTerminal
        ));
    }

    #[test]
    fn redirect_payload_is_detected() {
        let body = br#"{"url":"https://other.example.com/hub","accessToken":"tok"}"#;
        match interpret_response(200, body).unwrap() {
            NegotiateOutcome::Redirect { url, access_token } => {
                assert_eq!(url.as_str(), "https://other.example.com/hub");
                assert_eq!(access_token.as_deref(), Some("tok"));
            }
            other => panic!("expected redirect, got {other:?}"),
        }
    }

    #[test]
    fn negotiation_payload_parses_transports() {
        let body = br#"{
            "connectionId": "c1",
            "connectionToken": "t1",
            "availableTransports": [
                { "transport": "WebSockets", "transferFormats": ["Text", "Binary"] }
            ]
        }"#;
        match interpret_response(200, body).unwrap() {
            NegotiateOutcome::Negotiated(response) => {
                assert_eq!(response.connection_id, "c1");
                assert_eq!(response.connection_token.as_deref(), Some("t1"));
                assert_eq!(response.available_transports.len(), 1);
                assert_eq!(response.available_transports[0].transport, "WebSockets");
                assert_eq!(
                    response.available_transports[0].transfer_formats,
                    vec![TransferFormat::Text, TransferFormat::Binary]
                );
            }
            other => panic!("expected negotiation, got {other:?}"),
        }
    }

    #[test]
    fn malformed_payload_is_invalid() {
        assert!(matches!(
            interpret_response(200, b"{\"unexpected\":true}"),
            Err(HubError::InvalidNegotiationResponse(_))
        ));
        assert!(matches!(
            interpret_response(200, b"not json"),
            Err(HubError::InvalidNegotiationResponse(_))
        ));
    }

    #[test]
    fn other_statuses_fail_with_the_code() {
        assert!(matches!(
            interpret_response(503, b""),
            Err(HubError::WebError(503))
        ));
    }
}
