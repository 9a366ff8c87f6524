//! The hub handshake.
//!
//! After the transport opens, the client sends a JSON protocol-selection
//! message and the server acknowledges it. Both directions are JSON
//! objects terminated by the ASCII record separator, regardless of which
//! hub protocol is being selected. Bytes after the server's terminator are
//! ordinary hub messages and are returned to the caller for the normal
//! parse path.

use serde::Deserialize;
use serde_json::json;

use crate::error::HubError;
use crate::protocol::ProtocolError;

/// Terminator for handshake and JSON protocol messages.
pub const RECORD_SEPARATOR: u8 = 0x1E;

/// The server's reply to a handshake request.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// `None` means the server accepted the requested protocol.
    #[serde(default)]
    pub error: Option<String>,
}

/// Builds the protocol-selection message, terminator included.
pub fn create_handshake_request(protocol: &str, version: u32) -> Vec<u8> {
    let mut request = json!({ "protocol": protocol, "version": version }).to_string();
    request.push(RECORD_SEPARATOR as char);
    request.into_bytes()
}

/// Parses the server's handshake reply from the head of `data`.
///
/// Returns the reply and the bytes after the terminator, which belong to
/// the regular message stream.
pub fn parse_handshake_response(data: &[u8]) -> Result<(HandshakeResponse, &[u8]), HubError> {
    let terminator = data
        .iter()
        .position(|&byte| byte == RECORD_SEPARATOR)
        .ok_or(ProtocolError::IncompleteMessage)?;
    let response: HandshakeResponse =
        serde_json::from_slice(&data[..terminator]).map_err(ProtocolError::from)?;
    Ok((response, &data[terminator + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_parses_back_as_success() {
        // The server's success reply is an empty object; a request round
        // trips through the parser with an OK status and no remainder.
        let request = create_handshake_request("json", 1);
        assert_eq!(*request.last().unwrap(), RECORD_SEPARATOR);

        let (response, rest) = parse_handshake_response(b"{}\x1e").unwrap();
        assert_eq!(response.error, None);
        assert!(rest.is_empty());
    }

    #[test]
    fn request_contains_protocol_and_version() {
        let request = create_handshake_request("messagepack", 1);
        let body: serde_json::Value =
            serde_json::from_slice(&request[..request.len() - 1]).unwrap();
        assert_eq!(body["protocol"], "messagepack");
        assert_eq!(body["version"], 1);
    }

    #[test]
    fn error_reply_is_surfaced() {
        let (response, _) =
            parse_handshake_response(b"{\"error\":\"unsupported protocol\"}\x1e").unwrap();
        assert_eq!(response.error.as_deref(), Some("unsupported protocol"));
    }

    #[test]
    fn remainder_is_returned_for_the_message_stream() {
        let (response, rest) = parse_handshake_response(b"{}\x1e{\"type\":6}\x1e").unwrap();
        assert_eq!(response.error, None);
        assert_eq!(rest, b"{\"type\":6}\x1e");
    }

    #[test]
    fn missing_terminator_is_an_error() {
        assert!(parse_handshake_response(b"{}").is_err());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(parse_handshake_response(b"not json\x1e").is_err());
    }
}
