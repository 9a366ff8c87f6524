//! JSON hub protocol.
//!
//! Messages are JSON objects with a numeric `type` field, each terminated
//! by the ASCII record separator. A single transport frame may carry any
//! number of messages.

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::protocol::handshake::RECORD_SEPARATOR;
use crate::protocol::{HubMessage, HubProtocol, ProtocolError, TransferFormat};

/// The `json` hub protocol, version 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonHubProtocol;

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        "json"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn encode(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let body = match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut object = Map::new();
                object.insert("type".into(), json!(1));
                if let Some(id) = invocation_id {
                    object.insert("invocationId".into(), json!(id));
                }
                object.insert("target".into(), json!(target));
                object.insert("arguments".into(), Value::Array(arguments.clone()));
                Value::Object(object)
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => json!({ "type": 2, "invocationId": invocation_id, "item": item }),
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let mut object = Map::new();
                object.insert("type".into(), json!(3));
                object.insert("invocationId".into(), json!(invocation_id));
                if let Some(error) = error {
                    object.insert("error".into(), json!(error));
                } else if let Some(result) = result {
                    object.insert("result".into(), result.clone());
                }
                Value::Object(object)
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => json!({
                "type": 4,
                "invocationId": invocation_id,
                "target": target,
                "arguments": arguments,
            }),
            HubMessage::CancelInvocation { invocation_id } => {
                json!({ "type": 5, "invocationId": invocation_id })
            }
            HubMessage::Ping => json!({ "type": 6 }),
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut object = Map::new();
                object.insert("type".into(), json!(7));
                if let Some(error) = error {
                    object.insert("error".into(), json!(error));
                }
                if let Some(allow_reconnect) = allow_reconnect {
                    object.insert("allowReconnect".into(), json!(allow_reconnect));
                }
                Value::Object(object)
            }
        };

        let mut encoded = serde_json::to_vec(&body)?;
        encoded.push(RECORD_SEPARATOR);
        Ok(encoded)
    }

    fn parse(&self, data: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        let mut remaining = data;
        while let Some(terminator) = remaining.iter().position(|&b| b == RECORD_SEPARATOR) {
            if let Some(message) = parse_one(&remaining[..terminator])? {
                messages.push(message);
            }
            remaining = &remaining[terminator + 1..];
        }
        if !remaining.is_empty() {
            return Err(ProtocolError::IncompleteMessage);
        }
        Ok(messages)
    }
}

/// Parses one terminated message body.
///
/// Returns `None` for message types this client does not know, so that a
/// newer server does not break the whole frame.
fn parse_one(body: &[u8]) -> Result<Option<HubMessage>, ProtocolError> {
    let value: Value = serde_json::from_slice(body)?;
    let message_type = value
        .get("type")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MalformedMessage("untyped"))?;

    let message = match message_type {
        1 => HubMessage::Invocation {
            invocation_id: optional_string(&value, "invocationId"),
            target: required_string(&value, "target", "invocation")?,
            arguments: arguments(&value),
        },
        2 => HubMessage::StreamItem {
            invocation_id: required_string(&value, "invocationId", "stream item")?,
            item: value.get("item").cloned().unwrap_or(Value::Null),
        },
        3 => HubMessage::Completion {
            invocation_id: required_string(&value, "invocationId", "completion")?,
            result: value.get("result").cloned(),
            error: optional_string(&value, "error"),
        },
        4 => HubMessage::StreamInvocation {
            invocation_id: required_string(&value, "invocationId", "stream invocation")?,
            target: required_string(&value, "target", "stream invocation")?,
            arguments: arguments(&value),
        },
        5 => HubMessage::CancelInvocation {
            invocation_id: required_string(&value, "invocationId", "cancel invocation")?,
        },
        6 => HubMessage::Ping,
        7 => HubMessage::Close {
            error: optional_string(&value, "error"),
            allow_reconnect: value.get("allowReconnect").and_then(Value::as_bool),
        },
        unknown => {
            warn!(message_type = unknown, "skipping message of unknown type");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn optional_string(value: &Value, field: &str) -> Option<String> {
    value.get(field).and_then(Value::as_str).map(str::to_owned)
}

fn required_string(
    value: &Value,
    field: &str,
    kind: &'static str,
) -> Result<String, ProtocolError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or(ProtocolError::MalformedMessage(kind))
}

fn arguments(value: &Value) -> Vec<Value> {
    match value.get("arguments") {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(data: &[u8]) -> Vec<HubMessage> {
        JsonHubProtocol.parse(data).unwrap()
    }

    #[test]
    fn encodes_invocation_with_id() {
        let message = HubMessage::Invocation {
            invocation_id: Some("1".into()),
            target: "Add".into(),
            arguments: vec![json!(1), json!(2)],
        };
        let encoded = JsonHubProtocol.encode(&message).unwrap();
        assert_eq!(*encoded.last().unwrap(), RECORD_SEPARATOR);

        let body: Value = serde_json::from_slice(&encoded[..encoded.len() - 1]).unwrap();
        assert_eq!(body["type"], 1);
        assert_eq!(body["invocationId"], "1");
        assert_eq!(body["target"], "Add");
        assert_eq!(body["arguments"], json!([1, 2]));
    }

    #[test]
    fn fire_and_forget_invocation_has_no_id() {
        let message = HubMessage::Invocation {
            invocation_id: None,
            target: "Notify".into(),
            arguments: vec![],
        };
        let encoded = JsonHubProtocol.encode(&message).unwrap();
        let body: Value = serde_json::from_slice(&encoded[..encoded.len() - 1]).unwrap();
        assert!(body.get("invocationId").is_none());
    }

    #[test]
    fn round_trips_every_message_kind() {
        let messages = vec![
            HubMessage::Invocation {
                invocation_id: Some("7".into()),
                target: "Echo".into(),
                arguments: vec![json!("hi")],
            },
            HubMessage::StreamItem {
                invocation_id: "7".into(),
                item: json!(42),
            },
            HubMessage::Completion {
                invocation_id: "7".into(),
                result: Some(json!("done")),
                error: None,
            },
            HubMessage::StreamInvocation {
                invocation_id: "8".into(),
                target: "Count".into(),
                arguments: vec![json!(5)],
            },
            HubMessage::CancelInvocation {
                invocation_id: "8".into(),
            },
            HubMessage::Ping,
            HubMessage::Close {
                error: Some("bye".into()),
                allow_reconnect: Some(false),
            },
        ];
        for message in messages {
            let encoded = JsonHubProtocol.encode(&message).unwrap();
            assert_eq!(parse(&encoded), vec![message]);
        }
    }

    #[test]
    fn parses_messages_in_frame_order() {
        let frame = b"{\"type\":6}\x1e{\"type\":2,\"invocationId\":\"1\",\"item\":1}\x1e{\"type\":3,\"invocationId\":\"1\"}\x1e";
        let messages = parse(frame);
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0], HubMessage::Ping);
        assert!(matches!(messages[1], HubMessage::StreamItem { .. }));
        assert!(matches!(messages[2], HubMessage::Completion { .. }));
    }

    #[test]
    fn completion_error_wins_over_result() {
        let frame = b"{\"type\":3,\"invocationId\":\"4\",\"error\":\"boom\"}\x1e";
        match &parse(frame)[0] {
            HubMessage::Completion { error, result, .. } => {
                assert_eq!(error.as_deref(), Some("boom"));
                assert!(result.is_none());
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn unknown_message_types_are_skipped() {
        let frame = b"{\"type\":99}\x1e{\"type\":6}\x1e";
        assert_eq!(parse(frame), vec![HubMessage::Ping]);
    }

    #[test]
    fn unterminated_trailing_bytes_are_an_error() {
        let frame = b"{\"type\":6}\x1e{\"type\":6}";
        assert!(matches!(
            JsonHubProtocol.parse(frame),
            Err(ProtocolError::IncompleteMessage)
        ));
    }

    #[test]
    fn missing_required_field_is_malformed() {
        let frame = b"{\"type\":2,\"item\":1}\x1e";
        assert!(matches!(
            JsonHubProtocol.parse(frame),
            Err(ProtocolError::MalformedMessage("stream item"))
        ));
    }
}
