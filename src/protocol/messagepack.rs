//! MessagePack hub protocol.
//!
//! Messages are MessagePack arrays whose first element is the message type
//! number. Because MessagePack is self-delimiting only per value, each
//! message on the wire is preceded by its byte length as a 7-bit varint,
//! allowing several messages per binary frame.

use std::io::Cursor;

use serde_json::Value;
use tracing::warn;

use crate::protocol::{HubMessage, HubProtocol, ProtocolError, TransferFormat};

/// The `messagepack` hub protocol, version 1.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessagePackHubProtocol;

impl HubProtocol for MessagePackHubProtocol {
    fn name(&self) -> &str {
        "messagepack"
    }

    fn version(&self) -> u32 {
        1
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Binary
    }

    fn encode(&self, message: &HubMessage) -> Result<Vec<u8>, ProtocolError> {
        let mut body = Vec::new();

        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => {
                // [1, invocationId|nil, target, arguments...]
                let mut payload = vec![
                    Value::Number(1.into()),
                    match invocation_id {
                        Some(id) => Value::String(id.clone()),
                        None => Value::Null,
                    },
                    Value::String(target.clone()),
                ];
                payload.extend(arguments.iter().cloned());
                rmp_serde::encode::write(&mut body, &payload)?;
            }
            HubMessage::StreamItem {
                invocation_id,
                item,
            } => {
                rmp_serde::encode::write(&mut body, &(2u32, invocation_id, item))?;
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                // [3, invocationId, result, error]; result and error are
                // never both present
                let result = result.clone().unwrap_or(Value::Null);
                let error = match error {
                    Some(error) => Value::String(error.clone()),
                    None => Value::Null,
                };
                rmp_serde::encode::write(&mut body, &(3u32, invocation_id, result, error))?;
            }
            HubMessage::StreamInvocation {
                invocation_id,
                target,
                arguments,
            } => {
                let mut payload = vec![
                    Value::Number(4.into()),
                    Value::String(invocation_id.clone()),
                    Value::String(target.clone()),
                ];
                payload.extend(arguments.iter().cloned());
                rmp_serde::encode::write(&mut body, &payload)?;
            }
            HubMessage::CancelInvocation { invocation_id } => {
                rmp_serde::encode::write(&mut body, &(5u32, invocation_id))?;
            }
            HubMessage::Ping => {
                rmp_serde::encode::write(&mut body, &(6u32,))?;
            }
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                let mut map = serde_json::Map::new();
                if let Some(error) = error {
                    map.insert("error".to_string(), Value::String(error.clone()));
                }
                if let Some(allow_reconnect) = allow_reconnect {
                    map.insert("allowReconnect".to_string(), Value::Bool(*allow_reconnect));
                }
                let detail = if map.is_empty() {
                    Value::Null
                } else {
                    Value::Object(map)
                };
                rmp_serde::encode::write(&mut body, &(7u32, detail))?;
            }
        }

        let mut encoded = Vec::with_capacity(body.len() + 2);
        write_varint(&mut encoded, body.len());
        encoded.extend_from_slice(&body);
        Ok(encoded)
    }

    fn parse(&self, data: &[u8]) -> Result<Vec<HubMessage>, ProtocolError> {
        let mut messages = Vec::new();
        let mut remaining = data;
        while !remaining.is_empty() {
            let (length, consumed) = read_varint(remaining)?;
            remaining = &remaining[consumed..];
            if remaining.len() < length {
                return Err(ProtocolError::IncompleteMessage);
            }
            if let Some(message) = decode_one(&remaining[..length])? {
                messages.push(message);
            }
            remaining = &remaining[length..];
        }
        Ok(messages)
    }
}

/// Decodes one length-delimited message body.
///
/// Returns `None` for message types this client does not know.
fn decode_one(body: &[u8]) -> Result<Option<HubMessage>, ProtocolError> {
    let array: Vec<Value> = rmp_serde::from_read(Cursor::new(body))?;
    if array.is_empty() {
        return Err(ProtocolError::MalformedMessage("empty"));
    }

    // The first element is always the message type
    let message_type = array[0]
        .as_u64()
        .ok_or(ProtocolError::MalformedMessage("untyped"))?;

    let message = match message_type {
        1 => {
            if array.len() < 3 {
                return Err(ProtocolError::MalformedMessage("invocation"));
            }
            let invocation_id = match &array[1] {
                Value::String(id) => Some(id.clone()),
                Value::Null => None,
                _ => return Err(ProtocolError::MalformedMessage("invocation")),
            };
            let target = string_at(&array, 2, "invocation")?;
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments: array.into_iter().skip(3).collect(),
            }
        }
        2 => {
            if array.len() != 3 {
                return Err(ProtocolError::MalformedMessage("stream item"));
            }
            HubMessage::StreamItem {
                invocation_id: string_at(&array, 1, "stream item")?,
                item: array[2].clone(),
            }
        }
        3 => {
            if array.len() != 4 {
                return Err(ProtocolError::MalformedMessage("completion"));
            }
            let result = if array[2].is_null() {
                None
            } else {
                Some(array[2].clone())
            };
            let error = match &array[3] {
                Value::String(error) => Some(error.clone()),
                Value::Null => None,
                _ => return Err(ProtocolError::MalformedMessage("completion")),
            };
            HubMessage::Completion {
                invocation_id: string_at(&array, 1, "completion")?,
                result,
                error,
            }
        }
        4 => {
            if array.len() < 3 {
                return Err(ProtocolError::MalformedMessage("stream invocation"));
            }
            HubMessage::StreamInvocation {
                invocation_id: string_at(&array, 1, "stream invocation")?,
                target: string_at(&array, 2, "stream invocation")?,
                arguments: array.into_iter().skip(3).collect(),
            }
        }
        5 => {
            if array.len() != 2 {
                return Err(ProtocolError::MalformedMessage("cancel invocation"));
            }
            HubMessage::CancelInvocation {
                invocation_id: string_at(&array, 1, "cancel invocation")?,
            }
        }
        6 => HubMessage::Ping,
        7 => {
            if array.len() < 2 {
                return Err(ProtocolError::MalformedMessage("close"));
            }
            let detail = array[1].as_object();
            HubMessage::Close {
                error: detail
                    .and_then(|d| d.get("error"))
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                allow_reconnect: detail
                    .and_then(|d| d.get("allowReconnect"))
                    .and_then(Value::as_bool),
            }
        }
        unknown => {
            warn!(message_type = unknown, "skipping message of unknown type");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

fn string_at(array: &[Value], index: usize, kind: &'static str) -> Result<String, ProtocolError> {
    match &array[index] {
        Value::String(value) => Ok(value.clone()),
        _ => Err(ProtocolError::MalformedMessage(kind)),
    }
}

fn write_varint(buffer: &mut Vec<u8>, mut value: usize) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buffer.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Returns the decoded length and the number of bytes it occupied.
fn read_varint(data: &[u8]) -> Result<(usize, usize), ProtocolError> {
    let mut value: usize = 0;
    for (i, &byte) in data.iter().enumerate().take(5) {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(ProtocolError::IncompleteMessage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip(message: HubMessage) {
        let encoded = MessagePackHubProtocol.encode(&message).unwrap();
        let decoded = MessagePackHubProtocol.parse(&encoded).unwrap();
        assert_eq!(decoded, vec![message]);
    }

    #[test]
    fn ping_is_length_prefixed_fixarray() {
        let encoded = MessagePackHubProtocol.encode(&HubMessage::Ping).unwrap();
        // varint length 2, then [6]
        assert_eq!(encoded, vec![0x02, 0x91, 0x06]);
    }

    #[test]
    fn invocation_without_id_round_trips() {
        round_trip(HubMessage::Invocation {
            invocation_id: None,
            target: "NewsUpdate".into(),
            arguments: vec![json!({ "title": "Hello" })],
        });
    }

    #[test]
    fn invocation_with_id_round_trips() {
        round_trip(HubMessage::Invocation {
            invocation_id: Some("12".into()),
            target: "Add".into(),
            arguments: vec![json!(1), json!(2)],
        });
    }

    #[test]
    fn completion_success_round_trips() {
        round_trip(HubMessage::Completion {
            invocation_id: "3".into(),
            result: Some(json!("result value")),
            error: None,
        });
    }

    #[test]
    fn completion_error_round_trips() {
        round_trip(HubMessage::Completion {
            invocation_id: "3".into(),
            result: None,
            error: Some("something went wrong".into()),
        });
    }

    #[test]
    fn stream_messages_round_trip() {
        round_trip(HubMessage::StreamItem {
            invocation_id: "5".into(),
            item: json!(42),
        });
        round_trip(HubMessage::StreamInvocation {
            invocation_id: "5".into(),
            target: "Count".into(),
            arguments: vec![json!(10)],
        });
        round_trip(HubMessage::CancelInvocation {
            invocation_id: "5".into(),
        });
    }

    #[test]
    fn close_round_trips() {
        round_trip(HubMessage::Close {
            error: Some("test error".into()),
            allow_reconnect: None,
        });
    }

    #[test]
    fn several_messages_parse_in_order() {
        let mut frame = MessagePackHubProtocol.encode(&HubMessage::Ping).unwrap();
        frame.extend(
            MessagePackHubProtocol
                .encode(&HubMessage::StreamItem {
                    invocation_id: "1".into(),
                    item: json!(1),
                })
                .unwrap(),
        );
        let messages = MessagePackHubProtocol.parse(&frame).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], HubMessage::Ping);
        assert!(matches!(messages[1], HubMessage::StreamItem { .. }));
    }

    #[test]
    fn long_message_uses_multi_byte_length() {
        let message = HubMessage::Invocation {
            invocation_id: Some("1".into()),
            target: "x".repeat(300),
            arguments: vec![],
        };
        let encoded = MessagePackHubProtocol.encode(&message).unwrap();
        assert_ne!(encoded[0] & 0x80, 0);
        assert_eq!(
            MessagePackHubProtocol.parse(&encoded).unwrap(),
            vec![message]
        );
    }

    #[test]
    fn truncated_body_is_incomplete() {
        let encoded = MessagePackHubProtocol.encode(&HubMessage::Ping).unwrap();
        assert!(matches!(
            MessagePackHubProtocol.parse(&encoded[..encoded.len() - 1]),
            Err(ProtocolError::IncompleteMessage)
        ));
    }

    #[test]
    fn varint_round_trips() {
        for value in [0usize, 1, 127, 128, 300, 16_384, 1 << 20] {
            let mut buffer = Vec::new();
            write_varint(&mut buffer, value);
            assert_eq!(read_varint(&buffer).unwrap(), (value, buffer.len()));
        }
    }
}
