//! Packet envelope parsing and timestamp re-hydration.
//!
//! Every packet is a JSON object with at least a `type` field. Before a
//! packet reaches correlation or listener dispatch, ISO-8601 strings on
//! time-named fields are rewritten into epoch-millisecond numbers so that
//! downstream typed deserialization is uniform.

use chrono::DateTime;
use serde_json::Value;

use crate::error::Error;

/// Decoded packet envelope. The payload keeps the full original object.
#[derive(Debug)]
pub struct Packet {
    /// Packet type discriminator.
    pub packet_type: String,
    /// Account the packet belongs to, when routed per-account.
    pub account_id: Option<String>,
    /// Correlation id echoed from a request, when this is a reply.
    pub request_id: Option<String>,
    /// Full packet body with re-hydrated timestamps.
    pub body: Value,
}

/// Parse an inbound frame into a packet envelope.
///
/// # Errors
///
/// Returns [`Error::Transport`] when the frame is not a JSON object or lacks
/// a `type` field.
pub fn decode_packet(raw: &str) -> Result<Packet, Error> {
    let mut body: Value = serde_json::from_str(raw).map_err(|e| Error::Transport {
        message: format!("invalid packet JSON: {e}"),
    })?;

    let packet_type = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Transport {
            message: "packet has no type field".to_string(),
        })?
        .to_string();

    let account_id = body
        .get("accountId")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let request_id = body
        .get("requestId")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    rehydrate_time_fields(&mut body);

    Ok(Packet {
        packet_type,
        account_id,
        request_id,
        body,
    })
}

/// Recursively rewrite ISO-8601 strings into epoch-millisecond numbers on
/// every field whose key contains `time` or `Time`, through arrays and
/// nested objects.
///
/// Strings that do not parse are left untouched; so are fields of other
/// types. The walk is idempotent.
pub fn rehydrate_time_fields(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if is_time_key(key) {
                    rehydrate_value(field);
                }
                rehydrate_time_fields(field);
            }
        }
        Value::Array(items) => {
            for item in items {
                rehydrate_time_fields(item);
            }
        }
        _ => {}
    }
}

fn is_time_key(key: &str) -> bool {
    key.contains("time") || key.contains("Time")
}

/// Convert one matched field, descending into arrays so that lists of
/// timestamps under a time-named key convert element-wise.
fn rehydrate_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                *value = Value::from(parsed.timestamp_millis());
            }
        }
        Value::Array(items) => {
            for item in items {
                rehydrate_value(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_envelope_fields() {
        let packet = decode_packet(
            r#"{"type":"response","accountId":"a1","requestId":"r1","ok":true}"#,
        )
        .unwrap();
        assert_eq!(packet.packet_type, "response");
        assert_eq!(packet.account_id.as_deref(), Some("a1"));
        assert_eq!(packet.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn rejects_untyped_packets() {
        assert!(decode_packet(r#"{"accountId":"a1"}"#).is_err());
        assert!(decode_packet("not json").is_err());
    }

    #[test]
    fn rehydrates_nested_time_fields() {
        let mut value = json!({
            "time": "2024-06-01T12:00:00.000Z",
            "position": {
                "updateTime": "2024-06-01T12:00:01.000Z",
                "openPrice": 1.3
            },
            "deals": [
                {"brokerTime": "2024-06-01T12:00:02.000Z"},
                {"brokerTime": "2024-06-01T12:00:03.000Z"}
            ]
        });

        rehydrate_time_fields(&mut value);

        assert_eq!(value["time"], 1_717_243_200_000_i64);
        assert_eq!(value["position"]["updateTime"], 1_717_243_201_000_i64);
        assert_eq!(value["deals"][0]["brokerTime"], 1_717_243_202_000_i64);
        assert_eq!(value["deals"][1]["brokerTime"], 1_717_243_203_000_i64);
        assert_eq!(value["position"]["openPrice"], 1.3);
    }

    #[test]
    fn rehydrates_arrays_under_time_keys() {
        let mut value = json!({
            "closeTimes": ["2024-06-01T12:00:00.000Z", "2024-06-01T13:00:00.000Z"]
        });
        rehydrate_time_fields(&mut value);
        assert_eq!(value["closeTimes"][0], 1_717_243_200_000_i64);
        assert_eq!(value["closeTimes"][1], 1_717_246_800_000_i64);
    }

    #[test]
    fn leaves_non_time_strings_alone() {
        let mut value = json!({
            "comment": "2024-06-01T12:00:00.000Z",
            "timeframe": "not a date"
        });
        rehydrate_time_fields(&mut value);
        // `comment` does not match the key pattern, `timeframe` does but the
        // value is not a timestamp.
        assert_eq!(value["comment"], "2024-06-01T12:00:00.000Z");
        assert_eq!(value["timeframe"], "not a date");
    }

    #[test]
    fn rehydration_is_idempotent() {
        let mut value = json!({"time": "2024-06-01T12:00:00.000Z"});
        rehydrate_time_fields(&mut value);
        let once = value.clone();
        rehydrate_time_fields(&mut value);
        assert_eq!(value, once);
    }
}
