//! Mapping between wire payloads and application event envelopes.
//!
//! Outbound events are flattened into one JSON object: the `data` field next to
//! every header. Inbound payloads are unwrapped the other way, except that a
//! payload without a `data` field is taken as data in its entirety, since not
//! every producer wraps its payload.

use serde_json::{Map, Value};

use crate::session::Payload;

/// Field carrying the event data inside a wire payload.
pub const DATA_FIELD: &str = "data";

/// Event to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    /// Event name, used as the topic destination.
    pub event: String,
    pub data: Value,
    pub headers: Map<String, Value>,
}

impl OutboundEvent {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            headers: Map::new(),
        }
    }

    pub fn with_headers(mut self, headers: Map<String, Value>) -> Self {
        self.headers = headers;
        self
    }
}

/// Event received from the queue, built fresh per message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    /// Event name, taken from the message destination.
    pub event: String,
    pub data: Value,
    pub headers: Map<String, Value>,
}

/// Flatten data and headers into a single wire object.
///
/// Headers are written after `data`, so a header named `data` wins.
pub fn to_wire(data: &Value, headers: &Map<String, Value>) -> Value {
    let mut wire = Map::with_capacity(headers.len() + 1);
    wire.insert(DATA_FIELD.to_string(), data.clone());
    for (key, value) in headers {
        wire.insert(key.clone(), value.clone());
    }
    Value::Object(wire)
}

/// Serialized binary attachment for an outbound event.
pub fn encode(event: &OutboundEvent) -> Vec<u8> {
    to_wire(&event.data, &event.headers).to_string().into_bytes()
}

/// Split a wire payload into data and headers.
pub fn from_wire(payload: &Payload) -> (Value, Map<String, Value>) {
    let parsed = match payload {
        Payload::Binary(bytes) => json_or_string(&String::from_utf8_lossy(bytes)),
        Payload::Text(text) => json_or_string(text),
    };

    match parsed {
        Value::Object(mut fields) if fields.contains_key(DATA_FIELD) => {
            let data = fields.shift_remove(DATA_FIELD).unwrap_or(Value::Null);
            (data, fields)
        }
        other => (other, Map::new()),
    }
}

fn json_or_string(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[test]
    fn test_to_wire_puts_data_first() {
        let wire = to_wire(
            &json!({"key1": 1, "value1": 1}),
            &headers(json!({"keyHeader1": 1, "valueHeader1": 1})),
        );
        assert_eq!(
            wire.to_string(),
            r#"{"data":{"key1":1,"value1":1},"keyHeader1":1,"valueHeader1":1}"#
        );
    }

    #[test]
    fn test_round_trip_restores_data_and_headers() {
        let data = json!({"order": 42, "items": ["a", "b"]});
        let hdrs = headers(json!({"x-correlation-id": "c-1", "tenant": "t1"}));
        let event = OutboundEvent::new("orders/created", data.clone()).with_headers(hdrs.clone());

        let (got_data, got_headers) = from_wire(&Payload::Binary(encode(&event)));

        assert_eq!(got_data, data);
        assert_eq!(got_headers, hdrs);
    }

    #[test]
    fn test_payload_without_data_field_is_all_data() {
        let (data, hdrs) = from_wire(&Payload::Text(r#"{"id": 7, "status": "open"}"#.into()));
        assert_eq!(data, json!({"id": 7, "status": "open"}));
        assert!(hdrs.is_empty());
    }

    #[test]
    fn test_non_json_payload_is_opaque_string() {
        let (data, hdrs) = from_wire(&Payload::Binary(b"plain text body".to_vec()));
        assert_eq!(data, json!("plain text body"));
        assert!(hdrs.is_empty());
    }

    #[test]
    fn test_non_object_json_is_data() {
        let (data, hdrs) = from_wire(&Payload::Text("[1,2,3]".into()));
        assert_eq!(data, json!([1, 2, 3]));
        assert!(hdrs.is_empty());
    }

    #[test]
    fn test_null_data_field_is_kept() {
        let (data, hdrs) = from_wire(&Payload::Text(r#"{"data": null, "h": 1}"#.into()));
        assert_eq!(data, Value::Null);
        assert_eq!(hdrs, headers(json!({"h": 1})));
    }

    #[test]
    fn test_header_named_data_overrides() {
        let wire = to_wire(&json!(1), &headers(json!({"data": 2})));
        assert_eq!(wire, json!({"data": 2}));
    }
}
