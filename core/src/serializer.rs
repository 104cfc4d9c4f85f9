//! Encode/decode events to/from the stream field dictionary a transport
//! actually stores, per the bit-exact layout in spec.md §6.
//!
//! Two strategies exist: [`ByFieldSerializer`], which stores one `:kwarg`
//! field per argument, and [`BlobSerializer`], which stores a single
//! `:payload` field holding the whole kwargs map as one JSON document.
//! Grounded on `test_unit_redis_events.py`'s `test_send_event` fixtures.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{BusError, BusResult};
use crate::message::{EventMessage, Kwargs, StreamId};

/// The raw field map a stream entry is made of: plain strings in, plain
/// strings out, matching what a Redis Streams entry actually stores.
pub type FieldMap = BTreeMap<String, String>;

const FIELD_API_NAME: &str = "api_name";
const FIELD_EVENT_NAME: &str = "event_name";
const FIELD_ID: &str = "id";
const FIELD_VERSION: &str = "version";
const FIELD_PAYLOAD: &str = ":payload";
const KWARG_FIELD_PREFIX: char = ':';

/// A strategy for turning an [`EventMessage`] into a [`FieldMap`] and
/// back. Transports call this rather than hand-rolling field layout so
/// the wire format stays in one place.
pub trait EventSerializer: Send + Sync {
    /// Encode `msg` into the field map a stream entry should carry.
    /// `native_id` and `msg.native_id` are not part of the encoding: the
    /// id lives in the entry's own id slot, not a field.
    fn encode(&self, msg: &EventMessage) -> FieldMap;

    /// Decode a field map (plus the entry's own stream id) back into an
    /// [`EventMessage`].
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ValidationError`] if a required field is
    /// missing, or a kwarg/payload value is not valid JSON.
    fn decode(&self, native_id: StreamId, fields: &FieldMap) -> BusResult<EventMessage>;
}

fn decode_common(fields: &FieldMap) -> BusResult<(String, String, String, u32)> {
    let get = |name: &str| -> BusResult<String> {
        fields.get(name).cloned().ok_or_else(|| BusError::ValidationError {
            path: name.to_string(),
            message: "missing required stream field".to_string(),
        })
    };
    let api_name = get(FIELD_API_NAME)?;
    let event_name = get(FIELD_EVENT_NAME)?;
    let id = get(FIELD_ID)?;
    let version: u32 = get(FIELD_VERSION)?.parse().map_err(|_| BusError::ValidationError {
        path: FIELD_VERSION.to_string(),
        message: "version field is not an integer".to_string(),
    })?;
    Ok((api_name, event_name, id, version))
}

/// One `:<kwarg>` field per argument, each value the JSON encoding of
/// that argument. This is the default and the one exercised bit-exactly
/// by `test_send_event` in `original_source/`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByFieldSerializer;

impl EventSerializer for ByFieldSerializer {
    fn encode(&self, msg: &EventMessage) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(FIELD_API_NAME.to_string(), msg.api_name.clone());
        fields.insert(FIELD_EVENT_NAME.to_string(), msg.event_name.clone());
        fields.insert(FIELD_ID.to_string(), msg.id.clone());
        fields.insert(FIELD_VERSION.to_string(), msg.version.to_string());
        for (key, value) in &msg.kwargs {
            let encoded = serde_json::to_string(value).unwrap_or_default();
            fields.insert(format!("{KWARG_FIELD_PREFIX}{key}"), encoded);
        }
        fields
    }

    fn decode(&self, native_id: StreamId, fields: &FieldMap) -> BusResult<EventMessage> {
        let (api_name, event_name, id, version) = decode_common(fields)?;
        let mut kwargs = Kwargs::new();
        for (key, value) in fields {
            let Some(name) = key.strip_prefix(KWARG_FIELD_PREFIX) else {
                continue;
            };
            let decoded: Value = serde_json::from_str(value).map_err(|e| BusError::ValidationError {
                path: key.clone(),
                message: format!("kwarg is not valid json: {e}"),
            })?;
            kwargs.insert(name.to_string(), decoded);
        }
        Ok(EventMessage {
            id,
            api_name,
            event_name,
            kwargs,
            version,
            native_id: Some(native_id),
            consumer_group: None,
        })
    }
}

/// A single `:payload` field holding the whole kwargs map as one JSON
/// document, trading per-field introspection (e.g. via `XRANGE` filters
/// on a single kwarg) for fewer round-trip allocations.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlobSerializer;

impl EventSerializer for BlobSerializer {
    fn encode(&self, msg: &EventMessage) -> FieldMap {
        let mut fields = FieldMap::new();
        fields.insert(FIELD_API_NAME.to_string(), msg.api_name.clone());
        fields.insert(FIELD_EVENT_NAME.to_string(), msg.event_name.clone());
        fields.insert(FIELD_ID.to_string(), msg.id.clone());
        fields.insert(FIELD_VERSION.to_string(), msg.version.to_string());
        let payload = serde_json::to_string(&msg.kwargs).unwrap_or_default();
        fields.insert(FIELD_PAYLOAD.to_string(), payload);
        fields
    }

    fn decode(&self, native_id: StreamId, fields: &FieldMap) -> BusResult<EventMessage> {
        let (api_name, event_name, id, version) = decode_common(fields)?;
        let payload = fields.get(FIELD_PAYLOAD).ok_or_else(|| BusError::ValidationError {
            path: FIELD_PAYLOAD.to_string(),
            message: "missing payload field".to_string(),
        })?;
        let kwargs: Kwargs = serde_json::from_str(payload).map_err(|e| BusError::ValidationError {
            path: FIELD_PAYLOAD.to_string(),
            message: format!("payload is not a valid json object: {e}"),
        })?;
        Ok(EventMessage {
            id,
            api_name,
            event_name,
            kwargs,
            version,
            native_id: Some(native_id),
            consumer_group: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_message() -> EventMessage {
        let mut kwargs = Kwargs::new();
        kwargs.insert("field".to_string(), json!("value"));
        EventMessage::new("123", "my.api", "my_event", kwargs)
    }

    #[test]
    fn by_field_matches_bit_exact_layout_from_scenario_1() {
        let fields = ByFieldSerializer.encode(&sample_message());
        assert_eq!(fields.get("api_name").unwrap(), "my.api");
        assert_eq!(fields.get("event_name").unwrap(), "my_event");
        assert_eq!(fields.get("id").unwrap(), "123");
        assert_eq!(fields.get("version").unwrap(), "1");
        assert_eq!(fields.get(":field").unwrap(), "\"value\"");
    }

    #[test]
    fn by_field_round_trips() {
        let original = sample_message();
        let fields = ByFieldSerializer.encode(&original);
        let decoded = ByFieldSerializer.decode(StreamId { millis: 1, seq: 0 }, &fields).unwrap();
        assert_eq!(decoded.api_name, original.api_name);
        assert_eq!(decoded.event_name, original.event_name);
        assert_eq!(decoded.kwargs, original.kwargs);
        assert_eq!(decoded.native_id, Some(StreamId { millis: 1, seq: 0 }));
    }

    #[test]
    fn blob_round_trips() {
        let original = sample_message();
        let fields = BlobSerializer.encode(&original);
        assert!(fields.contains_key(":payload"));
        let decoded = BlobSerializer.decode(StreamId { millis: 2, seq: 0 }, &fields).unwrap();
        assert_eq!(decoded.kwargs, original.kwargs);
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        let mut fields = FieldMap::new();
        fields.insert("api_name".to_string(), "my.api".to_string());
        let err = ByFieldSerializer.decode(StreamId::ZERO, &fields).unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
    }
}
