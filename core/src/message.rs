//! Immutable value types exchanged over the bus: RPC calls, RPC results,
//! and events.
//!
//! Grounded on the plain message value types in the teacher's
//! `core/src/event_bus.rs` (now removed) and on the field layout
//! asserted by `test_unit_redis_events.py` in `original_source/`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Arguments passed to a procedure call or carried by an event, keyed by
/// name. `BTreeMap` gives a deterministic iteration order, which matters
/// for by-field serialization (stable field ordering in logs/tests).
pub type Kwargs = BTreeMap<String, Value>;

/// A transport-specific token identifying where an RPC result must be
/// sent. Opaque to everything except the transport that minted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnPath(pub String);

impl fmt::Display for ReturnPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stream entry id in Redis Streams form, `<millis>-<seq>`, parsed so
/// that ordering comparisons are a derived `Ord` rather than string
/// comparison (see SPEC_FULL.md §3 supplement).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    /// Millisecond component of the id.
    pub millis: u64,
    /// Sequence component of the id, disambiguating same-millisecond entries.
    pub seq: u64,
}

impl StreamId {
    /// The smallest possible id, used as the default `since` bound.
    pub const ZERO: Self = Self { millis: 0, seq: 0 };

    /// Parse a Redis Streams entry id of the form `"<millis>-<seq>"`.
    ///
    /// # Errors
    ///
    /// Returns an error if `s` is not in `<millis>-<seq>` form or either
    /// component is not a valid `u64`.
    pub fn parse(s: &str) -> Result<Self, StreamIdParseError> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| StreamIdParseError(s.to_string()))?;
        let millis = millis
            .parse()
            .map_err(|_| StreamIdParseError(s.to_string()))?;
        let seq = seq.parse().map_err(|_| StreamIdParseError(s.to_string()))?;
        Ok(Self { millis, seq })
    }

    /// Map a wall-clock millisecond timestamp onto the `<ms>-0` id form,
    /// per spec.md §4.1's `since` edge case.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis, seq: 0 }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

/// Raised when a stream id string is not in `<millis>-<seq>` form.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid stream id: {0:?}")]
pub struct StreamIdParseError(pub String);

/// An RPC call in flight. Immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    /// Opaque unique id for this call, used to correlate the eventual
    /// [`ResultMessage`].
    pub id: String,
    /// The API the procedure belongs to.
    pub api_name: String,
    /// The procedure being called.
    pub procedure_name: String,
    /// Named arguments for the call.
    pub kwargs: Kwargs,
    /// Where the result should be delivered. `None` until a
    /// `RpcTransport` assigns one at send time.
    pub return_path: Option<ReturnPath>,
}

impl RpcMessage {
    /// Construct a new call with no return path assigned yet.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        api_name: impl Into<String>,
        procedure_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: id.into(),
            api_name: api_name.into(),
            procedure_name: procedure_name.into(),
            kwargs,
            return_path: None,
        }
    }

    /// Returns a copy of this message with `return_path` set, as done by
    /// `RpcTransport::call_rpc` immediately before publishing.
    #[must_use]
    pub fn with_return_path(mut self, return_path: ReturnPath) -> Self {
        self.return_path = Some(return_path);
        self
    }
}

/// A structured error payload carried by a [`ResultMessage`] when the
/// handler failed instead of returning a value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultError {
    /// Stable error kind name, e.g. `"HandlerError"` (see spec.md §8
    /// scenario 8).
    pub error_kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload the handler attached.
    pub payload: Option<Value>,
}

/// The outcome of one RPC call. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    /// The [`RpcMessage::id`] this result answers.
    pub rpc_message_id: String,
    /// Either the handler's return value or an error descriptor.
    pub outcome: ResultOutcome,
}

/// The success/failure union carried by a [`ResultMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ResultOutcome {
    /// The handler returned a value.
    Ok {
        /// The handler's return value.
        result: Value,
    },
    /// The handler raised, or the call otherwise failed server-side.
    Err {
        /// Error details.
        error: ResultError,
    },
}

impl ResultMessage {
    /// Build a successful result.
    #[must_use]
    pub fn ok(rpc_message_id: impl Into<String>, result: Value) -> Self {
        Self {
            rpc_message_id: rpc_message_id.into(),
            outcome: ResultOutcome::Ok { result },
        }
    }

    /// Build an error result.
    #[must_use]
    pub fn err(rpc_message_id: impl Into<String>, error: ResultError) -> Self {
        Self {
            rpc_message_id: rpc_message_id.into(),
            outcome: ResultOutcome::Err { error },
        }
    }
}

/// The wire-format version of [`EventMessage`]'s payload encoding. Only
/// `1` currently exists; see spec.md §3.
pub const EVENT_MESSAGE_VERSION: u32 = 1;

/// An event fired on an API. Immutable except for `native_id`, which a
/// transport sets exactly once, at receive time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Unique id assigned by the producer at fire time.
    pub id: String,
    /// The API the event belongs to.
    pub api_name: String,
    /// The event's name within that API.
    pub event_name: String,
    /// Named arguments carried by the event.
    pub kwargs: Kwargs,
    /// Payload encoding version; currently always [`EVENT_MESSAGE_VERSION`].
    pub version: u32,
    /// The transport-assigned id (e.g. the Redis Streams entry id),
    /// `None` until ingestion.
    pub native_id: Option<StreamId>,
    /// The consumer group this message was delivered under, `None` until
    /// ingestion. Carried alongside `native_id` so `acknowledge` can
    /// recompute the exact `(stream, consumer_group, native_id)` triple
    /// spec.md §4.1 requires, even though the group name
    /// (`<service_name>-<listener_name>`) is not recoverable from
    /// `api_name`/`event_name` alone.
    pub consumer_group: Option<String>,
}

impl EventMessage {
    /// Construct a new, not-yet-ingested event.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        api_name: impl Into<String>,
        event_name: impl Into<String>,
        kwargs: Kwargs,
    ) -> Self {
        Self {
            id: id.into(),
            api_name: api_name.into(),
            event_name: event_name.into(),
            kwargs,
            version: EVENT_MESSAGE_VERSION,
            native_id: None,
            consumer_group: None,
        }
    }

    /// The fully qualified `<api>.<event>` name, used for listener
    /// selectors and stream naming.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.api_name, self.event_name)
    }
}
