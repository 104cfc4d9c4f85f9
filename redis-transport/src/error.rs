//! Transport-local error type for the Redis-backed transports.
//!
//! Grounded on the teacher's `core/src/event_bus.rs` `EventBusError`
//! enum shape (connection/publish/subscribe/deserialization variants),
//! generalized to also cover RPC call-queue and schema-store failures.
//! Converts into [`meshbus_core::BusError`] via
//! [`RedisTransportError::into_bus_error`] at every public API boundary.

use meshbus_core::error::{transport_error, BusError};

/// Errors local to the Redis transports, before being folded into
/// [`BusError`] at the `meshbus-core` trait boundary.
#[derive(Debug, thiserror::Error)]
pub enum RedisTransportError {
    /// Could not establish (or re-establish) a connection.
    #[error("failed to connect to redis at {url}: {source}")]
    ConnectionFailed {
        /// The connection URL attempted (password-scrubbed by the
        /// caller before this error is constructed).
        url: String,
        /// Underlying `redis` crate error.
        #[source]
        source: redis::RedisError,
    },

    /// A command the transport issued failed.
    #[error("redis command failed: {0}")]
    Command(#[from] redis::RedisError),

    /// A stream entry's fields could not be decoded into an `EventMessage`.
    #[error("failed to decode stream entry {entry_id}: {reason}")]
    Decode {
        /// The raw stream entry id that failed to decode.
        entry_id: String,
        /// Why decoding failed.
        reason: String,
    },

    /// `receive_result` timed out waiting on the return-path key.
    #[error("timed out waiting for rpc result on {return_path}")]
    ResultTimeout {
        /// The return-path key that never received a result.
        return_path: String,
    },

    /// A JSON encode/decode step failed outside of stream-entry decoding
    /// (RPC payloads, schema documents).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RedisTransportError {
    /// Fold this transport-local error into the cross-cutting
    /// [`BusError`] every `meshbus-core` trait method returns.
    #[must_use]
    pub fn into_bus_error(self) -> BusError {
        transport_error(self)
    }
}

/// Convenience alias for transport-internal plumbing.
pub type RedisResult<T> = Result<T, RedisTransportError>;
