//! Cross-cutting error type for the bus client runtime.
//!
//! Transport crates define their own error enum at their boundary and
//! convert into [`BusError`] rather than exposing transport internals to
//! callers of [`crate::transport`].

use thiserror::Error;

/// Errors surfaced by the client runtime, the schema registry, the
/// transport registry, and the plugin pipeline.
///
/// Variant names intentionally mirror the error kinds named in the
/// design ("names used in hooks and logs, not type identifiers"), so a
/// `tracing` field of `error_kind = %err.kind()` stays stable even if the
/// `Display` message changes.
#[derive(Debug, Error)]
pub enum BusError {
    /// No transport resolves for an API/capability, neither a specific
    /// binding nor a `default` fallback.
    #[error("no transport found for api {api:?} capability {capability}")]
    TransportNotFound {
        /// The API name that failed to resolve, if any (`None` means the
        /// `default` entry itself was missing).
        api: Option<String>,
        /// Which of rpc/result/event/schema was being resolved.
        capability: &'static str,
    },

    /// `consume` was called with an empty selector.
    #[error("consume called with nothing to listen for")]
    NothingToListenFor,

    /// A schema document failed structural validation.
    #[error("invalid schema for api {api}: {reason}")]
    InvalidSchema {
        /// API the schema belongs to.
        api: String,
        /// Human-readable reason.
        reason: String,
    },

    /// No schema is registered for the requested api/procedure/event.
    #[error("schema not found for {0}")]
    SchemaNotFound(String),

    /// `Api::to_schema` was asked to describe something that cannot
    /// produce a schema (an Open Question 3 counterpart: here this means
    /// an `ApiMeta` with no declared procedures or events).
    #[error("invalid api for schema creation: {0}")]
    InvalidApiForSchemaCreation(String),

    /// Parameters or a response failed JSON-Schema validation.
    #[error("validation failed at {path}: {message}")]
    ValidationError {
        /// JSON-pointer-ish path into the failing value.
        path: String,
        /// Validator-produced message.
        message: String,
    },

    /// Caller-supplied parameters were structurally invalid before
    /// validation even ran (wrong kwarg names, etc).
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// A config path was malformed or internally inconsistent.
    #[error("invalid bus path configuration: {0}")]
    InvalidBusPathConfiguration(String),

    /// Cooperative cancellation sentinel raised while a shutdown is
    /// already underway. Supervisors swallow this; it should not escape
    /// to a caller.
    #[error("shutdown already in progress")]
    ShutdownInProgress,

    /// A synchronous-style call was attempted from within the event
    /// loop's own task.
    #[error("cannot block the event loop here")]
    CannotBlockHere,

    /// Startup failed to import/construct the bus module (the external
    /// collaborator's concern; represented here only so the exit-code
    /// mapping in `runtime::client` has somewhere to route it).
    #[error("failed to import bus module: {0}")]
    FailedToImportBusModule(String),

    /// `close` called on an already-closed client.
    #[error("bus already closed")]
    BusAlreadyClosed,

    /// A transport-local error that doesn't have a cross-cutting
    /// counterpart above; transport crates attach their own message.
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BusError {
    /// The stable, log/hook-friendly name of this error's kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TransportNotFound { .. } => "TransportNotFound",
            Self::NothingToListenFor => "NothingToListenFor",
            Self::InvalidSchema { .. } => "InvalidSchema",
            Self::SchemaNotFound(_) => "SchemaNotFound",
            Self::InvalidApiForSchemaCreation(_) => "InvalidApiForSchemaCreation",
            Self::ValidationError { .. } => "ValidationError",
            Self::InvalidParameters(_) => "InvalidParameters",
            Self::InvalidBusPathConfiguration(_) => "InvalidBusPathConfiguration",
            Self::ShutdownInProgress => "ShutdownInProgress",
            Self::CannotBlockHere => "CannotBlockHere",
            Self::FailedToImportBusModule(_) => "FailedToImportBusModule",
            Self::BusAlreadyClosed => "BusAlreadyClosed",
            Self::Transport(_) => "TransportError",
        }
    }
}

/// Helper so transport crates can box an arbitrary `std::error::Error`
/// into [`BusError::Transport`] with one `.map_err`.
pub fn transport_error<E>(err: E) -> BusError
where
    E: std::error::Error + Send + Sync + 'static,
{
    BusError::Transport(Box::new(err))
}

/// Convenience alias used throughout the bus crates.
pub type BusResult<T> = Result<T, BusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_for_hooks_and_logs() {
        let err = BusError::TransportNotFound {
            api: Some("auth".to_string()),
            capability: "event",
        };
        assert_eq!(err.kind(), "TransportNotFound");
    }

    #[test]
    fn transport_error_boxes_arbitrary_errors() {
        #[derive(Debug, thiserror::Error)]
        #[error("boom")]
        struct Boom;

        let err = transport_error(Boom);
        assert_eq!(err.kind(), "TransportError");
        assert_eq!(err.to_string(), "transport error: boom");
    }
}
