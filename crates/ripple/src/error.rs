//! Error types.
//!
//! The diff engine and match predicate have no error conditions. Everything
//! here belongs to decoding records and dispatching them to handlers.

use thiserror::Error;

/// Failure decoding the attribute wire encoding into a [`crate::Value`].
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid number `{0}`")]
    InvalidNumber(String),

    #[error("invalid base64 in binary attribute: {0}")]
    InvalidBinary(#[from] base64::DecodeError),

    #[error("cannot encode {0} as a top-level item, expected a map")]
    NotAMap(&'static str),

    #[error("cannot encode {kind} inside a set; sets hold strings, numbers or binary")]
    UnsupportedSetMember { kind: &'static str },
}

/// Errors surfaced by the router.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid filter: {reason}")]
    InvalidFilter { reason: String },

    #[error("handler `{handler_id}` has an invalid filter: {reason}")]
    InvalidHandlerFilter { handler_id: String, reason: String },

    #[error("handler id `{0}` is registered more than once")]
    DuplicateHandler(String),

    #[error("no handler registered with id `{0}`")]
    UnknownHandler(String),

    #[error("record {sequence_number} could not be decoded: {source}")]
    Decode {
        sequence_number: String,
        #[source]
        source: CodecError,
    },

    #[error("handler `{handler_id}` failed on record {sequence_number}: {source}")]
    Handler {
        handler_id: String,
        sequence_number: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("handler `{handler_id}` timed out after {timeout_ms}ms")]
    Timeout { handler_id: String, timeout_ms: u64 },

    #[error("handler `{0}` is deferred but no defer queue is configured")]
    NoDeferQueue(String),

    #[error("failed to defer handler `{handler_id}`: {source}")]
    Defer {
        handler_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid deferred payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RouterError {
    /// Sequence number of the record this error is about, if any.
    pub fn sequence_number(&self) -> Option<&str> {
        match self {
            RouterError::Decode {
                sequence_number, ..
            }
            | RouterError::Handler {
                sequence_number, ..
            } => Some(sequence_number),
            _ => None,
        }
    }

    /// Whether running the same thing again could succeed. Bad payloads,
    /// undecodable records and unknown handlers fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RouterError::Decode { .. }
                | RouterError::Payload(_)
                | RouterError::UnknownHandler(_)
                | RouterError::InvalidFilter { .. }
                | RouterError::InvalidHandlerFilter { .. }
                | RouterError::DuplicateHandler(_)
                | RouterError::Config(_)
        )
    }
}
