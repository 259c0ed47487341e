//! Error types for the normalizer and the publish sinks.

use thiserror::Error;

/// Why a raw feed message could not be turned into events.
///
/// Every variant is local to one message: the worker logs it and moves on.
#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is neither a ticker array nor an object")]
    UnexpectedShape,

    #[error("envelope has no data field")]
    MissingPayload,

    #[error("payload has no event type field")]
    MissingEventType,

    #[error("event type is not a string: {0}")]
    EventTypeNotString(serde_json::Value),

    #[error("could not decode {kind} payload: {source}")]
    Decode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("field {field} is not a number: {value:?}")]
    Number { field: &'static str, value: String },

    #[error("event time {0} is out of range")]
    Timestamp(i64),

    #[error("ticker for {0} has an empty open/high/low")]
    EmptyTicker(String),
}

/// Failure to hand a batch to the downstream broker.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("broker {endpoint} answered {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("{failed} of {total} records rejected: {first_error}")]
    Rejected {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("could not serialise record: {0}")]
    Serialise(#[from] serde_json::Error),

    #[error("no broker endpoints configured")]
    NoEndpoints,
}

impl PublishError {
    /// Whether another attempt may succeed.
    pub fn should_retry(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Rejected { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Serialise(_) | Self::NoEndpoints => false,
        }
    }
}
