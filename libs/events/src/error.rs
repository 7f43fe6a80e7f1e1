//! Error types for notification handling.

use thiserror::Error;

/// Errors that can occur when building or decoding notifications.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type is unknown.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// A state name did not match any known state.
    #[error("unknown {kind} state: {value}")]
    UnknownState { kind: &'static str, value: String },

    /// A required builder field was never set.
    #[error("notification is missing required field '{0}'")]
    MissingField(&'static str),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
