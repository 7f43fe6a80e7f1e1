//! Error types for identity parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating identities.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identity string is empty.
    #[error("identity cannot be empty")]
    Empty,

    /// The ID has an invalid prefix.
    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// The ID is missing the underscore separator.
    #[error("ID missing underscore separator")]
    MissingSeparator,

    /// The ULID portion of the ID is invalid.
    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// Numeric identities are internal and cannot be used for lookup.
    #[error("'{0}' looks like a numeric id; use a UUID or a name")]
    Numeric(String),

    /// The identity is neither a UUID nor a valid logical name.
    #[error("'{identity}' is not a valid UUID or logical name")]
    InvalidFormat { identity: String },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error indicates a prefix mismatch.
    pub fn is_prefix_error(&self) -> bool {
        matches!(self, IdError::InvalidPrefix { .. } | IdError::MissingSeparator)
    }
}
