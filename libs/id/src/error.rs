//! Error types for ID and name parsing.

use thiserror::Error;

/// Errors that can occur when parsing IDs or validating names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The input string is empty.
    #[error("value cannot be empty")]
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

    /// A name exceeds the maximum label length.
    #[error("name '{name}' is longer than {max} characters")]
    NameTooLong { name: String, max: usize },

    /// A name contains characters outside the DNS label alphabet.
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if this error came from name validation.
    pub fn is_name_error(&self) -> bool {
        matches!(
            self,
            IdError::NameTooLong { .. } | IdError::InvalidName { .. }
        )
    }
}
