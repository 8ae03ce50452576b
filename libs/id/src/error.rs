//! Errors for generated IDs and operator-chosen names.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// The input is not `{kind}_{ulid}`, either because the separator is
    /// missing or because it belongs to another kind of ID.
    #[error("'{input}' is not a {kind} ID")]
    WrongKind { kind: &'static str, input: String },

    #[error("invalid ULID in '{input}': {reason}")]
    InvalidUlid { input: String, reason: String },

    /// A name contains a character that cannot appear in a node path.
    #[error("invalid character {found:?} in name '{name}'")]
    InvalidCharacter { name: String, found: char },

    #[error("name is {len} bytes, maximum is {max}")]
    TooLong { len: usize, max: usize },
}
