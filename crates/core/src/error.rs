//! Errors raised while constructing identifiers and keys from caller input.

use thiserror::Error;

/// Caller input that cannot become a domain value.
///
/// IO, storage and transport failures are reported by their own crates.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A key or name was blank or otherwise malformed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier did not parse; the message starts with the id type.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}
