//! Error types for credential parsing.

use thiserror::Error;

/// Errors that can occur when building a [`Header`](crate::Header).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The input does not have the fixed header length.
    #[error("invalid header length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The input contains a character that is not a hex digit.
    #[error("invalid hex digit at position {position}")]
    InvalidHex { position: usize },
}

impl CredentialError {
    /// Returns true if this error indicates a length mismatch.
    pub fn is_length_error(&self) -> bool {
        matches!(self, CredentialError::InvalidLength { .. })
    }
}
