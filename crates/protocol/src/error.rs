//! Protocol error types

use thiserror::Error;

/// Errors raised while encoding or decoding control records
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The record's self-reported size does not match the expected layout
    #[error("Record size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    /// A string does not fit its fixed-width field (terminator included)
    #[error("Field '{field}' too long: {len} bytes (max: {max})")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    /// A fixed-width string field has no NUL terminator
    #[error("Field '{field}' is not NUL-terminated")]
    Unterminated { field: &'static str },

    /// A fixed-width string field is not valid UTF-8
    #[error("Field '{field}' is not valid UTF-8")]
    InvalidString { field: &'static str },

    /// Numeric value outside the enumeration it encodes
    #[error("Invalid {what} value: {value}")]
    InvalidValue { what: &'static str, value: i64 },

    /// I/O error while reading or writing a record
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
