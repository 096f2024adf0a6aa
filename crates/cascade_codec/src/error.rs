//! Error types for the key codec.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding keys.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Integer magnitude exceeds the exact range of the number encoding.
    #[error("integer out of exact range: {value}")]
    IntOutOfRange {
        /// The rejected value.
        value: i64,
    },

    /// Non-finite numbers have no defined ordering on disk.
    #[error("non-finite number cannot be encoded")]
    NonFiniteNumber,

    /// Decoding was asked for a key but given no bytes.
    #[error("empty input")]
    Empty,

    /// Input ended inside an encoded value.
    #[error("truncated input")]
    Truncated,

    /// The leading byte is not a known type tag.
    #[error("invalid type tag: {0:#04x}")]
    InvalidTag(u8),

    /// An escape sequence carried an out-of-range payload byte.
    #[error("invalid escape byte: {0:#04x}")]
    InvalidEscape(u8),

    /// Decoded string bytes are not valid UTF-8.
    #[error("invalid UTF-8 in encoded string")]
    InvalidUtf8,

    /// Bytes remain after a complete key was decoded.
    #[error("trailing bytes after key")]
    TrailingBytes,

    /// A composite separator was expected between parts.
    #[error("missing composite separator at offset {offset}")]
    MissingSeparator {
        /// Byte offset where the separator was expected.
        offset: usize,
    },
}
