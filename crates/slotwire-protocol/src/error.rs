//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised by the codec, the catalog and the framing layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Encoded payload does not fit the 16-bit size field.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Input ended before the value was complete.
    #[error("unexpected end of payload: needed {needed} bytes, {remaining} left")]
    UnexpectedEnd { needed: usize, remaining: usize },

    /// String bytes are not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,

    /// Bytes do not form a single UTF-8 encoded `char`.
    #[error("invalid char encoding")]
    InvalidChar,

    /// Variable-length string prefix runs past five bytes.
    #[error("malformed string length prefix")]
    BadLengthPrefix,

    /// Array element count is negative.
    #[error("negative array length: {0}")]
    NegativeLength(i32),

    /// Collection has more elements than an `i32` count can carry.
    #[error("collection of {0} elements cannot be encoded")]
    CollectionTooLong(usize),

    /// Fixed-length array received a different element count.
    #[error("fixed array expects {expected} elements, got {actual}")]
    ArrayLength { expected: usize, actual: usize },

    /// Discriminant does not name any variant.
    #[error("unknown value {value} for enum {name}")]
    UnknownEnumValue { name: &'static str, value: i64 },

    /// Two schema entries share one field name.
    #[error("duplicate field '{field}' in schema of {owner}")]
    DuplicateField {
        owner: &'static str,
        field: &'static str,
    },

    /// Nested schemas exceed the supported depth (usually a recursive type).
    #[error("schema of {0} nests too deeply")]
    NestingTooDeep(&'static str),

    /// The same type was registered twice in one direction.
    #[error("{direction} type {name} registered twice")]
    DuplicateType {
        direction: &'static str,
        name: &'static str,
    },

    /// More than 256 types in one direction, ping included.
    #[error("catalog has {count} {direction} types (max: {max})")]
    CatalogTooLarge {
        direction: &'static str,
        count: usize,
        max: usize,
    },

    /// Type was never registered.
    #[error("{direction} type {name} is not in the catalog")]
    UnknownType {
        direction: &'static str,
        name: &'static str,
    },

    /// Kind byte has no registered codec.
    #[error("unknown {direction} kind {kind}")]
    UnknownKind { direction: &'static str, kind: u8 },

    /// Erased message handed to the wrong codec.
    #[error("message is not a {expected}")]
    TypeMismatch { expected: &'static str },

    /// Decoded length differs from the header's payload size.
    #[error("payload size mismatch: header says {declared} bytes, decoded {consumed}")]
    SizeMismatch { declared: usize, consumed: usize },

    /// Status byte outside the known range.
    #[error("unknown status code {0}")]
    UnknownStatus(u8),
}
