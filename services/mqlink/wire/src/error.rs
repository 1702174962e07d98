//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Incomplete packet (need more data)
    #[error("incomplete packet")]
    Incomplete,

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown control packet type
    #[error("unknown packet type {0}")]
    Type(u8),

    /// Fixed header flags not allowed for the packet type
    #[error("invalid fixed header flags {0:#06b}")]
    Flags(u8),

    /// Remaining length is longer than four bytes
    #[error("malformed remaining length")]
    RemainingLength,

    /// Malformed packet body
    #[error("malformed packet")]
    Malformed,

    /// String field is not valid UTF-8
    #[error("invalid utf-8 string")]
    Utf8,

    /// Quality of service outside 0..=2
    #[error("invalid qos {0}")]
    Qos(u8),

    /// Topic name or filter violates the topic grammar
    #[error("invalid topic: {0}")]
    Topic(&'static str),

    /// Unknown CONNACK return code
    #[error("unknown return code {0}")]
    Code(u8),
}
