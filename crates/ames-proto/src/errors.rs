//! Error types for packet parsing and payload codec failures.
//!
//! Every malformed input maps to a typed variant so callers can decide
//! whether to drop silently (protocol noise) or surface a trace.

use thiserror::Error;

/// Errors produced while encoding or decoding wire data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer ends before the structure it claims to contain
    #[error("packet truncated: need {need} bytes, got {got}")]
    Truncated {
        /// Bytes required to finish parsing
        need: usize,
        /// Bytes actually available
        got: usize,
    },

    /// Reserved header bits were set
    #[error("reserved header bits set: {0:#010x}")]
    ReservedBits(u32),

    /// The sample flag was clear; we only speak the sampled protocol
    #[error("sample flag clear")]
    NotSample,

    /// Header declared an origin but none was present
    #[error("origin declared but truncated")]
    OriginTruncated,

    /// CBOR encoding failed
    #[error("failed to encode cbor: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("failed to decode cbor: {0}")]
    Decode(String),

    /// Open-packet content shorter than a detached signature
    #[error("open packet too short for signature: {0} bytes")]
    SignatureTruncated(usize),
}

/// Convenient Result alias for wire operations
pub type Result<T> = std::result::Result<T, PacketError>;
