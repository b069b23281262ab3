//! Flow identifiers.
//!
//! A bone names one bidirectional flow between two peers. The two low bits
//! carry the flow's class; everything above them is an opaque counter
//! handed out by the peer's ossuary (which advances by four so the class
//! bits stay free).
//!
//! Bit 0 is polarity: 0 means the flow carries requests away from the bone's
//! allocator, 1 means it carries responses back. The two peers see the same
//! flow with opposite polarity, so bit 0 is flipped on receipt. Bit 1 marks
//! the nack-trace twin of an even bone: failure explanations for messages on
//! bone `b` travel as ordinary messages on bone `b ^ 0b10`.

use serde::{Deserialize, Serialize};

/// Per-peer flow identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Bone(pub u32);

impl Bone {
    /// True for forward (request-carrying) flows.
    #[must_use]
    pub const fn is_forward(self) -> bool {
        self.0 & 1 == 0
    }

    /// True for backward (response-carrying) flows.
    #[must_use]
    pub const fn is_backward(self) -> bool {
        self.0 & 1 == 1
    }

    /// True for the nack-trace twin of a forward flow.
    #[must_use]
    pub const fn is_nack_trace(self) -> bool {
        self.0 & 0b11 == 0b10
    }

    /// The nack-trace twin of this bone (and vice versa).
    ///
    /// Only meaningful for even bones; the mapping is an involution.
    #[must_use]
    pub const fn paired_trace(self) -> Bone {
        Bone(self.0 ^ 0b10)
    }

    /// The same flow as seen from the other side of the wire.
    #[must_use]
    pub const fn flipped(self) -> Bone {
        Bone(self.0 ^ 0b1)
    }
}

impl std::fmt::Debug for Bone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bone({})", self.0)
    }
}
