//! Error types for the protocol core.
//!
//! Most variants are protocol violations: a peer (or an attacker) sent
//! something malformed. The dispatcher drops the offending packet and, at
//! most, emits a trace — a violation from one peer must never damage state
//! belonging to another.

use ames_proto::{PacketError, Ship};
use thiserror::Error;

use crate::crypto::CryptoError;

/// Errors surfaced by the core state machines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmesError {
    /// Wire-level parse failure
    #[error(transparent)]
    Packet(#[from] PacketError),

    /// Sealing, opening, or attestation failure
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// A life tick in the header does not match the epoch we know
    #[error("life tick mismatch from {ship}: sent {sent}, expected {expected}")]
    TickMismatch {
        /// The peer whose packet failed the check
        ship: Ship,
        /// Tick carried in the header
        sent: u8,
        /// `life mod 16` for the epoch we believe current
        expected: u8,
    },

    /// Fragments of one message disagreed about the fragment count
    #[error("fragment count mismatch on message {num}: had {had}, got {got}")]
    FragmentCountMismatch {
        /// Message sequence number
        num: u32,
        /// Count from the first fragment heard
        had: u32,
        /// Count from the offending fragment
        got: u32,
    },

    /// A fragment index at or past the declared fragment count
    #[error("fragment index {index} out of range for {total}-fragment message")]
    FragmentOutOfRange {
        /// Offending index
        index: u32,
        /// Declared fragment count
        total: u32,
    },

    /// We have no private keys for our current life
    #[error("no private keys for life {0}")]
    NoPrivateKeys(u32),

    /// Task referenced a peer we have no state for
    #[error("no state for peer {0}")]
    UnknownPeer(Ship),
}
