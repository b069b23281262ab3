//! The bit-packed packet header.
//!
//! Every packet begins with one little-endian `u32`, packed low-to-high:
//!
//! | bits  | field                                  |
//! |-------|----------------------------------------|
//! | 0–2   | reserved, must be zero                 |
//! | 3     | request flag (1 = request, 0 = ack)    |
//! | 4     | sample flag, always 1                  |
//! | 5–6   | sender size class                      |
//! | 7–8   | receiver size class                    |
//! | 9–12  | sender life tick (life mod 16)         |
//! | 13–16 | receiver life tick                     |
//! | 17    | origin present                         |
//! | 18–31 | zero                                   |
//!
//! These positions are the wire contract; changing them breaks
//! interoperability with every deployed node. The life ticks are a cheap
//! anti-replay check — four bits of each side's key epoch — and are also
//! bound, at full width, into the ciphertext's associated data.

use crate::errors::{PacketError, Result};

const REQUEST_BIT: u32 = 3;
const SAMPLE_BIT: u32 = 4;
const SNDR_CLASS_SHIFT: u32 = 5;
const RCVR_CLASS_SHIFT: u32 = 7;
const SNDR_TICK_SHIFT: u32 = 9;
const RCVR_TICK_SHIFT: u32 = 13;
const RELAYED_BIT: u32 = 17;

/// Bits that must be zero: 0–2 and 18–31.
const RESERVED_MASK: u32 = 0b0000_0111 | !((1 << 18) - 1);

/// Decoded packet header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Request (1) or acknowledgment (0)
    pub request: bool,
    /// Sender ship size class (2 bits)
    pub sndr_class: u8,
    /// Receiver ship size class (2 bits)
    pub rcvr_class: u8,
    /// Sender's life mod 16
    pub sndr_tick: u8,
    /// Receiver's life mod 16
    pub rcvr_tick: u8,
    /// Whether a 6-byte origin follows the ships
    pub relayed: bool,
}

impl PacketHeader {
    /// Serialized length of the header word.
    pub const SIZE: usize = 4;

    /// Pack into the wire word. The sample flag is always set.
    #[must_use]
    pub fn pack(&self) -> u32 {
        let mut word = 1 << SAMPLE_BIT;
        word |= u32::from(self.request) << REQUEST_BIT;
        word |= u32::from(self.sndr_class & 0b11) << SNDR_CLASS_SHIFT;
        word |= u32::from(self.rcvr_class & 0b11) << RCVR_CLASS_SHIFT;
        word |= u32::from(self.sndr_tick & 0xf) << SNDR_TICK_SHIFT;
        word |= u32::from(self.rcvr_tick & 0xf) << RCVR_TICK_SHIFT;
        word |= u32::from(self.relayed) << RELAYED_BIT;
        word
    }

    /// Unpack a wire word.
    ///
    /// # Errors
    ///
    /// Rejects words with reserved bits set or the sample flag clear; both
    /// indicate a different protocol (or garbage) and the packet must be
    /// dropped without further parsing.
    pub fn unpack(word: u32) -> Result<Self> {
        if word & RESERVED_MASK != 0 {
            return Err(PacketError::ReservedBits(word));
        }
        if word & (1 << SAMPLE_BIT) == 0 {
            return Err(PacketError::NotSample);
        }

        Ok(Self {
            request: word & (1 << REQUEST_BIT) != 0,
            sndr_class: ((word >> SNDR_CLASS_SHIFT) & 0b11) as u8,
            rcvr_class: ((word >> RCVR_CLASS_SHIFT) & 0b11) as u8,
            sndr_tick: ((word >> SNDR_TICK_SHIFT) & 0xf) as u8,
            rcvr_tick: ((word >> RCVR_TICK_SHIFT) & 0xf) as u8,
            relayed: word & (1 << RELAYED_BIT) != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn known_word() {
        let header = PacketHeader {
            request: true,
            sndr_class: 1,
            rcvr_class: 0,
            sndr_tick: 0xa,
            rcvr_tick: 0x3,
            relayed: false,
        };
        // sample | request | class 1 at bit 5 | tick 0xa at bit 9 | tick 0x3 at bit 13
        let expected: u32 = (1 << 4) | (1 << 3) | (1 << 5) | (0xa << 9) | (0x3 << 13);
        assert_eq!(header.pack(), expected);
        assert_eq!(PacketHeader::unpack(expected).unwrap(), header);
    }

    #[test]
    fn reject_reserved_bits() {
        let word = PacketHeader {
            request: false,
            sndr_class: 0,
            rcvr_class: 0,
            sndr_tick: 0,
            rcvr_tick: 0,
            relayed: false,
        }
        .pack();

        assert_eq!(
            PacketHeader::unpack(word | 0b1),
            Err(PacketError::ReservedBits(word | 0b1))
        );
        assert_eq!(
            PacketHeader::unpack(word | (1 << 31)),
            Err(PacketError::ReservedBits(word | (1 << 31)))
        );
    }

    #[test]
    fn reject_sample_clear() {
        assert_eq!(PacketHeader::unpack(0), Err(PacketError::NotSample));
    }

    proptest! {
        #[test]
        fn header_round_trip(
            request in any::<bool>(),
            sndr_class in 0u8..4,
            rcvr_class in 0u8..4,
            sndr_tick in 0u8..16,
            rcvr_tick in 0u8..16,
            relayed in any::<bool>(),
        ) {
            let header = PacketHeader {
                request, sndr_class, rcvr_class, sndr_tick, rcvr_tick, relayed,
            };
            prop_assert_eq!(PacketHeader::unpack(header.pack()).unwrap(), header);
        }
    }
}
