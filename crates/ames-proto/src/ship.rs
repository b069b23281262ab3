//! Ship identifiers and their address-space classes.
//!
//! A ship is an opaque 128-bit identity. Its *rank* is derived purely from
//! bit-width: the low end of the space belongs to galaxies (well-known
//! top-level routers) and each wider band belongs to the next class down
//! the sponsorship hierarchy. Comets occupy the top half of the space and
//! are self-signed — a comet's address is the fingerprint of its key, so
//! knowing the address is knowing how to authenticate the peer.

use serde::{Deserialize, Serialize};

/// A 128-bit ship identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ship(pub u128);

/// Address class of a ship, derived from its bit-width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rank {
    /// 8-bit: top-level router with a well-known address
    Galaxy,
    /// 16-bit: galaxy child, may sponsor planets and comets
    Star,
    /// 32-bit: ordinary identity
    Planet,
    /// 64-bit: subordinate identity under a planet
    Moon,
    /// 128-bit: self-signed ephemeral identity (address = key fingerprint)
    Comet,
}

impl Ship {
    /// Address class, a pure function of bit-width.
    #[must_use]
    pub const fn rank(self) -> Rank {
        match self.0 {
            0..=0xff => Rank::Galaxy,
            0x100..=0xffff => Rank::Star,
            0x1_0000..=0xffff_ffff => Rank::Planet,
            0x1_0000_0000..=0xffff_ffff_ffff_ffff => Rank::Moon,
            _ => Rank::Comet,
        }
    }

    /// Wire size class: two header bits selecting 2, 4, 8 or 16 bytes.
    #[must_use]
    pub const fn size_class(self) -> u8 {
        match self.rank() {
            Rank::Galaxy | Rank::Star => 0,
            Rank::Planet => 1,
            Rank::Moon => 2,
            Rank::Comet => 3,
        }
    }

    /// Number of bytes this ship occupies on the wire.
    #[must_use]
    pub const fn wire_len(self) -> usize {
        wire_len_for_class(self.size_class())
    }

    /// Direct sponsor of this ship.
    ///
    /// Moons truncate to their planet, planets to their star, stars to
    /// their galaxy. Comets truncate to their low 16 bits — only stars may
    /// sponsor comets. A galaxy is its own sponsor (chain fixpoint).
    #[must_use]
    pub const fn parent(self) -> Ship {
        match self.rank() {
            Rank::Galaxy => self,
            Rank::Star => Ship(self.0 & 0xff),
            Rank::Planet | Rank::Comet => Ship(self.0 & 0xff_ff),
            Rank::Moon => Ship(self.0 & 0xffff_ffff),
        }
    }

    /// Sponsorship chain from this ship up to (and including) its galaxy.
    #[must_use]
    pub fn sponsor_chain(self) -> Vec<Ship> {
        let mut chain = vec![self];
        let mut cursor = self;
        while cursor.rank() != Rank::Galaxy {
            cursor = cursor.parent();
            chain.push(cursor);
        }
        chain
    }
}

/// Wire byte length for a 2-bit size class.
#[must_use]
pub const fn wire_len_for_class(class: u8) -> usize {
    2 << (class & 0b11)
}

impl std::fmt::Debug for Ship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ship({:#x})", self.0)
    }
}

impl std::fmt::Display for Ship {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "~{:x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_bands() {
        assert_eq!(Ship(0).rank(), Rank::Galaxy);
        assert_eq!(Ship(0xff).rank(), Rank::Galaxy);
        assert_eq!(Ship(0x100).rank(), Rank::Star);
        assert_eq!(Ship(0xffff).rank(), Rank::Star);
        assert_eq!(Ship(0x1_0000).rank(), Rank::Planet);
        assert_eq!(Ship(0xffff_ffff).rank(), Rank::Planet);
        assert_eq!(Ship(0x1_0000_0000).rank(), Rank::Moon);
        assert_eq!(Ship(u64::MAX as u128).rank(), Rank::Moon);
        assert_eq!(Ship(u64::MAX as u128 + 1).rank(), Rank::Comet);
        assert_eq!(Ship(u128::MAX).rank(), Rank::Comet);
    }

    #[test]
    fn wire_lengths() {
        assert_eq!(Ship(0x05).wire_len(), 2);
        assert_eq!(Ship(0x1234).wire_len(), 2);
        assert_eq!(Ship(0xdead_beef).wire_len(), 4);
        assert_eq!(Ship(0x1234_5678_9abc_def0).wire_len(), 8);
        assert_eq!(Ship(u128::MAX).wire_len(), 16);
    }

    #[test]
    fn parent_truncates_down_the_hierarchy() {
        let moon = Ship(0xaaaa_bbbb_dead_beef);
        let planet = moon.parent();
        assert_eq!(planet, Ship(0xdead_beef));
        assert_eq!(planet.rank(), Rank::Planet);

        let star = planet.parent();
        assert_eq!(star, Ship(0xbeef));
        assert_eq!(star.rank(), Rank::Star);

        let galaxy = star.parent();
        assert_eq!(galaxy, Ship(0xef));
        assert_eq!(galaxy.rank(), Rank::Galaxy);
        assert_eq!(galaxy.parent(), galaxy);
    }

    #[test]
    fn comet_parent_is_a_star() {
        let comet = Ship(0x1234_5678_9abc_def0_1111_2222_3333_4444);
        let parent = comet.parent();
        assert_eq!(parent, Ship(0x4444));
        assert_eq!(parent.rank(), Rank::Star);
    }

    #[test]
    fn sponsor_chain_ends_at_galaxy() {
        let moon = Ship(0xaaaa_bbbb_dead_beef);
        let chain = moon.sponsor_chain();
        assert_eq!(
            chain,
            vec![moon, Ship(0xdead_beef), Ship(0xbeef), Ship(0xef)]
        );
    }
}
