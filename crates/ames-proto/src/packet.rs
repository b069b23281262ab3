//! Packet framing and network lanes.
//!
//! A packet is the header word, the two ships at their class-determined
//! widths (little-endian, low bytes first), an optional 6-byte origin
//! breadcrumb, and the content. Content is opaque at this layer: ciphertext
//! for shut packets, a detached signature plus attestation for open ones.

use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{
    errors::{PacketError, Result},
    header::PacketHeader,
    ship::{wire_len_for_class, Ship},
};

/// A network-layer address.
///
/// Either a galaxy reference — the runtime resolves galaxies to addresses
/// out of band — or opaque bytes the runtime hands back to the socket layer
/// unchanged (conventionally a 6-byte IPv4 address + port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    /// Resolved by the runtime from the galaxy's well-known name
    Galaxy(Ship),
    /// Opaque network address, round-tripped verbatim
    Opaque(Bytes),
}

impl Lane {
    /// Convenience constructor for an IPv4 lane.
    #[must_use]
    pub fn ipv4(addr: SocketAddrV4) -> Self {
        let mut bytes = BytesMut::with_capacity(6);
        bytes.put_slice(&addr.ip().octets());
        bytes.put_u16(addr.port());
        Lane::Opaque(bytes.freeze())
    }

    /// The forwarding breadcrumb for this lane, if it has one.
    ///
    /// Galaxy lanes have none: a relay never needs to tell the receiver how
    /// to reach a galaxy, and galaxy senders are not stamped at all.
    #[must_use]
    pub fn origin(&self) -> Option<Origin> {
        match self {
            Lane::Galaxy(_) => None,
            Lane::Opaque(bytes) => {
                if bytes.len() == Origin::SIZE {
                    let mut origin = [0u8; Origin::SIZE];
                    origin.copy_from_slice(bytes);
                    Some(Origin(origin))
                } else {
                    None
                }
            },
        }
    }
}

/// Forwarding breadcrumb: the lane a relayed packet arrived on.
///
/// Six bytes, an IPv4 address and port. Receivers use it to answer the
/// originator directly instead of back through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin(pub [u8; 6]);

impl Origin {
    /// Wire size of an origin field.
    pub const SIZE: usize = 6;

    /// The lane this breadcrumb denotes.
    #[must_use]
    pub fn lane(&self) -> Lane {
        Lane::Opaque(Bytes::copy_from_slice(&self.0))
    }

    /// View as an IPv4 socket address.
    #[must_use]
    pub fn to_socket_addr(self) -> SocketAddrV4 {
        let ip = Ipv4Addr::new(self.0[0], self.0[1], self.0[2], self.0[3]);
        let port = u16::from_be_bytes([self.0[4], self.0[5]]);
        SocketAddrV4::new(ip, port)
    }
}

/// A decoded packet: addressing, ticks, optional origin, opaque content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Sending ship
    pub sndr: Ship,
    /// Receiving ship
    pub rcvr: Ship,
    /// Request (true) or acknowledgment (false)
    pub request: bool,
    /// Sender's life mod 16
    pub sndr_tick: u8,
    /// Receiver's life mod 16
    pub rcvr_tick: u8,
    /// Forwarding breadcrumb, set by the first relay
    pub origin: Option<Origin>,
    /// Opaque content (ciphertext or signed attestation)
    pub content: Bytes,
}

impl Packet {
    /// Encode to wire bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let header = PacketHeader {
            request: self.request,
            sndr_class: self.sndr.size_class(),
            rcvr_class: self.rcvr.size_class(),
            sndr_tick: self.sndr_tick & 0xf,
            rcvr_tick: self.rcvr_tick & 0xf,
            relayed: self.origin.is_some(),
        };

        let mut buf = BytesMut::with_capacity(
            PacketHeader::SIZE
                + self.sndr.wire_len()
                + self.rcvr.wire_len()
                + self.origin.map_or(0, |_| Origin::SIZE)
                + self.content.len(),
        );

        buf.put_u32_le(header.pack());
        buf.put_slice(&self.sndr.0.to_le_bytes()[..self.sndr.wire_len()]);
        buf.put_slice(&self.rcvr.0.to_le_bytes()[..self.rcvr.wire_len()]);
        if let Some(origin) = self.origin {
            buf.put_slice(&origin.0);
        }
        buf.put_slice(&self.content);
        buf.freeze()
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// Returns a [`PacketError`] for truncated buffers, reserved header
    /// bits, or a clear sample flag. The remainder of the buffer past the
    /// fixed fields is the content; it is not interpreted here.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut buf = bytes;

        if buf.remaining() < PacketHeader::SIZE {
            return Err(PacketError::Truncated {
                need: PacketHeader::SIZE,
                got: buf.remaining(),
            });
        }
        let header = PacketHeader::unpack(buf.get_u32_le())?;

        let sndr = take_ship(&mut buf, header.sndr_class)?;
        let rcvr = take_ship(&mut buf, header.rcvr_class)?;

        let origin = if header.relayed {
            if buf.remaining() < Origin::SIZE {
                return Err(PacketError::OriginTruncated);
            }
            let mut origin = [0u8; Origin::SIZE];
            buf.copy_to_slice(&mut origin);
            Some(Origin(origin))
        } else {
            None
        };

        Ok(Self {
            sndr,
            rcvr,
            request: header.request,
            sndr_tick: header.sndr_tick,
            rcvr_tick: header.rcvr_tick,
            origin,
            content: Bytes::copy_from_slice(buf),
        })
    }
}

fn take_ship(buf: &mut &[u8], class: u8) -> Result<Ship> {
    let len = wire_len_for_class(class);
    if buf.remaining() < len {
        return Err(PacketError::Truncated {
            need: len,
            got: buf.remaining(),
        });
    }
    let mut wide = [0u8; 16];
    buf.copy_to_slice(&mut wide[..len]);
    Ok(Ship(u128::from_le_bytes(wide)))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn ship_strategy() -> impl Strategy<Value = Ship> {
        any::<u128>().prop_map(Ship)
    }

    #[test]
    fn encode_known_layout() {
        let packet = Packet {
            sndr: Ship(0x1234),
            rcvr: Ship(0xdead_beef),
            request: true,
            sndr_tick: 2,
            rcvr_tick: 7,
            origin: Some(Origin([127, 0, 0, 1, 0x30, 0x39])),
            content: Bytes::from_static(b"hi"),
        };

        let wire = packet.encode();
        // 4 header + 2 sndr + 4 rcvr + 6 origin + 2 content
        assert_eq!(wire.len(), 18);
        // ships are little-endian, low bytes first
        assert_eq!(&wire[4..6], &[0x34, 0x12]);
        assert_eq!(&wire[6..10], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(&wire[10..16], &[127, 0, 0, 1, 0x30, 0x39]);
        assert_eq!(&wire[16..], b"hi");

        assert_eq!(Packet::decode(&wire).unwrap(), packet);
    }

    #[test]
    fn origin_socket_addr_round_trip() {
        let origin = Origin([10, 0, 0, 7, 0x1f, 0x90]);
        let addr = origin.to_socket_addr();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 7), 8080));
        assert_eq!(Lane::ipv4(addr).origin(), Some(origin));
    }

    #[test]
    fn galaxy_lane_has_no_origin() {
        assert_eq!(Lane::Galaxy(Ship(0x7)).origin(), None);
    }

    #[test]
    fn reject_truncated_ship() {
        let packet = Packet {
            sndr: Ship(u128::MAX),
            rcvr: Ship(3),
            request: false,
            sndr_tick: 0,
            rcvr_tick: 0,
            origin: None,
            content: Bytes::new(),
        };
        let wire = packet.encode();
        let result = Packet::decode(&wire[..8]);
        assert!(matches!(result, Err(PacketError::Truncated { .. })));
    }

    #[test]
    fn reject_truncated_origin() {
        let packet = Packet {
            sndr: Ship(1),
            rcvr: Ship(2),
            request: true,
            sndr_tick: 0,
            rcvr_tick: 0,
            origin: Some(Origin([1, 2, 3, 4, 5, 6])),
            content: Bytes::new(),
        };
        let wire = packet.encode();
        // cut inside the origin field
        let result = Packet::decode(&wire[..wire.len() - 4]);
        assert!(matches!(result, Err(PacketError::OriginTruncated)));
    }

    proptest! {
        #[test]
        fn packet_round_trip(
            sndr in ship_strategy(),
            rcvr in ship_strategy(),
            request in any::<bool>(),
            sndr_tick in 0u8..16,
            rcvr_tick in 0u8..16,
            origin in proptest::option::of(any::<[u8; 6]>().prop_map(Origin)),
            content in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let packet = Packet {
                sndr, rcvr, request, sndr_tick, rcvr_tick, origin,
                content: Bytes::from(content),
            };
            prop_assert_eq!(Packet::decode(&packet.encode()).unwrap(), packet);
        }
    }
}
