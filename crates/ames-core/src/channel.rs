//! The per-event identity view.
//!
//! A [`Channel`] joins our identity (ship, life) with one peer's identity
//! (ship, life, rift) and the symmetric key the two share. It is computed
//! at the top of each event from the transport's state and the peer's PKI
//! fields, threaded through the flow handlers, and dropped when the event
//! completes — it is never stored, so persisted state carries no redundant
//! cryptographic material.

use ames_proto::{payload, Packet, Ship, ShutPayload};

use crate::{
    crypto::{associated_data, SymmetricKey},
    error::AmesError,
};

/// Transient view of one peer relationship, valid for a single event.
#[derive(Clone)]
pub struct Channel {
    /// Our ship
    pub we: Ship,
    /// Our current key epoch
    pub our_life: u32,
    /// The peer
    pub them: Ship,
    /// The peer's key epoch as we know it
    pub her_life: u32,
    /// The peer's continuity epoch as we know it
    pub her_rift: u32,
    /// Symmetric key shared for this pair of epochs
    pub key: SymmetricKey,
}

impl Channel {
    /// Seal a shut payload into an outbound packet.
    ///
    /// The request flag mirrors the meat: fragments travel as requests,
    /// acks as acknowledgments.
    ///
    /// # Errors
    ///
    /// Returns an [`AmesError`] if payload encoding or sealing fails.
    pub fn seal(&self, payload: &ShutPayload) -> Result<Packet, AmesError> {
        let request = matches!(payload.meat, ames_proto::Meat::Fragment(_));
        let plaintext = payload::encode_shut(payload)?;
        let aad = associated_data(self.we, self.them, self.our_life, self.her_life);
        let content = self.key.seal(&aad, &plaintext)?;

        Ok(Packet {
            sndr: self.we,
            rcvr: self.them,
            request,
            sndr_tick: (self.our_life % 16) as u8,
            rcvr_tick: (self.her_life % 16) as u8,
            origin: None,
            content: content.into(),
        })
    }

    /// Open an inbound shut packet from this peer.
    ///
    /// Checks the life ticks first: a stale tick means the sender is using
    /// a key epoch we no longer (or do not yet) agree on, and the packet
    /// cannot possibly open, so it is rejected before any crypto runs.
    ///
    /// # Errors
    ///
    /// Returns [`AmesError::TickMismatch`] on a tick disagreement, or a
    /// crypto/codec error for unopenable or malformed content.
    pub fn open(&self, packet: &Packet) -> Result<ShutPayload, AmesError> {
        let her_tick = (self.her_life % 16) as u8;
        let our_tick = (self.our_life % 16) as u8;
        if packet.sndr_tick != her_tick {
            return Err(AmesError::TickMismatch {
                ship: self.them,
                sent: packet.sndr_tick,
                expected: her_tick,
            });
        }
        if packet.rcvr_tick != our_tick {
            return Err(AmesError::TickMismatch {
                ship: self.them,
                sent: packet.rcvr_tick,
                expected: our_tick,
            });
        }

        let aad = associated_data(self.them, self.we, self.her_life, self.our_life);
        let plaintext = self.key.open(&aad, &packet.content)?;
        Ok(payload::decode_shut(&plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use ames_proto::{Ack, Bone, Meat};

    use super::*;
    use crate::crypto::KeyPair;

    fn channels() -> (Channel, Channel) {
        let a = KeyPair::from_seed([1; 32]);
        let b = KeyPair::from_seed([2; 32]);
        let key = a.shared_key(&b.public());

        let ab = Channel {
            we: Ship(0x100),
            our_life: 3,
            them: Ship(0x200),
            her_life: 5,
            her_rift: 0,
            key: key.clone(),
        };
        let ba = Channel {
            we: Ship(0x200),
            our_life: 5,
            them: Ship(0x100),
            her_life: 3,
            her_rift: 0,
            key,
        };
        (ab, ba)
    }

    #[test]
    fn seal_open_round_trip() {
        let (ab, ba) = channels();
        let payload = ShutPayload {
            bone: Bone(4),
            num: 9,
            meat: Meat::Ack(Ack::Fragment { index: 2 }),
        };

        let packet = ab.seal(&payload).unwrap();
        assert!(!packet.request);
        assert_eq!(packet.sndr_tick, 3);
        assert_eq!(packet.rcvr_tick, 5);
        assert_eq!(ba.open(&packet).unwrap(), payload);
    }

    #[test]
    fn stale_tick_is_rejected_before_crypto() {
        let (ab, mut ba) = channels();
        let payload = ShutPayload {
            bone: Bone(0),
            num: 0,
            meat: Meat::Ack(Ack::Fragment { index: 0 }),
        };
        let packet = ab.seal(&payload).unwrap();

        // receiver thinks the sender has rekeyed
        ba.her_life = 4;
        assert!(matches!(
            ba.open(&packet),
            Err(AmesError::TickMismatch { sent: 3, expected: 4, .. })
        ));
    }

    #[test]
    fn cross_epoch_ciphertext_does_not_open() {
        let (ab, mut ba) = channels();
        let payload = ShutPayload {
            bone: Bone(0),
            num: 0,
            meat: Meat::Ack(Ack::Fragment { index: 0 }),
        };
        let packet = ab.seal(&payload).unwrap();

        // same tick residue (3 + 16), different full life: the tick check
        // passes but the associated data no longer matches
        ba.her_life = 19;
        assert!(matches!(
            ba.open(&packet),
            Err(AmesError::Crypto(crate::crypto::CryptoError::OpenFailed))
        ));
    }
}
