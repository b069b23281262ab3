//! Packet content payloads.
//!
//! Two content classes exist on the wire. *Shut* content — everything
//! between keyed peers — is the AES-SIV seal of a CBOR [`ShutPayload`].
//! *Open* content is a comet's self-attestation: a detached Ed25519
//! signature followed by the CBOR [`Attestation`] it signs. The
//! discriminator is the packet's request flag plus the peers' key state,
//! decided in `ames-core`; this module only encodes and decodes.
//!
//! CBOR carries no variant tags beyond what serde derives: the payload
//! shape is fixed per class, and the crypto layer has already authenticated
//! the bytes before they are parsed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::{
    bone::Bone,
    errors::{PacketError, Result},
    ship::Ship,
};

/// Plaintext of a shut packet: one fragment or one acknowledgment,
/// addressed to a flow and a message within it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutPayload {
    /// Flow, in the *sender's* numbering; the receiver flips bit 0
    pub bone: Bone,
    /// Message sequence number within the flow
    pub num: u32,
    /// Fragment or acknowledgment
    pub meat: Meat,
}

/// The two kinds of shut-packet content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Meat {
    /// A slice of a message
    Fragment(Fragment),
    /// An acknowledgment
    Ack(Ack),
}

/// One slice of a message.
///
/// Every fragment of a message carries the same `total`, so fragment 0 is
/// not special on the wire — but a receiver treats the first `total` it
/// hears as authoritative and a later mismatch as a protocol violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    /// Number of fragments in the whole message
    pub total: u32,
    /// This fragment's index, `0 <= index < total`
    pub index: u32,
    /// The fragment's bytes (up to the fragment size, 1024)
    pub data: Bytes,
}

/// An acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ack {
    /// A single fragment arrived
    Fragment {
        /// Index of the fragment being acknowledged
        index: u32,
    },
    /// A whole message was processed by the receiving consumer
    Message {
        /// Positive (true) or negative (false) outcome
        ok: bool,
        /// Processing lag, microseconds, for the sender's bookkeeping
        lag_micros: u64,
    },
}

/// Number of bytes in a full fragment.
pub const FRAGMENT_SIZE: usize = 1024;

/// Encode a shut payload to CBOR plaintext (pre-encryption).
///
/// # Errors
///
/// Returns [`PacketError::Encode`] if CBOR serialization fails.
pub fn encode_shut(payload: &ShutPayload) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(payload, &mut buf)
        .map_err(|e| PacketError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode CBOR plaintext (post-decryption) into a shut payload.
///
/// # Errors
///
/// Returns [`PacketError::Decode`] if the bytes are not a valid payload.
pub fn decode_shut(bytes: &[u8]) -> Result<ShutPayload> {
    ciborium::de::from_reader(bytes).map_err(|e| PacketError::Decode(e.to_string()))
}

/// A request message, offered in order to the receiving peer's consumer.
///
/// This is the reassembled body of a forward-flow message: the target
/// subsystem tag, a routing path within it, and an opaque payload the
/// transport never interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plea {
    /// Target subsystem on the receiving peer
    pub vane: String,
    /// Routing path within the subsystem
    pub path: Vec<String>,
    /// Opaque request payload
    pub payload: Bytes,
}

/// Why a consumer refused a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NackTrace {
    /// Short machine-readable tag
    pub tag: String,
    /// Human-readable trace lines
    pub notes: Vec<String>,
}

/// Body of a message on a nack-trace flow: which message on the paired
/// forward flow failed, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Naxplanation {
    /// Message number on the paired forward flow
    pub num: u32,
    /// The consumer's failure report
    pub error: NackTrace,
}

/// Encode a message body (a [`Plea`], a [`Naxplanation`], or any response
/// payload) to the CBOR blob that gets fragmented onto the wire.
///
/// # Errors
///
/// Returns [`PacketError::Encode`] if CBOR serialization fails.
pub fn encode_body<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| PacketError::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a reassembled message blob back into its body type.
///
/// # Errors
///
/// Returns [`PacketError::Decode`] if the blob is not valid CBOR for `T`.
pub fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::de::from_reader(bytes).map_err(|e| PacketError::Decode(e.to_string()))
}

/// A comet's claim of identity: its key, who it is, and who it is talking
/// to. Lives are included so the attestation cannot be replayed to a peer
/// in a later epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// The comet's signing key; together with the exchange key it hashes
    /// to the comet's address
    pub sign_key: [u8; 32],
    /// The comet's key-exchange key
    pub exchange_key: [u8; 32],
    /// The attesting comet
    pub sndr: Ship,
    /// A comet's life is always 1
    pub sndr_life: u32,
    /// The ship being attested to
    pub rcvr: Ship,
    /// The receiver's life as the comet knows it
    pub rcvr_life: u32,
}

impl Attestation {
    /// The bytes a comet signs: the CBOR encoding of the attestation.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Encode`] if CBOR serialization fails.
    pub fn signed_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)
            .map_err(|e| PacketError::Encode(e.to_string()))?;
        Ok(buf)
    }
}

/// Cleartext content of an open packet: detached signature, then the
/// attestation it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPacket {
    /// Ed25519 signature over [`Attestation::signed_bytes`]
    pub signature: [u8; 64],
    /// The signed attestation
    pub attestation: Attestation,
}

impl OpenPacket {
    /// Encode: 64 signature bytes followed by the attestation CBOR.
    ///
    /// The signature is framed by position rather than inside the CBOR so
    /// that the signed bytes and the transmitted attestation bytes are one
    /// and the same.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::Encode`] if CBOR serialization fails.
    pub fn encode(&self) -> Result<Bytes> {
        let body = self.attestation.signed_bytes()?;
        let mut buf = Vec::with_capacity(64 + body.len());
        buf.extend_from_slice(&self.signature);
        buf.extend_from_slice(&body);
        Ok(Bytes::from(buf))
    }

    /// Decode an open packet's content.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::SignatureTruncated`] when shorter than a
    /// signature, or [`PacketError::Decode`] for malformed attestation CBOR.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 64 {
            return Err(PacketError::SignatureTruncated(bytes.len()));
        }
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&bytes[..64]);
        let attestation = ciborium::de::from_reader(&bytes[64..])
            .map_err(|e| PacketError::Decode(e.to_string()))?;
        Ok(Self {
            signature,
            attestation,
        })
    }
}
