//! Wire types for the Ames transport.
//!
//! This crate contains everything that crosses the network or names a flow
//! on the wire: ship identifiers, bones, the bit-packed packet header,
//! packet framing, and the CBOR payload codec. It has no protocol state and
//! performs no cryptography — sealing and opening of shut packets lives in
//! `ames-core`, which operates on the types defined here.
//!
//! # Wire contract
//!
//! The packet header is a single little-endian `u32` whose bit positions
//! are fixed (see [`header`]). Payload bodies are CBOR. Both are exercised
//! by round-trip properties in each module.

pub mod bone;
pub mod errors;
pub mod header;
pub mod packet;
pub mod payload;
pub mod ship;

pub use bone::Bone;
pub use errors::{PacketError, Result};
pub use header::PacketHeader;
pub use packet::{Lane, Origin, Packet};
pub use payload::{
    Ack, Attestation, Fragment, Meat, NackTrace, Naxplanation, OpenPacket, Plea, ShutPayload,
    FRAGMENT_SIZE,
};
pub use ship::{Rank, Ship};
