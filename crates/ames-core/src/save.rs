//! Versioned persistence.
//!
//! A snapshot captures everything needed to resume the transport after a
//! process restart: our identity and seeds, the debug toggles, and for
//! each known peer its PKI fields, route, ossuary, nax set, subscriber
//! set, and per-flow watermarks and queues. Not captured, on purpose:
//!
//! - In-flight packet timing. `Instant`s do not survive a restart; unacked
//!   messages are folded into the unsent queues, retransmitted after
//!   restore, and deduplicated by the receiving sinks as usual.
//! - Partial reassemblies. The sender retransmits whatever was never
//!   acked.
//! - Alien agendas and QoS observations, both of which regenerate from
//!   traffic.
//!
//! The on-disk form is a versioned enum. Old snapshots are carried
//! forward by the migration ladder: one transform per version step,
//! composed in order, so a `V1` file loads exactly as if it had been
//! written yesterday.

use ames_proto::{Bone, Lane, PacketError, Ship};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::PublicKeys,
    error::AmesError,
    pump::PumpSnapshot,
    sink::SinkSnapshot,
    task::{Duct, Verbosity},
};

/// A persisted transport state, any version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SavedState {
    /// Original snapshot layout: no liveness subscribers, no debug ship
    /// filter
    V1(StateV1),
    /// Current layout
    V2(StateV2),
}

impl SavedState {
    /// Bring any version up to current by composing the per-version
    /// transforms.
    #[must_use]
    pub fn migrate(self) -> StateV2 {
        match self {
            SavedState::V1(v1) => migrate_v1(v1),
            SavedState::V2(v2) => v2,
        }
    }
}

/// Saved route, mirroring [`crate::peer::Route`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRoute {
    /// Heard from the peer itself
    pub direct: bool,
    /// Lane to transmit on
    pub lane: Lane,
}

/// Current snapshot layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateV2 {
    /// Our ship
    pub us: Ship,
    /// Our key epoch
    pub life: u32,
    /// Our continuity epoch
    pub rift: u32,
    /// Key seed per life
    pub seeds: Vec<(u32, [u8; 32])>,
    /// Debug verbosity toggles
    pub verbosity: Verbosity,
    /// Debug ship filter
    pub sift: Vec<Ship>,
    /// Galaxy DNS domains
    pub domains: Vec<String>,
    /// Duct registered at birth for host-level notifications
    pub unix_duct: Option<Duct>,
    /// Every known peer
    pub peers: Vec<SavedPeer>,
}

/// One known peer in a current snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPeer {
    /// The peer's ship
    pub ship: Ship,
    /// Key epoch
    pub life: u32,
    /// Continuity epoch
    pub rift: u32,
    /// Published keys
    pub keys: PublicKeys,
    /// Sponsor
    pub sponsor: Ship,
    /// Best-known route
    pub route: Option<SavedRoute>,
    /// Duct ↔ bone allocations
    pub ossuary: Vec<(Duct, Bone)>,
    /// Next bone the ossuary will allocate
    pub next_bone: u32,
    /// Nacked messages awaiting drop acknowledgement
    pub nax: Vec<(Bone, u32)>,
    /// Liveness subscribers
    pub heeds: Vec<Duct>,
    /// Outbound flows
    pub snd: Vec<(Bone, PumpSnapshot)>,
    /// Inbound flows
    pub rcv: Vec<(Bone, SinkSnapshot)>,
}

/// Original snapshot layout, before liveness subscriptions and the debug
/// ship filter existed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateV1 {
    /// Our ship
    pub us: Ship,
    /// Our key epoch
    pub life: u32,
    /// Our continuity epoch
    pub rift: u32,
    /// Key seed per life
    pub seeds: Vec<(u32, [u8; 32])>,
    /// Debug verbosity toggles
    pub verbosity: Verbosity,
    /// Galaxy DNS domains
    pub domains: Vec<String>,
    /// Duct registered at birth for host-level notifications
    pub unix_duct: Option<Duct>,
    /// Every known peer
    pub peers: Vec<SavedPeerV1>,
}

/// One known peer in a V1 snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedPeerV1 {
    /// The peer's ship
    pub ship: Ship,
    /// Key epoch
    pub life: u32,
    /// Continuity epoch
    pub rift: u32,
    /// Published keys
    pub keys: PublicKeys,
    /// Sponsor
    pub sponsor: Ship,
    /// Best-known route
    pub route: Option<SavedRoute>,
    /// Duct ↔ bone allocations
    pub ossuary: Vec<(Duct, Bone)>,
    /// Next bone the ossuary will allocate
    pub next_bone: u32,
    /// Nacked messages awaiting drop acknowledgement
    pub nax: Vec<(Bone, u32)>,
    /// Outbound flows
    pub snd: Vec<(Bone, PumpSnapshot)>,
    /// Inbound flows
    pub rcv: Vec<(Bone, SinkSnapshot)>,
}

/// V1 → V2: subscriber sets and the ship filter start empty.
fn migrate_v1(v1: StateV1) -> StateV2 {
    StateV2 {
        us: v1.us,
        life: v1.life,
        rift: v1.rift,
        seeds: v1.seeds,
        verbosity: v1.verbosity,
        sift: Vec::new(),
        domains: v1.domains,
        unix_duct: v1.unix_duct,
        peers: v1
            .peers
            .into_iter()
            .map(|peer| SavedPeer {
                ship: peer.ship,
                life: peer.life,
                rift: peer.rift,
                keys: peer.keys,
                sponsor: peer.sponsor,
                route: peer.route,
                ossuary: peer.ossuary,
                next_bone: peer.next_bone,
                nax: peer.nax,
                heeds: Vec::new(),
                snd: peer.snd,
                rcv: peer.rcv,
            })
            .collect(),
    }
}

/// Serialize a snapshot to CBOR.
///
/// # Errors
///
/// Returns an [`AmesError`] if CBOR serialization fails.
pub fn encode(state: &SavedState) -> Result<Vec<u8>, AmesError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(state, &mut buf)
        .map_err(|e| AmesError::Packet(PacketError::Encode(e.to_string())))?;
    Ok(buf)
}

/// Deserialize a snapshot from CBOR.
///
/// # Errors
///
/// Returns an [`AmesError`] if the bytes are not a valid snapshot of any
/// known version.
pub fn decode(bytes: &[u8]) -> Result<SavedState, AmesError> {
    ciborium::de::from_reader(bytes)
        .map_err(|e| AmesError::Packet(PacketError::Decode(e.to_string())))
}
