//! The transport's external interface: inbound tasks, outbound effects,
//! and the wire identifiers that connect them.
//!
//! Both sums are closed: the dispatcher matches exhaustively, and adding a
//! variant is a compile error everywhere it matters. The host event loop
//! feeds [`Task`]s in and interprets the returned [`Effect`]s — writing
//! packets, arming timers, and routing notifications to local subsystems.

use std::time::Instant;

use ames_proto::{Bone, Lane, NackTrace, Plea, Ship};
use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::crypto::PublicKeys;

bitflags! {
    /// Debug verbosity toggles, one per traffic class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct Verbosity: u8 {
        /// Outbound packets
        const SND = 0b0000_0001;
        /// Inbound packets
        const RCV = 0b0000_0010;
        /// Rejected or unparseable packets
        const ODD = 0b0000_0100;
        /// Message-level events (delivery, done)
        const MSG = 0b0000_1000;
        /// Congestion events (retransmit, backoff)
        const GES = 0b0001_0000;
        /// Forwarded packets
        const FOR = 0b0010_0000;
        /// Key and routing changes
        const ROT = 0b0100_0000;
    }
}

/// Opaque identifier of a local caller, mapped to a bone by the ossuary.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Duct(pub Vec<String>);

/// Canonical handle for a flow timer: cancel with the same key it was
/// armed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerWire {
    /// Peer the flow belongs to
    pub ship: Ship,
    /// The flow
    pub bone: Bone,
}

/// Handle on events delivered to local subsystems. Carries the rift so a
/// stale event — one queued before the peer breached — identifies itself:
/// receipt of a bone wire older than the peer's current rift is silently
/// discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoneWire {
    /// Peer the flow belongs to
    pub ship: Ship,
    /// The peer's continuity epoch when this wire was minted
    pub rift: u32,
    /// The flow
    pub bone: Bone,
}

/// PKI oracle deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PkiResult {
    /// Full snapshot for one ship
    Keys {
        /// Subject ship
        ship: Ship,
        /// Key epoch
        life: u32,
        /// Continuity epoch
        rift: u32,
        /// Published keys at that life
        keys: PublicKeys,
        /// Current sponsor
        sponsor: Ship,
    },
    /// The ship rotated its keys; flows survive
    Rekey {
        /// Subject ship
        ship: Ship,
        /// New key epoch
        life: u32,
        /// New published keys
        keys: PublicKeys,
    },
    /// The ship changed sponsors; flows survive
    Sponsor {
        /// Subject ship
        ship: Ship,
        /// New sponsor
        sponsor: Ship,
    },
    /// The ship's continuity epoch advanced: a breach
    Rift {
        /// Subject ship
        ship: Ship,
        /// New continuity epoch
        rift: u32,
    },
    /// Explicit breach notification (equivalent to a rift bump)
    Breach {
        /// Subject ship
        ship: Ship,
    },
}

/// One inbound event for the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// The host restarted; remember the notification duct
    Born {
        /// Duct for liveness and domain notifications
        duct: Duct,
    },
    /// A raw packet arrived
    Hear {
        /// Lane it arrived on
        lane: Lane,
        /// Raw packet bytes
        blob: Bytes,
        /// Set when a previous handling of this packet crashed upstream
        error: Option<NackTrace>,
    },
    /// Register interest in a peer's liveness
    Heed {
        /// Subscribing caller
        duct: Duct,
        /// Watched peer
        ship: Ship,
    },
    /// Deregister interest in a peer's liveness
    Jilt {
        /// Unsubscribing caller
        duct: Duct,
        /// Watched peer
        ship: Ship,
    },
    /// Send a request message to a peer
    Plea {
        /// Requesting caller (mapped to a bone by the ossuary)
        duct: Duct,
        /// Destination
        ship: Ship,
        /// The request
        plea: Plea,
    },
    /// Send a response on an established flow
    Boon {
        /// The flow being answered on
        wire: BoneWire,
        /// Opaque response payload
        payload: Bytes,
    },
    /// The local consumer finished with the message we offered it
    Done {
        /// The flow the message arrived on
        wire: BoneWire,
        /// Whether processing succeeded
        ok: bool,
        /// The consumer's error, when it failed
        error: Option<NackTrace>,
    },
    /// A flow timer fired
    Wake {
        /// Which timer
        wire: TimerWire,
    },
    /// Reset congestion for these peers
    Prod {
        /// Peers to prod
        ships: Vec<Ship>,
    },
    /// Restrict debug output to these ships (empty clears the filter)
    Sift {
        /// Ships to trace
        ships: Vec<Ship>,
    },
    /// Set debug verbosity toggles
    Spew {
        /// New toggle set
        flags: Verbosity,
    },
    /// Arm any missing timers (recovery after restart)
    Stir,
    /// Memory pressure notification; nothing to shed at this layer
    Trim,
    /// Kernel reload notification; no-op at this layer
    Vega,
    /// Our own private keys (initial or after our rekey)
    PrivateKeys {
        /// Our new key epoch
        life: u32,
        /// Seed per life, newest included
        seeds: Vec<(u32, [u8; 32])>,
    },
    /// A PKI oracle delivery about some peer
    Pki(PkiResult),
}

/// One outbound effect for the host to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Transmit bytes on a lane
    Send {
        /// Destination lane
        lane: Lane,
        /// Encoded packet
        blob: Bytes,
    },
    /// Arm a timer; fire back a [`Task::Wake`] with the same wire
    Wait {
        /// Timer identity
        wire: TimerWire,
        /// When to fire
        at: Instant,
    },
    /// Cancel the timer armed under this wire
    Rest {
        /// Timer identity
        wire: TimerWire,
    },
    /// A request message from a peer, offered to the local consumer
    Deliver {
        /// Flow identity for the consumer's eventual [`Task::Done`]
        wire: BoneWire,
        /// The request
        plea: Plea,
    },
    /// Conclude a locally-sent message: ack or nack with trace
    Done {
        /// The caller that sent the message
        duct: Duct,
        /// Peer the message went to
        ship: Ship,
        /// Message sequence number on its flow
        num: u32,
        /// `None` on success, the failure report otherwise
        error: Option<NackTrace>,
    },
    /// A response message from a peer, delivered to the local caller
    Boon {
        /// The caller that opened the flow
        duct: Duct,
        /// Peer the response came from
        ship: Ship,
        /// Opaque response payload
        payload: Bytes,
    },
    /// A response was received but its consumer failed; response flows
    /// carry no nacks, so the caller gets a loss notification instead
    Lost {
        /// The caller that opened the flow
        duct: Duct,
        /// Peer the response came from
        ship: Ship,
    },
    /// A watched peer is unresponsive with work piling up
    Clog {
        /// The subscriber being notified
        duct: Duct,
        /// The congested peer
        ship: Ship,
    },
    /// Ask the PKI oracle for a ship's keys
    RequestKeys {
        /// Subject ship
        ship: Ship,
    },
    /// Publish the galaxy domain list (on birth)
    Turf {
        /// DNS domains under which galaxies resolve
        domains: Vec<String>,
    },
    /// Human-readable notification or debug line
    Log {
        /// The line
        line: String,
    },
}
