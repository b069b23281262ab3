//! Per-peer state: PKI fields, routes, QoS, the ossuary, and the flow
//! maps.
//!
//! A peer is either *alien* — referenced locally but without keys yet, its
//! work queued on an agenda — or *known*, with a symmetric key derivable
//! and flows running. Promotion drains the agenda in FIFO order; a
//! continuity breach goes the other way, discarding every flow while
//! keeping the PKI fields.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    time::{Duration, Instant},
};

use ames_proto::{Bone, Lane, Plea, Ship};
use bytes::Bytes;

use crate::{crypto::PublicKeys, pump::MessagePump, sink::MessageSink, task::Duct};

/// A peer is considered dead this long after its last contact.
pub const DEAD_AFTER: Duration = Duration::from_secs(30);

/// Response-flow backlog at which an unresponsive peer counts as clogged.
pub const CLOG_THRESHOLD: u32 = 5;

/// What the PKI oracle told us about a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerPki {
    /// Key epoch
    pub life: u32,
    /// Continuity epoch
    pub rift: u32,
    /// Published keys at `life`
    pub keys: PublicKeys,
    /// Current sponsor
    pub sponsor: Ship,
}

/// How to reach a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Heard from the peer itself rather than via a relay
    pub direct: bool,
    /// The lane to transmit on
    pub lane: Lane,
}

/// Peer liveness, as observed from traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosKind {
    /// Never heard from since we learned of it
    Unborn,
    /// Recently heard from
    Live,
    /// Went quiet for [`DEAD_AFTER`]
    Dead,
}

/// Liveness state plus the observation it is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Qos {
    /// Current classification
    pub kind: QosKind,
    /// When we last heard from the peer
    pub last_contact: Option<Instant>,
}

impl Qos {
    /// Initial state for a peer we have never heard from.
    #[must_use]
    pub fn unborn() -> Self {
        Self {
            kind: QosKind::Unborn,
            last_contact: None,
        }
    }
}

/// Bidirectional duct ↔ bone map.
///
/// Bones advance by four so the two class bits stay clear: every allocated
/// bone is a forward bone, and its backward (+1), nack-trace (+2), and
/// backward-trace (+3) relatives are implied.
#[derive(Debug, Clone, Default)]
pub struct Ossuary {
    by_duct: HashMap<Duct, Bone>,
    by_bone: HashMap<Bone, Duct>,
    next_bone: u32,
}

impl Ossuary {
    /// An empty map allocating from bone zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The forward bone for a duct, allocating one if needed.
    pub fn bone_for(&mut self, duct: &Duct) -> Bone {
        if let Some(bone) = self.by_duct.get(duct) {
            return *bone;
        }
        let bone = Bone(self.next_bone);
        self.next_bone += 4;
        self.by_duct.insert(duct.clone(), bone);
        self.by_bone.insert(bone, duct.clone());
        bone
    }

    /// The duct a bone belongs to, looking through the class bits: every
    /// relative of a forward bone maps to the same caller.
    #[must_use]
    pub fn duct_for(&self, bone: Bone) -> Option<&Duct> {
        self.by_bone.get(&Bone(bone.0 & !0b11))
    }

    /// All allocations, for snapshots.
    #[must_use]
    pub fn entries(&self) -> Vec<(Duct, Bone)> {
        let mut entries: Vec<_> = self
            .by_duct
            .iter()
            .map(|(duct, bone)| (duct.clone(), *bone))
            .collect();
        entries.sort_by_key(|(_, bone)| *bone);
        entries
    }

    /// Rebuild from snapshot entries.
    #[must_use]
    pub fn from_entries(entries: Vec<(Duct, Bone)>, next_bone: u32) -> Self {
        let mut ossuary = Self {
            next_bone,
            ..Self::default()
        };
        for (duct, bone) in entries {
            ossuary.by_duct.insert(duct.clone(), bone);
            ossuary.by_bone.insert(bone, duct);
        }
        ossuary
    }

    /// Next bone to allocate.
    #[must_use]
    pub fn next_bone(&self) -> u32 {
        self.next_bone
    }
}

/// Work queued against a peer we have no keys for yet.
#[derive(Debug, Clone, Default)]
pub struct AlienAgenda {
    /// Requests to send once keys arrive
    pub pleas: Vec<(Duct, Plea)>,
    /// Raw outbound packet blobs (forwarding attempts)
    pub packets: Vec<Bytes>,
    /// Liveness subscriptions to install
    pub heeds: HashSet<Duct>,
}

/// A peer with keys: flows can run.
#[derive(Debug, Clone)]
pub struct Peer {
    /// PKI fields
    pub pki: PeerPki,
    /// Best-known route, if any
    pub route: Option<Route>,
    /// Liveness
    pub qos: Qos,
    /// Duct ↔ bone map
    pub ossuary: Ossuary,
    /// Outbound flows by bone
    pub snd: HashMap<Bone, MessagePump>,
    /// Inbound flows by bone
    pub rcv: HashMap<Bone, MessageSink>,
    /// Messages we nacked, awaiting the sender's drop acknowledgement
    pub nax: BTreeSet<(Bone, u32)>,
    /// Liveness subscribers
    pub heeds: HashSet<Duct>,
}

impl Peer {
    /// A freshly-known peer: PKI fields only, no flows, unborn.
    #[must_use]
    pub fn new(pki: PeerPki) -> Self {
        Self {
            pki,
            route: None,
            qos: Qos::unborn(),
            ossuary: Ossuary::new(),
            snd: HashMap::new(),
            rcv: HashMap::new(),
            nax: BTreeSet::new(),
            heeds: HashSet::new(),
        }
    }

    /// Record a successful receive: route freshness and liveness.
    ///
    /// Returns the previous QoS kind when the classification changed, for
    /// the caller to announce.
    pub fn on_contact(&mut self, now: Instant) -> Option<QosKind> {
        let previous = self.qos.kind;
        self.qos.last_contact = Some(now);
        self.qos.kind = QosKind::Live;
        (previous != QosKind::Live).then_some(previous)
    }

    /// Check for silence on a timer fire: live peers that have not been
    /// heard from in [`DEAD_AFTER`] become dead. Returns true when the
    /// classification changed.
    pub fn check_silence(&mut self, now: Instant) -> bool {
        if self.qos.kind != QosKind::Live {
            return false;
        }
        let quiet = self
            .qos
            .last_contact
            .map_or(true, |last| now.saturating_duration_since(last) >= DEAD_AFTER);
        if quiet {
            self.qos.kind = QosKind::Dead;
        }
        quiet
    }

    /// Total unconcluded messages across response flows, the clog metric:
    /// a peer that owes answers and has gone quiet is worth announcing.
    #[must_use]
    pub fn backward_backlog(&self) -> u32 {
        self.snd
            .iter()
            .filter(|(bone, _)| bone.is_backward())
            .map(|(_, pump)| pump.backlog())
            .sum()
    }

    /// Whether the backlog over response flows crosses the clog bar.
    #[must_use]
    pub fn is_clogged(&self) -> bool {
        self.backward_backlog() >= CLOG_THRESHOLD
    }
}

/// Everything we hold about a ship.
#[derive(Debug, Clone)]
pub enum PeerEntry {
    /// No keys yet; work queues on the agenda
    Alien(AlienAgenda),
    /// Keys known; flows run
    Known(Box<Peer>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn duct(name: &str) -> Duct {
        Duct(vec![name.to_string()])
    }

    #[test]
    fn ossuary_allocates_forward_bones_by_four() {
        let mut ossuary = Ossuary::new();
        let a = ossuary.bone_for(&duct("a"));
        let b = ossuary.bone_for(&duct("b"));

        assert_eq!(a, Bone(0));
        assert_eq!(b, Bone(4));
        assert!(a.is_forward());
        assert!(b.is_forward());

        // stable for the same duct
        assert_eq!(ossuary.bone_for(&duct("a")), Bone(0));
    }

    #[test]
    fn ossuary_resolves_relatives_to_the_same_duct() {
        let mut ossuary = Ossuary::new();
        let bone = ossuary.bone_for(&duct("caller"));

        for relative in [bone, Bone(bone.0 | 1), Bone(bone.0 | 2), Bone(bone.0 | 3)] {
            assert_eq!(ossuary.duct_for(relative), Some(&duct("caller")));
        }
        assert_eq!(ossuary.duct_for(Bone(8)), None);
    }

    #[test]
    fn ossuary_snapshot_round_trip() {
        let mut ossuary = Ossuary::new();
        ossuary.bone_for(&duct("a"));
        ossuary.bone_for(&duct("b"));

        let rebuilt = Ossuary::from_entries(ossuary.entries(), ossuary.next_bone());
        assert_eq!(rebuilt.duct_for(Bone(4)), Some(&duct("b")));
        assert_eq!(rebuilt.next_bone(), 8);
    }

    #[test]
    fn qos_transitions() {
        let now = Instant::now();
        let mut peer = Peer::new(PeerPki {
            life: 1,
            rift: 0,
            keys: crate::crypto::KeyPair::from_seed([1; 32]).public(),
            sponsor: Ship(0x1),
        });

        assert_eq!(peer.qos.kind, QosKind::Unborn);
        assert_eq!(peer.on_contact(now), Some(QosKind::Unborn));
        assert_eq!(peer.qos.kind, QosKind::Live);
        assert_eq!(peer.on_contact(now), None);

        // silence flips live to dead, once
        assert!(peer.check_silence(now + DEAD_AFTER));
        assert_eq!(peer.qos.kind, QosKind::Dead);
        assert!(!peer.check_silence(now + DEAD_AFTER));

        // any receive revives
        assert_eq!(peer.on_contact(now + DEAD_AFTER), Some(QosKind::Dead));
        assert_eq!(peer.qos.kind, QosKind::Live);
    }
}
