//! Deterministic simulation driver for the Ames transport.
//!
//! [`SimNet`] owns a set of transport nodes, a virtual clock, a timer
//! table, and an in-flight packet queue. It interprets every effect the
//! nodes emit — writing "packets" straight into other nodes' inboxes,
//! arming and cancelling timers, recording notifications — so a whole
//! multi-node exchange runs synchronously inside one test, with virtual
//! time advanced explicitly and every run bit-for-bit reproducible.
//!
//! Fault injection is a drop predicate over in-flight packets: tests
//! express "lose the third fragment" as a counter in a closure, not as a
//! race.

use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use ames_core::{
    peer::QosKind,
    task::{BoneWire, Duct, PkiResult, TimerWire},
    Ames, Effect, Task,
};
use ames_proto::{Lane, NackTrace, Plea, Ship};
use bytes::Bytes;
use tracing::trace;

/// A packet on the wire: who emitted it, the lane it left from, and the
/// lane it is addressed to.
#[derive(Debug, Clone)]
pub struct Flight {
    /// Emitting ship
    pub from: Ship,
    /// The emitter's own lane (the receiver's arrival lane)
    pub from_lane: Lane,
    /// Destination lane
    pub to_lane: Lane,
    /// Encoded packet
    pub blob: Bytes,
}

/// A `done` notification captured for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoneRecord {
    /// Node that emitted it
    pub on: Ship,
    /// Originating caller
    pub duct: Duct,
    /// Peer the message went to
    pub peer: Ship,
    /// Message number
    pub num: u32,
    /// Outcome
    pub error: Option<NackTrace>,
}

/// A delivered request captured for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverRecord {
    /// Node the request arrived at
    pub on: Ship,
    /// Flow identity for the consumer's response
    pub wire: BoneWire,
    /// The request
    pub plea: Plea,
}

type DropFilter = Box<dyn FnMut(&Flight) -> bool>;

/// Multi-node deterministic world.
pub struct SimNet {
    now: Instant,
    nodes: HashMap<Ship, Ames>,
    lanes: HashMap<Ship, Lane>,
    by_lane: HashMap<Lane, Ship>,
    in_flight: VecDeque<Flight>,
    pending: VecDeque<(Ship, Task)>,
    timers: HashMap<(Ship, TimerWire), Instant>,
    drop_filter: Option<DropFilter>,
    auto_ack: HashMap<Ship, bool>,

    /// Captured `done` notifications, in emission order
    pub dones: Vec<DoneRecord>,
    /// Captured request deliveries, in emission order
    pub delivers: Vec<DeliverRecord>,
    /// Captured response deliveries `(on, duct, peer, payload)`
    pub boons: Vec<(Ship, Duct, Ship, Bytes)>,
    /// Captured loss notifications `(on, duct, peer)`
    pub losts: Vec<(Ship, Duct, Ship)>,
    /// Captured clog notifications `(on, duct, peer)`
    pub clogs: Vec<(Ship, Duct, Ship)>,
    /// Captured key requests `(on, subject)`
    pub key_requests: Vec<(Ship, Ship)>,
    /// Captured log lines `(on, line)`
    pub logs: Vec<(Ship, String)>,
    /// Packets dropped by the fault filter
    pub dropped: usize,
    /// Packets that reached a node
    pub delivered: usize,
}

impl SimNet {
    /// An empty world starting at `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            now,
            nodes: HashMap::new(),
            lanes: HashMap::new(),
            by_lane: HashMap::new(),
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            timers: HashMap::new(),
            drop_filter: None,
            auto_ack: HashMap::new(),
            dones: Vec::new(),
            delivers: Vec::new(),
            boons: Vec::new(),
            losts: Vec::new(),
            clogs: Vec::new(),
            key_requests: Vec::new(),
            logs: Vec::new(),
            dropped: 0,
            delivered: 0,
        }
    }

    /// Current virtual time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Add a node reachable at `lane`.
    pub fn add_node(&mut self, ames: Ames, lane: Lane) {
        let ship = ames.us();
        self.lanes.insert(ship, lane.clone());
        self.by_lane.insert(lane, ship);
        self.nodes.insert(ship, ames);
    }

    /// Read access to a node.
    ///
    /// # Panics
    ///
    /// Panics if no node with that ship exists.
    #[must_use]
    pub fn node(&self, ship: Ship) -> &Ames {
        self.nodes.get(&ship).expect("no such node")
    }

    /// The lane a node lives at.
    ///
    /// # Panics
    ///
    /// Panics if no node with that ship exists.
    #[must_use]
    pub fn lane(&self, ship: Ship) -> Lane {
        self.lanes.get(&ship).expect("no such node").clone()
    }

    /// Tell `ship` about `subject`'s keys, as the PKI oracle would.
    ///
    /// # Panics
    ///
    /// Panics if either node is missing.
    pub fn introduce(&mut self, ship: Ship, subject: Ship) {
        let keys = self
            .nodes
            .get(&subject)
            .expect("no such subject")
            .public_keys()
            .expect("subject has keys");
        let life = self.nodes[&subject].life();
        self.handle(
            ship,
            Task::Pki(PkiResult::Keys {
                ship: subject,
                life,
                rift: self.nodes[&subject].rift(),
                keys,
                sponsor: subject.parent(),
            }),
        );
    }

    /// Make a node answer every delivered request positively, without the
    /// test having to respond by hand.
    pub fn set_auto_ack(&mut self, ship: Ship, on: bool) {
        self.auto_ack.insert(ship, on);
    }

    /// Install a fault filter: flights for which it returns true are lost.
    pub fn set_drop_filter(&mut self, filter: impl FnMut(&Flight) -> bool + 'static) {
        self.drop_filter = Some(Box::new(filter));
    }

    /// Remove the fault filter.
    pub fn clear_drop_filter(&mut self) {
        self.drop_filter = None;
    }

    /// Forget everything recorded so far (setup noise before the part a
    /// test actually asserts on).
    pub fn clear_records(&mut self) {
        self.dones.clear();
        self.delivers.clear();
        self.boons.clear();
        self.losts.clear();
        self.clogs.clear();
        self.key_requests.clear();
        self.logs.clear();
        self.dropped = 0;
        self.delivered = 0;
    }

    /// Armed timers for one ship.
    #[must_use]
    pub fn timers_for(&self, ship: Ship) -> Vec<(TimerWire, Instant)> {
        let mut timers: Vec<_> = self
            .timers
            .iter()
            .filter(|((on, _), _)| *on == ship)
            .map(|((_, wire), at)| (*wire, *at))
            .collect();
        timers.sort_by_key(|(_, at)| *at);
        timers
    }

    /// Run one task on a node and interpret its effects.
    ///
    /// # Panics
    ///
    /// Panics if the node is missing or the task errors: tests drive the
    /// world with tasks that must be accepted.
    pub fn handle(&mut self, ship: Ship, task: Task) {
        let node = self.nodes.get_mut(&ship).expect("no such node");
        let effects = node.handle(self.now, task).expect("task accepted");
        self.process(ship, effects);
        self.settle();
    }

    /// The consumer on `ship` answers the outstanding request on `wire`.
    pub fn done(&mut self, ship: Ship, wire: BoneWire, ok: bool, error: Option<NackTrace>) {
        self.handle(ship, Task::Done { wire, ok, error });
    }

    /// Deliver everything currently in flight (and whatever that spawns).
    pub fn deliver_all(&mut self) {
        self.settle();
    }

    /// Advance virtual time, firing due timers in deadline order and
    /// delivering whatever the wakes put on the wire.
    pub fn advance(&mut self, by: Duration) {
        self.now += by;
        loop {
            let due = self
                .timers
                .iter()
                .filter(|(_, at)| **at <= self.now)
                .map(|((ship, wire), at)| (*at, *ship, *wire))
                .min();
            let Some((_, ship, wire)) = due else {
                break;
            };
            self.timers.remove(&(ship, wire));
            self.handle(ship, Task::Wake { wire });
        }
    }

    /// Keep advancing in `step`s until nothing is armed or `limit` is
    /// reached.
    pub fn run(&mut self, step: Duration, limit: u32) {
        for _ in 0..limit {
            if self.timers.is_empty() && self.in_flight.is_empty() && self.pending.is_empty() {
                break;
            }
            self.advance(step);
        }
    }

    /// Drain pending tasks and in-flight packets until quiescent.
    fn settle(&mut self) {
        loop {
            if let Some((ship, task)) = self.pending.pop_front() {
                let node = self.nodes.get_mut(&ship).expect("no such node");
                let effects = node.handle(self.now, task).expect("task accepted");
                self.process(ship, effects);
                continue;
            }
            let Some(flight) = self.in_flight.pop_front() else {
                break;
            };
            self.fly(flight);
        }
    }

    fn fly(&mut self, flight: Flight) {
        if let Some(filter) = &mut self.drop_filter {
            if filter(&flight) {
                trace!(from = %flight.from, "packet dropped by fault filter");
                self.dropped += 1;
                return;
            }
        }

        let target = match &flight.to_lane {
            Lane::Galaxy(galaxy) => Some(*galaxy),
            lane => self.by_lane.get(lane).copied(),
        };
        let Some(target) = target else {
            self.dropped += 1;
            return;
        };
        if !self.nodes.contains_key(&target) {
            self.dropped += 1;
            return;
        }

        self.delivered += 1;
        let arrival = flight.from_lane.clone();
        let node = self.nodes.get_mut(&target).expect("checked above");
        let effects = node
            .handle(
                self.now,
                Task::Hear {
                    lane: arrival,
                    blob: flight.blob,
                    error: None,
                },
            )
            .expect("hear never errors");
        self.process(target, effects);
    }

    fn process(&mut self, on: Ship, effects: Vec<Effect>) {
        let from_lane = self.lanes.get(&on).cloned().unwrap_or(Lane::Galaxy(on));
        for effect in effects {
            match effect {
                Effect::Send { lane, blob } => self.in_flight.push_back(Flight {
                    from: on,
                    from_lane: from_lane.clone(),
                    to_lane: lane,
                    blob,
                }),
                Effect::Wait { wire, at } => {
                    self.timers.insert((on, wire), at);
                },
                Effect::Rest { wire } => {
                    self.timers.remove(&(on, wire));
                },
                Effect::Deliver { wire, plea } => {
                    self.delivers.push(DeliverRecord {
                        on,
                        wire,
                        plea,
                    });
                    if self.auto_ack.get(&on).copied().unwrap_or(false) {
                        self.pending.push_back((
                            on,
                            Task::Done {
                                wire,
                                ok: true,
                                error: None,
                            },
                        ));
                    }
                },
                Effect::Done {
                    duct,
                    ship,
                    num,
                    error,
                } => self.dones.push(DoneRecord {
                    on,
                    duct,
                    peer: ship,
                    num,
                    error,
                }),
                Effect::Boon {
                    duct,
                    ship,
                    payload,
                } => self.boons.push((on, duct, ship, payload)),
                Effect::Lost { duct, ship } => self.losts.push((on, duct, ship)),
                Effect::Clog { duct, ship } => self.clogs.push((on, duct, ship)),
                Effect::RequestKeys { ship } => self.key_requests.push((on, ship)),
                Effect::Turf { .. } => {},
                Effect::Log { line } => self.logs.push((on, line)),
            }
        }
    }
}

/// QoS kind of `ship`'s entry for `peer`, for assertions.
///
/// # Panics
///
/// Panics if the node or peer entry is missing.
#[must_use]
pub fn qos_of(net: &SimNet, ship: Ship, peer: Ship) -> QosKind {
    net.node(ship).known(peer).expect("peer known").qos.kind
}
