//! Top-level transport state and event dispatch.
//!
//! One [`Ames`] value owns the peer map and our own identity. The host
//! event loop feeds it one [`Task`] at a time; each task is processed to
//! completion — peer resolved, channel computed, flow engines run — and
//! the full list of [`Effect`]s is returned for the host to execute.
//! Nothing here blocks, sleeps, or reads a clock.
//!
//! Error discipline: a malformed or unopenable packet is protocol noise
//! from one peer and is dropped (with an optional trace) without touching
//! anything else. Errors on locally-originated tasks propagate to the
//! caller, because they are bugs or misconfiguration, not noise.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    time::Instant,
};

use ames_proto::{
    payload, Ack, Bone, Fragment, Lane, Meat, NackTrace, Naxplanation, OpenPacket, Packet, Plea,
    Rank, Ship, ShutPayload,
};
use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    channel::Channel,
    crypto::{self, KeyPair},
    error::AmesError,
    peer::{AlienAgenda, Peer, PeerEntry, PeerPki, Route},
    pump::{MessagePump, PumpGift},
    save::{SavedPeer, SavedRoute, SavedState, StateV2},
    sink::SinkGift,
    task::{BoneWire, Duct, Effect, PkiResult, Task, TimerWire, Verbosity},
};

/// Work produced under a peer borrow, committed to effects afterwards.
///
/// Flow engines run while the peer is mutably borrowed; sealing and
/// routing need the rest of the state. Everything outbound is therefore
/// staged as an `Outgoing` and materialized by [`Ames::commit`].
enum Outgoing {
    /// Seal this payload and route it to the peer
    Shut { bone: Bone, num: u32, meat: Meat },
    /// Arm the flow timer
    Wait { bone: Bone, at: Instant },
    /// Cancel the flow timer
    Rest { bone: Bone },
    /// Already a finished effect
    Local(Effect),
}

/// The transport: our identity plus everything we know about everyone.
pub struct Ames {
    us: Ship,
    life: u32,
    rift: u32,
    /// Private keys per life
    keys: BTreeMap<u32, KeyPair>,
    peers: HashMap<Ship, PeerEntry>,
    verbosity: Verbosity,
    /// Debug filter: when non-empty, only these ships are traced
    sift: HashSet<Ship>,
    galaxy_domains: Vec<String>,
    unix_duct: Option<Duct>,
}

impl Ames {
    /// A transport for `us` at `life`, with private keys from `seed`.
    #[must_use]
    pub fn new(us: Ship, life: u32, seed: [u8; 32]) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(life, KeyPair::from_seed(seed));
        Self {
            us,
            life,
            rift: 0,
            keys,
            peers: HashMap::new(),
            verbosity: Verbosity::empty(),
            sift: HashSet::new(),
            galaxy_domains: Vec::new(),
            unix_duct: None,
        }
    }

    /// Our ship.
    #[must_use]
    pub fn us(&self) -> Ship {
        self.us
    }

    /// Our key epoch.
    #[must_use]
    pub fn life(&self) -> u32 {
        self.life
    }

    /// Our continuity epoch.
    #[must_use]
    pub fn rift(&self) -> u32 {
        self.rift
    }

    /// Our published keys at the current life.
    ///
    /// # Errors
    ///
    /// Returns [`AmesError::NoPrivateKeys`] if no pair exists for the
    /// current life.
    pub fn public_keys(&self) -> Result<crate::crypto::PublicKeys, AmesError> {
        Ok(self.keypair()?.public())
    }

    /// Set the DNS domains published on birth.
    pub fn set_galaxy_domains(&mut self, domains: Vec<String>) {
        self.galaxy_domains = domains;
    }

    /// The state held for a ship, if any.
    #[must_use]
    pub fn peer(&self, ship: Ship) -> Option<&PeerEntry> {
        self.peers.get(&ship)
    }

    /// The duct registered at birth for host-level notifications.
    #[must_use]
    pub fn unix_duct(&self) -> Option<&Duct> {
        self.unix_duct.as_ref()
    }

    /// The known-peer state for a ship, if promoted.
    #[must_use]
    pub fn known(&self, ship: Ship) -> Option<&Peer> {
        match self.peers.get(&ship) {
            Some(PeerEntry::Known(peer)) => Some(peer),
            _ => None,
        }
    }

    /// Process one task to completion.
    ///
    /// # Errors
    ///
    /// Returns an [`AmesError`] for failures on locally-originated tasks
    /// (missing keys, unknown peers). Wire noise never errors: malformed
    /// inbound packets are dropped internally.
    pub fn handle(&mut self, now: Instant, task: Task) -> Result<Vec<Effect>, AmesError> {
        match task {
            Task::Born { duct } => {
                self.unix_duct = Some(duct);
                Ok(vec![Effect::Turf {
                    domains: self.galaxy_domains.clone(),
                }])
            },
            Task::Hear { lane, blob, error } => match self.on_hear(now, lane, blob, error) {
                Ok(effects) => Ok(effects),
                Err(err) => {
                    debug!(%err, "dropping inbound packet");
                    Ok(self.odd_log(format!("dropped packet: {err}")))
                },
            },
            Task::Heed { duct, ship } => Ok(self.on_heed(duct, ship)),
            Task::Jilt { duct, ship } => Ok(self.on_jilt(&duct, ship)),
            Task::Plea { duct, ship, plea } => self.on_plea(now, duct, ship, plea),
            Task::Boon { wire, payload } => self.on_boon(now, wire, payload),
            Task::Done { wire, ok, error } => self.on_done(now, wire, ok, error),
            Task::Wake { wire } => self.on_wake(now, wire),
            Task::Prod { ships } => self.on_prod(now, &ships),
            Task::Sift { ships } => {
                self.sift = ships.into_iter().collect();
                Ok(Vec::new())
            },
            Task::Spew { flags } => {
                self.verbosity = flags;
                Ok(Vec::new())
            },
            Task::Stir => self.on_stir(now),
            Task::Trim | Task::Vega => Ok(Vec::new()),
            Task::PrivateKeys { life, seeds } => {
                self.life = life;
                self.keys = seeds
                    .into_iter()
                    .map(|(l, seed)| (l, KeyPair::from_seed(seed)))
                    .collect();
                Ok(Vec::new())
            },
            Task::Pki(result) => Ok(self.on_pki(now, result)),
        }
    }

    // ------------------------------------------------------------------
    // inbound packets

    fn on_hear(
        &mut self,
        now: Instant,
        lane: Lane,
        blob: Bytes,
        prior_failure: Option<NackTrace>,
    ) -> Result<Vec<Effect>, AmesError> {
        let packet = Packet::decode(&blob)?;

        if packet.rcvr != self.us {
            return Ok(self.forward(&lane, packet));
        }

        if prior_failure.is_some() {
            // a previous pass over this packet crashed upstream: drop it
            // and skip the ack path, so we never confirm a message whose
            // processing did not complete
            return Ok(self.odd_log(format!("dropping replayed packet from {}", packet.sndr)));
        }

        // an empty-content request addressed to a comet is a keys request
        if packet.content.is_empty() && self.us.rank() == Rank::Comet {
            return self.send_attestation(packet.sndr, &lane);
        }

        let known = matches!(self.peers.get(&packet.sndr), Some(PeerEntry::Known(_)));
        if known {
            return self.on_shut_packet(now, lane, packet);
        }

        if packet.sndr.rank() == Rank::Comet {
            let sndr = packet.sndr;
            // reply past any relay: the origin breadcrumb is the comet
            let reply_lane = packet.origin.map_or(lane.clone(), |origin| origin.lane());
            match self.on_open_packet(now, lane, packet) {
                Ok(effects) => return Ok(effects),
                Err(err) => {
                    // encrypted traffic from a comet we have not met: we
                    // cannot look a comet up, so ask it to attest itself
                    debug!(%sndr, %err, "unattested comet, requesting keys");
                    self.peers
                        .entry(sndr)
                        .or_insert_with(|| PeerEntry::Alien(AlienAgenda::default()));
                    let request = Packet {
                        sndr: self.us,
                        rcvr: sndr,
                        request: true,
                        sndr_tick: (self.life % 16) as u8,
                        rcvr_tick: 1,
                        origin: None,
                        content: Bytes::new(),
                    };
                    return Ok(vec![Effect::Send {
                        lane: reply_lane,
                        blob: request.encode(),
                    }]);
                },
            }
        }

        // shut traffic from a peer we hold no keys for: remember the ship,
        // ask the oracle, drop the packet
        self.peers
            .entry(packet.sndr)
            .or_insert_with(|| PeerEntry::Alien(AlienAgenda::default()));
        let mut effects = self.odd_log(format!("no keys for {}", packet.sndr));
        effects.push(Effect::RequestKeys { ship: packet.sndr });
        Ok(effects)
    }

    fn on_shut_packet(
        &mut self,
        now: Instant,
        lane: Lane,
        packet: Packet,
    ) -> Result<Vec<Effect>, AmesError> {
        let ship = packet.sndr;
        let channel = self.channel_for(ship)?;
        let shut = channel.open(&packet)?;

        let mut effects = self.spew_log(
            Verbosity::RCV,
            ship,
            format!("rcv {} {:?} num {}", ship, shut.bone, shut.num),
        );

        // the packet authenticated: refresh route and liveness
        {
            let peer = self.known_mut(ship)?;
            peer.route = Some(Route {
                direct: packet.origin.is_none(),
                lane: packet.origin.map_or(lane, |origin| origin.lane()),
            });
            if let Some(previous) = peer.on_contact(now) {
                trace!(%ship, ?previous, "peer is live");
                effects.push(Effect::Log {
                    line: format!("peer {ship} is live"),
                });
            }
        }

        let bone = shut.bone.flipped();
        let more = match shut.meat {
            Meat::Fragment(fragment) => self.on_fragment(now, ship, &channel, bone, shut.num, fragment)?,
            Meat::Ack(Ack::Fragment { index }) => {
                self.on_ack(now, ship, &channel, bone, shut.num, AckKind::Fragment { index })?
            },
            Meat::Ack(Ack::Message { ok, .. }) => {
                self.on_ack(now, ship, &channel, bone, shut.num, AckKind::Message { ok })?
            },
        };
        effects.extend(more);
        Ok(effects)
    }

    fn on_fragment(
        &mut self,
        now: Instant,
        ship: Ship,
        channel: &Channel,
        bone: Bone,
        num: u32,
        fragment: Fragment,
    ) -> Result<Vec<Effect>, AmesError> {
        let mut initial = Vec::new();
        {
            let peer = self.known_mut(ship)?;
            let sink = peer.rcv.entry(bone).or_default();
            sink.hear(now, num, fragment, &mut initial)?;
        }

        let mut out = Vec::new();
        self.drain_flow(now, ship, bone, initial, &mut out)?;
        self.commit(ship, channel, out)
    }

    fn on_ack(
        &mut self,
        now: Instant,
        ship: Ship,
        channel: &Channel,
        bone: Bone,
        num: u32,
        kind: AckKind,
    ) -> Result<Vec<Effect>, AmesError> {
        let mut out = Vec::new();
        {
            let peer = self.known_mut(ship)?;
            let Some(pump) = peer.snd.get_mut(&bone) else {
                // ack for a flow we no longer hold: stale, ignore
                return Ok(Vec::new());
            };

            let mut gifts = Vec::new();
            match kind {
                AckKind::Fragment { index } => pump.hear_fragment_ack(now, num, index, &mut gifts),
                AckKind::Message { ok } => pump.hear_message_ack(now, num, ok, &mut gifts),
            }

            let concluded = pump_out(peer, ship, bone, gifts, &mut out);
            settle_trace_dones(peer, bone, &concluded);
        }
        self.commit(ship, channel, out)
    }

    /// Translate sink gifts, including deliveries, which depend on the
    /// flow class: requests go to the local consumer, responses to the
    /// local caller, naxplanations to the paired pump (auto-acked).
    fn drain_flow(
        &mut self,
        now: Instant,
        ship: Ship,
        bone: Bone,
        initial: Vec<SinkGift>,
        out: &mut Vec<Outgoing>,
    ) -> Result<(), AmesError> {
        let peer = self.known_mut(ship)?;
        let rift = peer.pki.rift;
        let mut queue: VecDeque<SinkGift> = initial.into();

        while let Some(gift) = queue.pop_front() {
            match gift {
                SinkGift::Ack { num, ack } => out.push(Outgoing::Shut {
                    bone,
                    num,
                    meat: Meat::Ack(ack),
                }),
                SinkGift::Deliver { num, blob } => match bone.0 & 0b11 {
                    // request flow: parse and offer to the consumer; an
                    // unparseable body is a consumer failure in spirit
                    0b01 => match payload::decode_body::<Plea>(&blob) {
                        Ok(plea) => out.push(Outgoing::Local(Effect::Deliver {
                            wire: BoneWire { ship, rift, bone },
                            plea,
                        })),
                        Err(err) => {
                            let trace = NackTrace {
                                tag: "decode".to_string(),
                                notes: vec![err.to_string()],
                            };
                            if let Some(sink) = peer.rcv.get_mut(&bone) {
                                let mut gifts = Vec::new();
                                let concluded = sink.done(now, false, &mut gifts);
                                queue.extend(gifts);
                                if let Some(num) = concluded {
                                    send_naxplanation(peer, now, ship, bone, num, trace, out)?;
                                }
                            }
                        },
                    },
                    // response flow: hand the payload to the local caller
                    0b00 => {
                        if let Some(duct) = peer.ossuary.duct_for(bone) {
                            out.push(Outgoing::Local(Effect::Boon {
                                duct: duct.clone(),
                                ship,
                                payload: blob,
                            }));
                        } else {
                            debug!(%ship, ?bone, num, "boon for unknown duct dropped");
                        }
                    },
                    // nack-trace flow: we are the consumer
                    0b10 => {
                        if let Ok(nax) = payload::decode_body::<Naxplanation>(&blob) {
                            let fwd = bone.paired_trace();
                            if let Some(pump) = peer.snd.get_mut(&fwd) {
                                let mut gifts = Vec::new();
                                pump.near(now, nax.num, nax.error, &mut gifts);
                                let concluded = pump_out(peer, ship, fwd, gifts, out);
                                settle_trace_dones(peer, fwd, &concluded);
                            }
                        } else {
                            debug!(%ship, ?bone, num, "undecodable naxplanation");
                        }
                        // always ack positively: the trace was consumed
                        // here, and garbage is not worth re-requesting
                        if let Some(sink) = peer.rcv.get_mut(&bone) {
                            let mut gifts = Vec::new();
                            sink.done(now, true, &mut gifts);
                            queue.extend(gifts);
                        }
                    },
                    _ => debug!(%ship, ?bone, num, "fragment on impossible flow class"),
                },
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // open packets and comet attestation

    fn on_open_packet(
        &mut self,
        now: Instant,
        lane: Lane,
        packet: Packet,
    ) -> Result<Vec<Effect>, AmesError> {
        let open = OpenPacket::decode(&packet.content)?;
        let keys = crypto::verify_attestation(&open)?;

        if open.attestation.sndr != packet.sndr || open.attestation.rcvr != self.us {
            return Ok(self.odd_log(format!("misaddressed attestation from {}", packet.sndr)));
        }
        let sponsor = packet.sndr.parent();
        if sponsor.rank() != Rank::Star {
            return Ok(self.odd_log(format!("comet {} without a star sponsor", packet.sndr)));
        }

        debug!(ship = %packet.sndr, "comet attested");
        let pki = PeerPki {
            life: 1,
            rift: 0,
            keys,
            sponsor,
        };

        let agenda = match self.peers.remove(&packet.sndr) {
            Some(PeerEntry::Alien(agenda)) => agenda,
            Some(PeerEntry::Known(previous)) => {
                // re-attestation refreshes keys; flows survive
                let mut peer = previous;
                peer.pki = pki;
                self.peers.insert(packet.sndr, PeerEntry::Known(peer));
                return Ok(Vec::new());
            },
            None => AlienAgenda::default(),
        };

        let mut peer = make_peer(packet.sndr, pki);
        peer.route = Some(Route {
            direct: false,
            lane: packet.origin.map_or(lane, |origin| origin.lane()),
        });
        peer.on_contact(now);
        self.peers
            .insert(packet.sndr, PeerEntry::Known(Box::new(peer)));

        self.drain_agenda(now, packet.sndr, agenda)
    }

    fn send_attestation(&mut self, to: Ship, lane: &Lane) -> Result<Vec<Effect>, AmesError> {
        let pair = self.keypair()?;
        let rcvr_life = self.known(to).map_or(1, |peer| peer.pki.life);
        let open = crypto::attest(pair, self.us, to, rcvr_life)?;

        let packet = Packet {
            sndr: self.us,
            rcvr: to,
            request: false,
            sndr_tick: (self.life % 16) as u8,
            rcvr_tick: (rcvr_life % 16) as u8,
            origin: None,
            content: open.encode()?,
        };
        Ok(vec![Effect::Send {
            lane: lane.clone(),
            blob: packet.encode(),
        }])
    }

    // ------------------------------------------------------------------
    // forwarding

    fn forward(&mut self, arrival: &Lane, mut packet: Packet) -> Vec<Effect> {
        if packet.origin.is_none() && packet.sndr.rank() != Rank::Galaxy {
            packet.origin = arrival.origin();
        }

        let to = packet.rcvr;
        let blob = packet.encode();
        let mut effects = self.spew_log(
            Verbosity::FOR,
            to,
            format!("for {} -> {}", packet.sndr, to),
        );

        let sends = self.route_blob(to, &blob);
        if sends.is_empty() {
            // nowhere to send it yet: queue on the alien agenda and ask
            let entry = self
                .peers
                .entry(to)
                .or_insert_with(|| PeerEntry::Alien(AlienAgenda::default()));
            if let PeerEntry::Alien(agenda) = entry {
                agenda.packets.push(blob);
            }
            effects.push(Effect::RequestKeys { ship: to });
        } else {
            effects.extend(sends);
        }
        effects
    }

    /// Walk the sponsor chain and emit sends along it.
    ///
    /// Direct routes stop the walk; indirect routes send and continue, so
    /// a possibly-stale lane is backed up by the peer's sponsors. Galaxies
    /// always have a synthetic direct route by name.
    fn route_blob(&self, to: Ship, blob: &Bytes) -> Vec<Effect> {
        let mut effects = Vec::new();
        let mut candidate = to;
        loop {
            if candidate == self.us {
                break;
            }

            if let Some(peer) = self.known(candidate) {
                if let Some(route) = &peer.route {
                    effects.push(Effect::Send {
                        lane: route.lane.clone(),
                        blob: blob.clone(),
                    });
                    if route.direct {
                        break;
                    }
                } else if candidate.rank() == Rank::Galaxy {
                    effects.push(Effect::Send {
                        lane: Lane::Galaxy(candidate),
                        blob: blob.clone(),
                    });
                    break;
                }
            } else if candidate.rank() == Rank::Galaxy {
                effects.push(Effect::Send {
                    lane: Lane::Galaxy(candidate),
                    blob: blob.clone(),
                });
                break;
            }

            if candidate.rank() == Rank::Galaxy {
                break;
            }
            candidate = candidate.parent();
        }
        effects
    }

    // ------------------------------------------------------------------
    // local requests and responses

    fn on_plea(
        &mut self,
        now: Instant,
        duct: Duct,
        ship: Ship,
        plea: Plea,
    ) -> Result<Vec<Effect>, AmesError> {
        match self.peers.get_mut(&ship) {
            Some(PeerEntry::Known(_)) => self.do_plea(now, duct, ship, plea),
            Some(PeerEntry::Alien(agenda)) => {
                agenda.pleas.push((duct, plea));
                Ok(Vec::new())
            },
            None => {
                let mut agenda = AlienAgenda::default();
                agenda.pleas.push((duct, plea));
                self.peers.insert(ship, PeerEntry::Alien(agenda));
                if ship.rank() == Rank::Comet {
                    self.keys_request(ship)
                } else {
                    Ok(vec![Effect::RequestKeys { ship }])
                }
            },
        }
    }

    fn do_plea(
        &mut self,
        now: Instant,
        duct: Duct,
        ship: Ship,
        plea: Plea,
    ) -> Result<Vec<Effect>, AmesError> {
        let channel = self.channel_for(ship)?;
        let blob = payload::encode_body(&plea)?;

        let mut out = Vec::new();
        {
            let peer = self.known_mut(ship)?;
            let bone = peer.ossuary.bone_for(&duct);
            let pump = peer
                .snd
                .entry(bone)
                .or_insert_with(|| MessagePump::new(now));
            let mut gifts = Vec::new();
            let num = pump.memo(now, blob, &mut gifts);
            trace!(%ship, ?bone, num, "plea queued");
            let concluded = pump_out(peer, ship, bone, gifts, &mut out);
            settle_trace_dones(peer, bone, &concluded);
        }
        self.commit(ship, &channel, out)
    }

    fn on_boon(
        &mut self,
        now: Instant,
        wire: BoneWire,
        blob: Bytes,
    ) -> Result<Vec<Effect>, AmesError> {
        let ship = wire.ship;
        let channel = self.channel_for(ship)?;

        let mut out = Vec::new();
        {
            let peer = self.known_mut(ship)?;
            if wire.rift < peer.pki.rift {
                // response minted before the peer breached: nothing to
                // answer on, discard silently
                return Ok(Vec::new());
            }
            let pump = peer
                .snd
                .entry(wire.bone)
                .or_insert_with(|| MessagePump::new(now));
            let mut gifts = Vec::new();
            pump.memo(now, blob, &mut gifts);
            let concluded = pump_out(peer, ship, wire.bone, gifts, &mut out);
            settle_trace_dones(peer, wire.bone, &concluded);
        }
        self.commit(ship, &channel, out)
    }

    fn on_done(
        &mut self,
        now: Instant,
        wire: BoneWire,
        ok: bool,
        error: Option<NackTrace>,
    ) -> Result<Vec<Effect>, AmesError> {
        let ship = wire.ship;
        let channel = self.channel_for(ship)?;
        let bone = wire.bone;

        let mut out = Vec::new();
        let mut followups = Vec::new();
        {
            let peer = self.known_mut(ship)?;
            if wire.rift < peer.pki.rift {
                return Ok(Vec::new());
            }
            let Some(sink) = peer.rcv.get_mut(&bone) else {
                return Ok(Vec::new());
            };

            if bone.is_forward() {
                // a response flow: the consumer's failure is not nacked
                // back (responses carry no nacks); the caller hears a loss
                sink.done(now, true, &mut followups);
                if !ok {
                    if let Some(duct) = peer.ossuary.duct_for(bone) {
                        out.push(Outgoing::Local(Effect::Lost {
                            duct: duct.clone(),
                            ship,
                        }));
                    }
                }
            } else {
                let concluded = sink.done(now, ok, &mut followups);
                if !ok {
                    if let Some(num) = concluded {
                        let trace = error.unwrap_or(NackTrace {
                            tag: "nack".to_string(),
                            notes: Vec::new(),
                        });
                        send_naxplanation(peer, now, ship, bone, num, trace, &mut out)?;
                    }
                }
            }
        }
        self.drain_flow(now, ship, bone, followups, &mut out)?;
        self.commit(ship, &channel, out)
    }

    // ------------------------------------------------------------------
    // timers and liveness

    fn on_wake(&mut self, now: Instant, wire: TimerWire) -> Result<Vec<Effect>, AmesError> {
        let ship = wire.ship;
        if self.known(ship).is_none() {
            // breached or forgotten since the timer was armed
            return Ok(Vec::new());
        }
        let channel = self.channel_for(ship)?;

        let mut out = Vec::new();
        let mut effects = Vec::new();
        {
            let peer = self.known_mut(ship)?;
            if let Some(pump) = peer.snd.get_mut(&wire.bone) {
                let mut gifts = Vec::new();
                pump.wake(now, &mut gifts);
                let concluded = pump_out(peer, ship, wire.bone, gifts, &mut out);
                settle_trace_dones(peer, wire.bone, &concluded);
            }

            // a timer fire is when silence becomes observable
            if peer.check_silence(now) {
                effects.push(Effect::Log {
                    line: format!("peer {ship} is dead"),
                });
                if peer.is_clogged() {
                    for duct in &peer.heeds {
                        effects.push(Effect::Clog {
                            duct: duct.clone(),
                            ship,
                        });
                    }
                }
            }
        }
        effects.extend(self.spew_log(
            Verbosity::GES,
            ship,
            format!("ges wake {ship} {:?}", wire.bone),
        ));
        effects.extend(self.commit(ship, &channel, out)?);
        Ok(effects)
    }

    fn on_prod(&mut self, now: Instant, ships: &[Ship]) -> Result<Vec<Effect>, AmesError> {
        let mut effects = Vec::new();
        for &ship in ships {
            if self.known(ship).is_none() {
                continue;
            }
            let channel = self.channel_for(ship)?;
            let mut out = Vec::new();
            {
                let peer = self.known_mut(ship)?;
                let bones: Vec<Bone> = peer.snd.keys().copied().collect();
                for bone in bones {
                    if let Some(pump) = peer.snd.get_mut(&bone) {
                        let mut gifts = Vec::new();
                        pump.prod(now, &mut gifts);
                        let concluded = pump_out(peer, ship, bone, gifts, &mut out);
                        settle_trace_dones(peer, bone, &concluded);
                    }
                }
            }
            effects.extend(self.commit(ship, &channel, out)?);
        }
        Ok(effects)
    }

    fn on_stir(&mut self, now: Instant) -> Result<Vec<Effect>, AmesError> {
        let ships: Vec<Ship> = self
            .peers
            .iter()
            .filter(|(_, entry)| matches!(entry, PeerEntry::Known(_)))
            .map(|(ship, _)| *ship)
            .collect();

        let mut effects = Vec::new();
        for ship in ships {
            let channel = self.channel_for(ship)?;
            let mut out = Vec::new();
            let mut sink_work: Vec<(Bone, Vec<SinkGift>)> = Vec::new();
            {
                let peer = self.known_mut(ship)?;
                let bones: Vec<Bone> = peer.snd.keys().copied().collect();
                for bone in bones {
                    if let Some(pump) = peer.snd.get_mut(&bone) {
                        let mut gifts = Vec::new();
                        pump.stir(now, &mut gifts);
                        let concluded = pump_out(peer, ship, bone, gifts, &mut out);
                        settle_trace_dones(peer, bone, &concluded);
                    }
                }
                for (bone, sink) in &mut peer.rcv {
                    let mut gifts = Vec::new();
                    sink.stir(&mut gifts);
                    if !gifts.is_empty() {
                        sink_work.push((*bone, gifts));
                    }
                }
            }
            for (bone, gifts) in sink_work {
                self.drain_flow(now, ship, bone, gifts, &mut out)?;
            }
            effects.extend(self.commit(ship, &channel, out)?);
        }
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // liveness subscriptions

    fn on_heed(&mut self, duct: Duct, ship: Ship) -> Vec<Effect> {
        match self
            .peers
            .entry(ship)
            .or_insert_with(|| PeerEntry::Alien(AlienAgenda::default()))
        {
            PeerEntry::Known(peer) => {
                peer.heeds.insert(duct);
                Vec::new()
            },
            PeerEntry::Alien(agenda) => {
                agenda.heeds.insert(duct);
                vec![Effect::RequestKeys { ship }]
            },
        }
    }

    fn on_jilt(&mut self, duct: &Duct, ship: Ship) -> Vec<Effect> {
        match self.peers.get_mut(&ship) {
            Some(PeerEntry::Known(peer)) => {
                peer.heeds.remove(duct);
            },
            Some(PeerEntry::Alien(agenda)) => {
                agenda.heeds.remove(duct);
            },
            None => {},
        }
        Vec::new()
    }

    // ------------------------------------------------------------------
    // PKI deliveries

    fn on_pki(&mut self, now: Instant, result: PkiResult) -> Vec<Effect> {
        match result {
            PkiResult::Keys {
                ship,
                life,
                rift,
                keys,
                sponsor,
            } => {
                let pki = PeerPki {
                    life,
                    rift,
                    keys,
                    sponsor,
                };
                match self.peers.remove(&ship) {
                    Some(PeerEntry::Alien(agenda)) => {
                        debug!(%ship, life, "alien promoted");
                        self.peers
                            .insert(ship, PeerEntry::Known(Box::new(make_peer(ship, pki))));
                        self.drain_agenda(now, ship, agenda)
                            .unwrap_or_else(|err| self.odd_log(format!("agenda drain: {err}")))
                    },
                    Some(PeerEntry::Known(peer)) => {
                        let mut effects = Vec::new();
                        let old_rift = peer.pki.rift;
                        self.peers.insert(ship, PeerEntry::Known(peer));
                        if rift > old_rift {
                            effects.extend(self.on_breach(ship, rift));
                        }
                        if let Some(PeerEntry::Known(peer)) = self.peers.get_mut(&ship) {
                            peer.pki = pki;
                        }
                        effects
                    },
                    None => {
                        self.peers
                            .insert(ship, PeerEntry::Known(Box::new(make_peer(ship, pki))));
                        Vec::new()
                    },
                }
            },
            PkiResult::Rekey { ship, life, keys } => {
                if let Some(PeerEntry::Known(peer)) = self.peers.get_mut(&ship) {
                    debug!(%ship, life, "peer rekeyed");
                    peer.pki.life = life;
                    peer.pki.keys = keys;
                    self.spew_log(Verbosity::ROT, ship, format!("rekey {ship} life {life}"))
                } else {
                    Vec::new()
                }
            },
            PkiResult::Sponsor { ship, sponsor } => {
                if let Some(PeerEntry::Known(peer)) = self.peers.get_mut(&ship) {
                    peer.pki.sponsor = sponsor;
                }
                Vec::new()
            },
            PkiResult::Rift { ship, rift } => {
                let breached = matches!(
                    self.peers.get(&ship),
                    Some(PeerEntry::Known(peer)) if rift > peer.pki.rift
                );
                if breached {
                    self.on_breach(ship, rift)
                } else {
                    Vec::new()
                }
            },
            PkiResult::Breach { ship } => match self.peers.get(&ship) {
                Some(PeerEntry::Known(peer)) => {
                    let rift = peer.pki.rift + 1;
                    self.on_breach(ship, rift)
                },
                _ => Vec::new(),
            },
        }
    }

    /// Continuity breach: every flow, timer, and route assumption about
    /// the peer is void. PKI fields survive with the new rift.
    fn on_breach(&mut self, ship: Ship, new_rift: u32) -> Vec<Effect> {
        let Some(PeerEntry::Known(peer)) = self.peers.get_mut(&ship) else {
            return Vec::new();
        };
        debug!(%ship, new_rift, "continuity breach");

        let mut effects = Vec::new();
        for (bone, pump) in &peer.snd {
            if pump.timer_armed() {
                effects.push(Effect::Rest {
                    wire: TimerWire { ship, bone: *bone },
                });
            }
        }

        let mut pki = peer.pki.clone();
        pki.rift = new_rift;
        **peer = make_peer(ship, pki);

        effects.push(Effect::Log {
            line: format!("peer {ship} breached; all flows reset"),
        });
        effects
    }

    fn drain_agenda(
        &mut self,
        now: Instant,
        ship: Ship,
        agenda: AlienAgenda,
    ) -> Result<Vec<Effect>, AmesError> {
        {
            let peer = self.known_mut(ship)?;
            for duct in agenda.heeds {
                peer.heeds.insert(duct);
            }
        }

        let mut effects = Vec::new();
        for (duct, plea) in agenda.pleas {
            effects.extend(self.do_plea(now, duct, ship, plea)?);
        }
        for blob in agenda.packets {
            effects.extend(self.route_blob(ship, &blob));
        }
        Ok(effects)
    }

    // ------------------------------------------------------------------
    // plumbing

    fn keys_request(&self, ship: Ship) -> Result<Vec<Effect>, AmesError> {
        let packet = Packet {
            sndr: self.us,
            rcvr: ship,
            request: true,
            sndr_tick: (self.life % 16) as u8,
            // comets are always life 1
            rcvr_tick: 1,
            origin: None,
            content: Bytes::new(),
        };
        Ok(self.route_blob(ship, &packet.encode()))
    }

    fn commit(
        &self,
        ship: Ship,
        channel: &Channel,
        out: Vec<Outgoing>,
    ) -> Result<Vec<Effect>, AmesError> {
        let mut effects = Vec::new();
        for outgoing in out {
            match outgoing {
                Outgoing::Shut { bone, num, meat } => {
                    let packet = channel.seal(&ShutPayload { bone, num, meat })?;
                    effects.extend(self.spew_log(
                        Verbosity::SND,
                        ship,
                        format!("snd {ship} {bone:?} num {num}"),
                    ));
                    effects.extend(self.route_blob(ship, &packet.encode()));
                },
                Outgoing::Wait { bone, at } => effects.push(Effect::Wait {
                    wire: TimerWire { ship, bone },
                    at,
                }),
                Outgoing::Rest { bone } => effects.push(Effect::Rest {
                    wire: TimerWire { ship, bone },
                }),
                Outgoing::Local(effect) => {
                    if let Effect::Done { num, .. } = &effect {
                        effects.extend(self.spew_log(
                            Verbosity::MSG,
                            ship,
                            format!("msg {ship} done num {num}"),
                        ));
                    }
                    effects.push(effect);
                },
            }
        }
        Ok(effects)
    }

    fn channel_for(&self, ship: Ship) -> Result<Channel, AmesError> {
        let keypair = self.keypair()?;
        let Some(peer) = self.known(ship) else {
            return Err(AmesError::UnknownPeer(ship));
        };
        Ok(Channel {
            we: self.us,
            our_life: self.life,
            them: ship,
            her_life: peer.pki.life,
            her_rift: peer.pki.rift,
            key: keypair.shared_key(&peer.pki.keys),
        })
    }

    fn keypair(&self) -> Result<&KeyPair, AmesError> {
        self.keys
            .get(&self.life)
            .ok_or(AmesError::NoPrivateKeys(self.life))
    }

    fn known_mut(&mut self, ship: Ship) -> Result<&mut Peer, AmesError> {
        match self.peers.get_mut(&ship) {
            Some(PeerEntry::Known(peer)) => Ok(peer.as_mut()),
            _ => Err(AmesError::UnknownPeer(ship)),
        }
    }

    fn spew_log(&self, flag: Verbosity, ship: Ship, line: String) -> Vec<Effect> {
        if self.verbosity.contains(flag) && (self.sift.is_empty() || self.sift.contains(&ship)) {
            vec![Effect::Log { line }]
        } else {
            Vec::new()
        }
    }

    fn odd_log(&self, line: String) -> Vec<Effect> {
        if self.verbosity.contains(Verbosity::ODD) {
            vec![Effect::Log { line }]
        } else {
            Vec::new()
        }
    }
}

impl Ames {
    /// Capture the persisted state: identity, debug toggles, and every
    /// known peer's durable fields. Aliens and in-flight timing are
    /// regenerated from traffic instead.
    #[must_use]
    pub fn snapshot(&self) -> SavedState {
        let mut peers: Vec<SavedPeer> = self
            .peers
            .iter()
            .filter_map(|(ship, entry)| match entry {
                PeerEntry::Known(peer) => Some(saved_peer(*ship, peer)),
                PeerEntry::Alien(_) => None,
            })
            .collect();
        peers.sort_by_key(|peer| peer.ship);

        let mut sift: Vec<Ship> = self.sift.iter().copied().collect();
        sift.sort();

        SavedState::V2(StateV2 {
            us: self.us,
            life: self.life,
            rift: self.rift,
            seeds: self
                .keys
                .iter()
                .map(|(life, pair)| (*life, pair.seed()))
                .collect(),
            verbosity: self.verbosity,
            sift,
            domains: self.galaxy_domains.clone(),
            unix_duct: self.unix_duct.clone(),
            peers,
        })
    }

    /// Rebuild a transport from a snapshot of any version, composing the
    /// migration ladder first. Follow with [`Task::Stir`] to re-arm timers
    /// and re-offer pending messages.
    #[must_use]
    pub fn restore(now: Instant, saved: SavedState) -> Self {
        let state = saved.migrate();

        let peers = state
            .peers
            .into_iter()
            .map(|saved| {
                let peer = Peer {
                    pki: PeerPki {
                        life: saved.life,
                        rift: saved.rift,
                        keys: saved.keys,
                        sponsor: saved.sponsor,
                    },
                    route: saved.route.map(|route| Route {
                        direct: route.direct,
                        lane: route.lane,
                    }),
                    qos: crate::peer::Qos::unborn(),
                    ossuary: crate::peer::Ossuary::from_entries(saved.ossuary, saved.next_bone),
                    snd: saved
                        .snd
                        .into_iter()
                        .map(|(bone, snap)| (bone, MessagePump::restore(now, snap)))
                        .collect(),
                    rcv: saved
                        .rcv
                        .into_iter()
                        .map(|(bone, snap)| (bone, crate::sink::MessageSink::restore(now, snap)))
                        .collect(),
                    nax: saved.nax.into_iter().collect(),
                    heeds: saved.heeds.into_iter().collect(),
                };
                (saved.ship, PeerEntry::Known(Box::new(peer)))
            })
            .collect();

        Self {
            us: state.us,
            life: state.life,
            rift: state.rift,
            keys: state
                .seeds
                .into_iter()
                .map(|(life, seed)| (life, KeyPair::from_seed(seed)))
                .collect(),
            peers,
            verbosity: state.verbosity,
            sift: state.sift.into_iter().collect(),
            galaxy_domains: state.domains,
            unix_duct: state.unix_duct,
        }
    }
}

fn saved_peer(ship: Ship, peer: &Peer) -> SavedPeer {
    let mut heeds: Vec<Duct> = peer.heeds.iter().cloned().collect();
    heeds.sort();
    let mut snd: Vec<_> = peer
        .snd
        .iter()
        .map(|(bone, pump)| (*bone, pump.snapshot()))
        .collect();
    snd.sort_by_key(|(bone, _)| *bone);
    let mut rcv: Vec<_> = peer
        .rcv
        .iter()
        .map(|(bone, sink)| (*bone, sink.snapshot()))
        .collect();
    rcv.sort_by_key(|(bone, _)| *bone);

    SavedPeer {
        ship,
        life: peer.pki.life,
        rift: peer.pki.rift,
        keys: peer.pki.keys,
        sponsor: peer.pki.sponsor,
        route: peer.route.as_ref().map(|route| SavedRoute {
            direct: route.direct,
            lane: route.lane.clone(),
        }),
        ossuary: peer.ossuary.entries(),
        next_bone: peer.ossuary.next_bone(),
        nax: peer.nax.iter().copied().collect(),
        heeds,
        snd,
        rcv,
    }
}

enum AckKind {
    Fragment { index: u32 },
    Message { ok: bool },
}

/// A freshly-known peer; galaxies get their synthetic direct route.
fn make_peer(ship: Ship, pki: PeerPki) -> Peer {
    let mut peer = Peer::new(pki);
    if ship.rank() == Rank::Galaxy {
        peer.route = Some(Route {
            direct: true,
            lane: Lane::Galaxy(ship),
        });
    }
    peer
}

/// Translate pump gifts into staged outgoings. Returns the message
/// numbers concluded on a nack-trace pump, which the caller settles
/// against the peer's pending-drop set.
fn pump_out(
    peer: &mut Peer,
    ship: Ship,
    bone: Bone,
    gifts: Vec<PumpGift>,
    out: &mut Vec<Outgoing>,
) -> Vec<u32> {
    let mut trace_dones = Vec::new();
    for gift in gifts {
        match gift {
            PumpGift::Send(fragment) => out.push(Outgoing::Shut {
                bone,
                num: fragment.num,
                meat: Meat::Fragment(fragment.to_wire()),
            }),
            PumpGift::Done { num, error } => match bone.0 & 0b11 {
                0b00 => {
                    if let Some(duct) = peer.ossuary.duct_for(bone) {
                        out.push(Outgoing::Local(Effect::Done {
                            duct: duct.clone(),
                            ship,
                            num,
                            error,
                        }));
                    }
                },
                // our naxplanation message was acked by the sender
                0b11 => trace_dones.push(num),
                // a response message concluded: callers do not track boons
                _ => {},
            },
            PumpGift::Wait(at) => out.push(Outgoing::Wait { bone, at }),
            PumpGift::Rest => out.push(Outgoing::Rest { bone }),
        }
    }
    trace_dones
}

/// For each concluded naxplanation, release the oldest remembered nack on
/// the paired sink so duplicate suppression can finally let go.
fn settle_trace_dones(peer: &mut Peer, pump_bone: Bone, concluded: &[u32]) {
    if pump_bone.0 & 0b11 != 0b11 {
        return;
    }
    let sink_bone = pump_bone.paired_trace();
    for _ in concluded {
        let entry = peer
            .nax
            .iter()
            .find(|(bone, _)| *bone == sink_bone)
            .copied();
        let Some((bone, num)) = entry else {
            break;
        };
        peer.nax.remove(&(bone, num));
        if let Some(sink) = peer.rcv.get_mut(&bone) {
            sink.drop_nack(num);
        }
    }
}

/// Queue a naxplanation for a nacked request: remember the pending drop,
/// then send the error as an ordinary message on the paired trace flow.
fn send_naxplanation(
    peer: &mut Peer,
    now: Instant,
    ship: Ship,
    sink_bone: Bone,
    num: u32,
    trace: NackTrace,
    out: &mut Vec<Outgoing>,
) -> Result<(), AmesError> {
    peer.nax.insert((sink_bone, num));

    let trace_bone = sink_bone.paired_trace();
    let blob = payload::encode_body(&Naxplanation { num, error: trace })?;
    let pump = peer
        .snd
        .entry(trace_bone)
        .or_insert_with(|| MessagePump::new(now));
    let mut gifts = Vec::new();
    pump.memo(now, blob, &mut gifts);
    let concluded = pump_out(peer, ship, trace_bone, gifts, out);
    settle_trace_dones(peer, trace_bone, &concluded);
    Ok(())
}
