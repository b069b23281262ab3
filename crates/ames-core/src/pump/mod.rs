//! Outbound per-flow message engine.
//!
//! The message pump owns one direction of one flow: it fragments queued
//! messages, feeds the packet pump as the congestion window allows,
//! collects acknowledgments, and releases exactly one `done` to the local
//! caller per message, strictly in sequence order.
//!
//! Ack semantics: a message-ack with `ok = false` is a *nack*. A
//! *naxplanation* is a full message on the paired nack-trace flow carrying
//! the receiving consumer's error. The naxplanation is authoritative — if a
//! bare nack was already queued, the naxplanation's error replaces it. The
//! naxplanation's sender is authenticated only by the flow's symmetric key;
//! the error text itself is whatever the peer chose to say.

pub mod packet_pump;

use std::{
    collections::{BTreeMap, VecDeque},
    mem,
    time::Instant,
};

use ames_proto::NackTrace;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

pub use packet_pump::{fragment_message, PacketGift, PacketPump, StaticFragment};

/// An acknowledgment waiting for in-order release to the local caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuedAck {
    /// Positive acknowledgment
    Ok,
    /// Bare negative acknowledgment, no explanation yet
    Nack,
    /// Negative acknowledgment with the consumer's error
    Naxplanation(NackTrace),
}

/// Effects the message pump asks its owner to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpGift {
    /// Encrypt and transmit this fragment
    Send(StaticFragment),
    /// Report a message's final outcome to the local caller
    Done {
        /// The message being concluded
        num: u32,
        /// `None` for success, the failure report otherwise
        error: Option<NackTrace>,
    },
    /// Arm the flow's retransmit timer
    Wait(Instant),
    /// Cancel the flow's retransmit timer
    Rest,
}

/// Serializable pump snapshot: watermarks, queued outcomes, and every
/// not-yet-acked message blob (in-flight fragments fold back into the
/// unsent queue; they are retransmitted after restore and deduplicated by
/// the receiving sink).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpSnapshot {
    /// Lowest unacked message number
    pub current: u32,
    /// Next message number to assign
    pub next: u32,
    /// Out-of-order outcomes awaiting release
    pub queued: Vec<(u32, QueuedAck)>,
    /// Unacked message blobs by number
    pub unsent: Vec<(u32, Bytes)>,
}

/// Sender side of one flow.
#[derive(Debug, Clone)]
pub struct MessagePump {
    /// Lowest unacked message number
    current: u32,
    /// Next message number to assign
    next: u32,
    /// Whole messages not yet fragmented, FIFO
    unsent_messages: VecDeque<(u32, Bytes)>,
    /// Remaining fragments of the message currently being sent
    unsent_fragments: Vec<StaticFragment>,
    /// Outcomes heard out of order, awaiting release at `current`
    queued_acks: BTreeMap<u32, QueuedAck>,
    packet_pump: PacketPump,
}

impl MessagePump {
    /// A fresh flow starting at message zero.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            current: 0,
            next: 0,
            unsent_messages: VecDeque::new(),
            unsent_fragments: Vec::new(),
            queued_acks: BTreeMap::new(),
            packet_pump: PacketPump::new(now),
        }
    }

    /// Queue a message blob and push fragments into the window.
    ///
    /// Returns the sequence number assigned to the message.
    pub fn memo(&mut self, now: Instant, blob: Bytes, gifts: &mut Vec<PumpGift>) -> u32 {
        let num = self.next;
        self.next += 1;
        self.unsent_messages.push_back((num, blob));
        self.fill(now, gifts);
        num
    }

    /// A fragment ack arrived. Out-of-range acks are ignored.
    pub fn hear_fragment_ack(
        &mut self,
        now: Instant,
        num: u32,
        index: u32,
        gifts: &mut Vec<PumpGift>,
    ) {
        if num < self.current || num >= self.next {
            return;
        }
        let mut inner = Vec::new();
        self.packet_pump.hear_fragment(now, num, index, &mut inner);
        extend(gifts, inner);
        self.fill(now, gifts);
    }

    /// A message ack arrived: queue its outcome, flush the packet pump for
    /// that message, and release everything now contiguous at `current`.
    ///
    /// Duplicate and out-of-range acks are silently ignored — an upstream
    /// crash that replays acks must not block the flow or touch congestion
    /// state.
    pub fn hear_message_ack(&mut self, now: Instant, num: u32, ok: bool, gifts: &mut Vec<PumpGift>) {
        if num < self.current || num >= self.next {
            return;
        }
        if self.queued_acks.contains_key(&num) {
            return;
        }

        let mut inner = Vec::new();
        self.packet_pump.flush_message(now, num, &mut inner);
        extend(gifts, inner);
        self.discard_unsent(num);

        self.queued_acks
            .insert(num, if ok { QueuedAck::Ok } else { QueuedAck::Nack });
        self.drain(gifts);
        self.fill(now, gifts);
    }

    /// A naxplanation arrived on the paired nack-trace flow.
    ///
    /// Authoritative: it implies the nack and carries the error, replacing
    /// any bare nack already queued for the same message.
    pub fn near(&mut self, now: Instant, num: u32, error: NackTrace, gifts: &mut Vec<PumpGift>) {
        if num < self.current || num >= self.next {
            return;
        }

        let mut inner = Vec::new();
        self.packet_pump.flush_message(now, num, &mut inner);
        extend(gifts, inner);
        self.discard_unsent(num);

        self.queued_acks.insert(num, QueuedAck::Naxplanation(error));
        self.drain(gifts);
        self.fill(now, gifts);
    }

    /// Reset accumulated RTO backoff and retransmit the head of the queue.
    pub fn prod(&mut self, now: Instant, gifts: &mut Vec<PumpGift>) {
        let mut inner = Vec::new();
        self.packet_pump.prod(now, &mut inner);
        extend(gifts, inner);
    }

    /// The flow's retransmit timer fired.
    pub fn wake(&mut self, now: Instant, gifts: &mut Vec<PumpGift>) {
        let mut inner = Vec::new();
        self.packet_pump.wake(now, &mut inner);
        extend(gifts, inner);
    }

    /// Re-arm a missing timer (recovery after restart).
    pub fn stir(&mut self, now: Instant, gifts: &mut Vec<PumpGift>) {
        let mut inner = Vec::new();
        self.packet_pump.stir(&mut inner);
        extend(gifts, inner);
        self.fill(now, gifts);
    }

    /// Lowest unacked message number.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Next message number to assign.
    #[must_use]
    pub fn next_num(&self) -> u32 {
        self.next
    }

    /// Messages accepted but not yet concluded (clog metric).
    #[must_use]
    pub fn backlog(&self) -> u32 {
        self.next - self.current
    }

    /// True when every message has been concluded.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current == self.next
    }

    /// The congestion controller (read-only, for QoS and invariants).
    #[must_use]
    pub fn congestion(&self) -> &PacketPump {
        &self.packet_pump
    }

    /// Whether this flow has a retransmit timer armed.
    #[must_use]
    pub fn timer_armed(&self) -> bool {
        self.packet_pump.timer_armed()
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn snapshot(&self) -> PumpSnapshot {
        let mut unsent: BTreeMap<u32, Bytes> = BTreeMap::new();
        for (num, blob) in &self.unsent_messages {
            unsent.insert(*num, blob.clone());
        }
        for fragment in &self.unsent_fragments {
            unsent.insert(fragment.num, fragment.blob.clone());
        }
        for fragment in self.packet_pump.live_fragments() {
            unsent.insert(fragment.num, fragment.blob);
        }

        PumpSnapshot {
            current: self.current,
            next: self.next,
            queued: self
                .queued_acks
                .iter()
                .map(|(num, ack)| (*num, ack.clone()))
                .collect(),
            unsent: unsent.into_iter().collect(),
        }
    }

    /// Rebuild from a snapshot. In-flight timing is gone; everything
    /// unacked is queued for (re)transmission and `stir` re-arms timers.
    #[must_use]
    pub fn restore(now: Instant, snapshot: PumpSnapshot) -> Self {
        Self {
            current: snapshot.current,
            next: snapshot.next,
            unsent_messages: snapshot.unsent.into_iter().collect(),
            unsent_fragments: Vec::new(),
            queued_acks: snapshot.queued.into_iter().collect(),
            packet_pump: PacketPump::new(now),
        }
    }

    /// Move fragments into the packet pump until the window is full.
    fn fill(&mut self, now: Instant, gifts: &mut Vec<PumpGift>) {
        loop {
            if self.unsent_fragments.is_empty() {
                let Some((num, blob)) = self.unsent_messages.pop_front() else {
                    break;
                };
                self.unsent_fragments = fragment_message(num, blob);
            }

            let batch = mem::take(&mut self.unsent_fragments);
            let mut inner = Vec::new();
            let rest = self.packet_pump.feed(now, batch, &mut inner);
            extend(gifts, inner);
            if !rest.is_empty() {
                self.unsent_fragments = rest;
                break;
            }
        }
    }

    /// Release contiguous outcomes starting at `current`, in order.
    ///
    /// A bare nack blocks the drain: the caller is owed the error, and
    /// that error travels as a naxplanation on the paired flow — which is
    /// itself a reliable message, so it will arrive and upgrade the
    /// outcome.
    fn drain(&mut self, gifts: &mut Vec<PumpGift>) {
        while let Some(ack) = self.queued_acks.get(&self.current) {
            let error = match ack {
                QueuedAck::Ok => None,
                QueuedAck::Nack => break,
                QueuedAck::Naxplanation(error) => Some(error.clone()),
            };
            self.queued_acks.remove(&self.current);
            gifts.push(PumpGift::Done {
                num: self.current,
                error,
            });
            self.current += 1;
        }
    }

    /// Drop a concluded message's not-yet-sent remainder.
    fn discard_unsent(&mut self, num: u32) {
        self.unsent_fragments.retain(|f| f.num != num);
        self.unsent_messages.retain(|(n, _)| *n != num);
    }
}

fn extend(gifts: &mut Vec<PumpGift>, inner: Vec<PacketGift>) {
    gifts.extend(inner.into_iter().map(|gift| match gift {
        PacketGift::Send(fragment) => PumpGift::Send(fragment),
        PacketGift::Wait(at) => PumpGift::Wait(at),
        PacketGift::Rest => PumpGift::Rest,
    }));
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ames_proto::FRAGMENT_SIZE;

    use super::*;

    fn sends(gifts: &[PumpGift]) -> Vec<(u32, u32)> {
        gifts
            .iter()
            .filter_map(|g| match g {
                PumpGift::Send(f) => Some((f.num, f.index)),
                _ => None,
            })
            .collect()
    }

    fn dones(gifts: &[PumpGift]) -> Vec<(u32, bool)> {
        gifts
            .iter()
            .filter_map(|g| match g {
                PumpGift::Done { num, error } => Some((*num, error.is_none())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_message_lifecycle() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        let num = pump.memo(now, Bytes::from_static(b"hello"), &mut gifts);
        assert_eq!(num, 0);
        assert_eq!(sends(&gifts), vec![(0, 0)]);
        assert_eq!(pump.backlog(), 1);

        gifts.clear();
        pump.hear_message_ack(now, 0, true, &mut gifts);
        assert_eq!(dones(&gifts), vec![(0, true)]);
        assert_eq!(pump.current(), 1);
        assert!(pump.is_idle());
    }

    #[test]
    fn dones_release_in_order() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        // three one-fragment messages; open the window first
        pump.memo(now, Bytes::from_static(b"a"), &mut gifts);
        pump.hear_message_ack(now, 0, true, &mut gifts);
        gifts.clear();
        pump.memo(now, Bytes::from_static(b"b"), &mut gifts);
        pump.memo(now, Bytes::from_static(b"c"), &mut gifts);
        pump.memo(now, Bytes::from_static(b"d"), &mut gifts);

        // acks arrive out of order: 3 then 2 then 1
        gifts.clear();
        pump.hear_message_ack(now, 3, true, &mut gifts);
        assert_eq!(dones(&gifts), vec![]);
        pump.hear_message_ack(now, 2, true, &mut gifts);
        assert_eq!(dones(&gifts), vec![]);
        pump.hear_message_ack(now, 1, true, &mut gifts);
        assert_eq!(dones(&gifts), vec![(1, true), (2, true), (3, true)]);
        assert_eq!(pump.current(), 4);
    }

    #[test]
    fn naxplanation_upgrades_bare_nack() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        // two messages so the nacked one is not at `current` yet
        pump.memo(now, Bytes::from_static(b"a"), &mut gifts);
        pump.hear_message_ack(now, 0, true, &mut gifts);
        gifts.clear();
        pump.memo(now, Bytes::from_static(b"b"), &mut gifts);
        pump.memo(now, Bytes::from_static(b"c"), &mut gifts);

        // bare nack for 2 queues silently
        gifts.clear();
        pump.hear_message_ack(now, 2, false, &mut gifts);
        assert_eq!(dones(&gifts), vec![]);

        // its naxplanation replaces the bare outcome
        let trace = NackTrace {
            tag: "compute-fail".to_string(),
            notes: vec!["division by zero".to_string()],
        };
        pump.near(now, 2, trace.clone(), &mut gifts);

        // ack for 1 releases both, the second with the upgraded error
        pump.hear_message_ack(now, 1, true, &mut gifts);
        assert_eq!(
            dones(&gifts),
            vec![(1, true), (2, false)],
        );
        let last_error = gifts
            .iter()
            .rev()
            .find_map(|g| match g {
                PumpGift::Done { error, .. } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(last_error, Some(trace));
    }

    #[test]
    fn duplicate_and_out_of_range_acks_are_ignored() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        pump.memo(now, Bytes::from_static(b"a"), &mut gifts);
        pump.hear_message_ack(now, 0, true, &mut gifts);
        gifts.clear();

        pump.hear_message_ack(now, 0, false, &mut gifts); // duplicate (below current)
        pump.hear_message_ack(now, 7, true, &mut gifts); // future
        pump.hear_fragment_ack(now, 9, 0, &mut gifts); // future fragment
        assert!(gifts.is_empty());
        assert_eq!(pump.current(), 1);
    }

    #[test]
    fn large_message_fragments_and_completes() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        let blob = Bytes::from(vec![0xabu8; 3 * FRAGMENT_SIZE - 100]);
        pump.memo(now, blob, &mut gifts);

        // window of 1: only fragment 0 goes out
        assert_eq!(sends(&gifts), vec![(0, 0)]);

        // ack opens the window; the rest follows
        gifts.clear();
        pump.hear_fragment_ack(now + Duration::from_millis(10), 0, 0, &mut gifts);
        assert_eq!(sends(&gifts), vec![(0, 1), (0, 2)]);

        gifts.clear();
        pump.hear_message_ack(now + Duration::from_millis(20), 0, true, &mut gifts);
        assert_eq!(dones(&gifts), vec![(0, true)]);
        assert_eq!(pump.congestion().num_live(), 0);
    }

    #[test]
    fn ack_frees_window_for_queued_messages() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        pump.memo(now, Bytes::from_static(b"a"), &mut gifts);
        pump.memo(now, Bytes::from_static(b"b"), &mut gifts);
        assert_eq!(sends(&gifts), vec![(0, 0)]);

        gifts.clear();
        pump.hear_message_ack(now, 0, true, &mut gifts);
        // message 1 flows out as soon as the ack frees a slot
        assert_eq!(sends(&gifts), vec![(1, 0)]);
    }

    #[test]
    fn nack_discards_unsent_remainder_and_waits_for_the_trace() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        let blob = Bytes::from(vec![0u8; 5 * FRAGMENT_SIZE]);
        pump.memo(now, blob, &mut gifts);
        assert_eq!(pump.congestion().num_live(), 1);

        // the bare nack clears the queue but holds the done: the caller
        // is owed the naxplanation's error first
        gifts.clear();
        pump.hear_message_ack(now, 0, false, &mut gifts);
        assert_eq!(dones(&gifts), vec![]);
        assert_eq!(pump.congestion().num_live(), 0);
        assert_eq!(sends(&gifts), vec![]);
        assert_eq!(pump.current(), 0);

        // the naxplanation releases it
        let trace = NackTrace {
            tag: "exit".to_string(),
            notes: Vec::new(),
        };
        pump.near(now, 0, trace, &mut gifts);
        assert_eq!(dones(&gifts), vec![(0, false)]);
        assert!(pump.is_idle());
    }

    #[test]
    fn snapshot_restore_preserves_watermarks_and_blobs() {
        let now = Instant::now();
        let mut pump = MessagePump::new(now);
        let mut gifts = Vec::new();

        pump.memo(now, Bytes::from_static(b"sent"), &mut gifts);
        pump.memo(now, Bytes::from_static(b"queued"), &mut gifts);
        pump.hear_message_ack(now, 0, true, &mut gifts);

        let snapshot = pump.snapshot();
        assert_eq!(snapshot.current, 1);
        assert_eq!(snapshot.next, 2);
        assert_eq!(snapshot.unsent.len(), 1);

        let mut restored = MessagePump::restore(now, snapshot);
        gifts.clear();
        restored.stir(now, &mut gifts);
        // the unacked message is retransmitted from the top
        assert_eq!(sends(&gifts), vec![(1, 0)]);
    }
}
