//! Packet-level congestion controller and retransmit queue.
//!
//! One packet pump lives inside each outbound flow. It holds the in-flight
//! fragments in a queue ordered by `(message, fragment)`, decides how many
//! new fragments the window admits, and reacts to acks, skips, and
//! retransmission timeouts in the TCP style: slow start below `ssthresh`,
//! probabilistic congestion avoidance above it, multiplicative backoff on
//! timeout.
//!
//! The controller is fully deterministic. The one place TCP would flip a
//! coin — growing the window with probability `1/cwnd` — hashes the event
//! timestamp instead, so replaying an event log reproduces the exact same
//! window evolution.

use std::{
    cmp::{max, min},
    collections::BTreeMap,
    hash::Hasher,
    time::{Duration, Instant},
};

use ames_proto::{Fragment, FRAGMENT_SIZE};
use bytes::Bytes;
use rustc_hash::FxHasher;

/// Lower clamp on the retransmission timeout.
pub const RTO_MIN: Duration = Duration::from_millis(200);
/// Upper clamp on the retransmission timeout.
pub const RTO_MAX: Duration = Duration::from_secs(5);

const INITIAL_RTT: Duration = Duration::from_secs(1);
const INITIAL_RTTVAR: Duration = Duration::from_millis(250);
const INITIAL_SSTHRESH: u32 = 10_000;

/// Skips before a live packet is considered lost outside recovery.
const SKIP_THRESHOLD: u32 = 3;

/// An unfragmented view of one fragment: the whole message blob plus the
/// coordinates of the slice.
///
/// The 1024-byte slice is taken by [`StaticFragment::data`] at encryption
/// time; until then every fragment of a message shares one `Bytes` handle,
/// so queueing a large message costs one allocation, not one per fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFragment {
    /// Message sequence number within the flow
    pub num: u32,
    /// Total fragments in the message
    pub total: u32,
    /// This fragment's index
    pub index: u32,
    /// The whole message blob
    pub blob: Bytes,
}

impl StaticFragment {
    /// The slice of the blob this fragment carries.
    #[must_use]
    pub fn data(&self) -> Bytes {
        let start = min(self.blob.len(), self.index as usize * FRAGMENT_SIZE);
        let end = min(self.blob.len(), start + FRAGMENT_SIZE);
        self.blob.slice(start..end)
    }

    /// The wire form of this fragment.
    #[must_use]
    pub fn to_wire(&self) -> Fragment {
        Fragment {
            total: self.total,
            index: self.index,
            data: self.data(),
        }
    }
}

/// Split a message blob into its fragment views.
#[must_use]
pub fn fragment_message(num: u32, blob: Bytes) -> Vec<StaticFragment> {
    let total = max(1, blob.len().div_ceil(FRAGMENT_SIZE)) as u32;
    (0..total)
        .map(|index| StaticFragment {
            num,
            total,
            index,
            blob: blob.clone(),
        })
        .collect()
}

/// Effects the packet pump asks its owner to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketGift {
    /// Encrypt and transmit this fragment
    Send(StaticFragment),
    /// Arm the flow's retransmit timer for this instant
    Wait(Instant),
    /// Cancel the flow's retransmit timer
    Rest,
}

#[derive(Debug, Clone)]
struct Live {
    sent_at: Instant,
    tries: u32,
    skips: u32,
    fragment: StaticFragment,
}

/// Congestion controller and retransmit queue for one flow.
#[derive(Debug, Clone)]
pub struct PacketPump {
    /// Reference point for the deterministic window-growth hash
    epoch: Instant,
    live: BTreeMap<(u32, u32), Live>,
    cwnd: u32,
    ssthresh: u32,
    rtt: Duration,
    rttvar: Duration,
    rto: Duration,
    num_live: u32,
    counter: u64,
    scheduled: Option<Instant>,
}

impl PacketPump {
    /// A fresh pump: window of one, generous slow-start threshold.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            live: BTreeMap::new(),
            cwnd: 1,
            ssthresh: INITIAL_SSTHRESH,
            rtt: INITIAL_RTT,
            rttvar: INITIAL_RTTVAR,
            rto: clamp_rto(INITIAL_RTT + 4 * INITIAL_RTTVAR),
            num_live: 0,
            counter: 0,
            scheduled: None,
        }
    }

    /// Accept as many fragments as the window admits, emit them, and
    /// return the tail that must stay queued.
    ///
    /// Returning the unsent remainder (rather than buffering internally)
    /// gives the message pump direct visibility into backpressure.
    pub fn feed(
        &mut self,
        now: Instant,
        mut fragments: Vec<StaticFragment>,
        gifts: &mut Vec<PacketGift>,
    ) -> Vec<StaticFragment> {
        let slots = self.cwnd.saturating_sub(self.num_live) as usize;
        let taken = min(slots, fragments.len());
        let rest = fragments.split_off(taken);

        for fragment in fragments {
            self.num_live += 1;
            self.live.insert(
                (fragment.num, fragment.index),
                Live {
                    sent_at: now,
                    tries: 1,
                    skips: 0,
                    fragment: fragment.clone(),
                },
            );
            gifts.push(PacketGift::Send(fragment));
        }

        self.reset_timer(gifts);
        rest
    }

    /// Process a fragment ack.
    ///
    /// A fresh ack updates the window and RTT estimate and sweeps the
    /// packets still live before the acked one. Duplicate and unknown acks
    /// are ignored entirely — congestion state is unaffected, so an
    /// upstream crash that replays acks cannot distort the window.
    pub fn hear_fragment(
        &mut self,
        now: Instant,
        num: u32,
        index: u32,
        gifts: &mut Vec<PacketGift>,
    ) {
        let key = (num, index);
        let Some(live) = self.live.remove(&key) else {
            return;
        };
        self.num_live -= 1;
        self.counter += 1;

        self.grow_window(now);
        if live.tries == 1 {
            self.update_rtt(now.saturating_duration_since(live.sent_at));
        }

        self.sweep(now, key, gifts);
        self.reset_timer(gifts);
    }

    /// A message ack implies every fragment ack for that message: drop all
    /// of its live packets and sweep what precedes them.
    pub fn flush_message(&mut self, now: Instant, num: u32, gifts: &mut Vec<PacketGift>) {
        let keys: Vec<(u32, u32)> = self
            .live
            .range((num, 0)..=(num, u32::MAX))
            .map(|(key, _)| *key)
            .collect();
        for key in &keys {
            self.live.remove(key);
            self.num_live -= 1;
        }

        if !keys.is_empty() {
            self.sweep(now, (num, 0), gifts);
        }
        self.reset_timer(gifts);
    }

    /// The retransmit timer fired.
    ///
    /// A wake that arrives before the head packet's deadline (stale timer,
    /// clock jitter) just rearms. A real timeout backs off: threshold
    /// halves, window collapses to one, RTO doubles, and the head of the
    /// queue goes out again.
    pub fn wake(&mut self, now: Instant, gifts: &mut Vec<PacketGift>) {
        self.scheduled = None;

        let Some(deadline) = self
            .live
            .values()
            .next()
            .map(|head| head.sent_at + self.rto)
        else {
            return;
        };
        if now < deadline {
            self.reset_timer(gifts);
            return;
        }

        self.ssthresh = max(1, self.cwnd / 2);
        self.cwnd = 1;
        self.rto = clamp_rto(self.rto * 2);

        if let Some(head) = self.live.values_mut().next() {
            head.sent_at = now;
            head.tries += 1;
            gifts.push(PacketGift::Send(head.fragment.clone()));
        }
        self.reset_timer(gifts);
    }

    /// Congestion reset requested from above (the peer was prodded).
    ///
    /// Drops the accumulated RTO backoff back to the current estimate and
    /// retransmits the head of the queue. The window is left alone: the
    /// path's capacity estimate is still the best information we have.
    pub fn prod(&mut self, now: Instant, gifts: &mut Vec<PacketGift>) {
        if self.live.is_empty() {
            return;
        }
        self.rto = clamp_rto(self.rtt + 4 * self.rttvar);

        if let Some(head) = self.live.values_mut().next() {
            head.sent_at = now;
            head.tries += 1;
            gifts.push(PacketGift::Send(head.fragment.clone()));
        }
        self.reset_timer(gifts);
    }

    /// Arm the timer if live packets exist but no timer does (recovery
    /// after restart).
    pub fn stir(&mut self, gifts: &mut Vec<PacketGift>) {
        if self.scheduled.is_none() && !self.live.is_empty() {
            self.reset_timer(gifts);
        }
    }

    /// In-flight packet count.
    #[must_use]
    pub fn num_live(&self) -> u32 {
        self.num_live
    }

    /// Current congestion window, in packets.
    #[must_use]
    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    /// Current slow-start threshold.
    #[must_use]
    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    /// Current retransmission timeout.
    #[must_use]
    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Slow start holds while the window is below the threshold.
    #[must_use]
    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    /// Recovery holds while more packets are in flight than the window
    /// admits (the window shrank under us).
    #[must_use]
    pub fn in_recovery(&self) -> bool {
        self.num_live > self.cwnd
    }

    /// Keys of the live queue, in order (for invariant checks).
    #[must_use]
    pub fn live_keys(&self) -> Vec<(u32, u32)> {
        self.live.keys().copied().collect()
    }

    /// The fragments still in flight (for snapshots).
    #[must_use]
    pub fn live_fragments(&self) -> Vec<StaticFragment> {
        self.live.values().map(|l| l.fragment.clone()).collect()
    }

    /// Monotonic ack counter (deterministic tie-break source).
    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Whether a retransmit timer is currently armed.
    #[must_use]
    pub fn timer_armed(&self) -> bool {
        self.scheduled.is_some()
    }

    /// Grow the window: always in slow start, with probability `1/cwnd`
    /// in congestion avoidance. The probability is realized by hashing the
    /// event time, keeping replay deterministic.
    fn grow_window(&mut self, now: Instant) {
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            return;
        }
        let mut hasher = FxHasher::default();
        hasher.write_u128(now.saturating_duration_since(self.epoch).as_nanos());
        if hasher.finish() % u64::from(self.cwnd) == 0 {
            self.cwnd += 1;
        }
    }

    /// RFC 6298-style EWMA with weight 7/8; the deviation uses the
    /// pre-update smoothed RTT.
    fn update_rtt(&mut self, sample: Duration) {
        let deviation = if sample > self.rtt {
            sample - self.rtt
        } else {
            self.rtt - sample
        };
        self.rttvar = (deviation + 7 * self.rttvar) / 8;
        self.rtt = (sample + 7 * self.rtt) / 8;
        self.rto = clamp_rto(self.rtt + 4 * self.rttvar);
    }

    /// Walk the live packets that precede an acked key: each gains a skip,
    /// and is resent when skipped out (three skips, or any skip while in
    /// recovery) or when its own deadline has already passed. The first
    /// skip-triggered resend outside recovery halves the window, once.
    fn sweep(&mut self, now: Instant, acked: (u32, u32), gifts: &mut Vec<PacketGift>) {
        let in_recovery = self.num_live > self.cwnd;
        let rto = self.rto;
        let mut cwnd = self.cwnd;
        let mut halved = false;
        let mut resends = Vec::new();

        for live in self.live.range_mut(..acked).map(|(_, l)| l) {
            live.skips += 1;
            let skipped_out = live.tries <= 1 && (in_recovery || live.skips >= SKIP_THRESHOLD);
            let expired = live.sent_at + rto <= now;
            if !(skipped_out || expired) {
                continue;
            }

            if skipped_out && !in_recovery && !halved {
                cwnd = max(2, cwnd / 2);
                halved = true;
            }
            live.sent_at = now;
            live.tries += 1;
            live.skips = 0;
            resends.push(live.fragment.clone());
        }

        self.cwnd = cwnd;
        gifts.extend(resends.into_iter().map(PacketGift::Send));
    }

    /// Timer discipline: one timer per flow, keyed off the head of the
    /// queue. Cancel before rearm; no live packets means no timer.
    fn reset_timer(&mut self, gifts: &mut Vec<PacketGift>) {
        let next = self
            .live
            .values()
            .next()
            .map(|head| head.sent_at + self.rto);
        if next == self.scheduled {
            return;
        }
        if self.scheduled.is_some() {
            gifts.push(PacketGift::Rest);
        }
        if let Some(at) = next {
            gifts.push(PacketGift::Wait(at));
        }
        self.scheduled = next;
    }
}

fn clamp_rto(rto: Duration) -> Duration {
    rto.clamp(RTO_MIN, RTO_MAX)
}
