//! Inbound per-flow message engine.
//!
//! The sink reassembles fragments into messages, suppresses duplicates,
//! schedules acks, and hands completed messages to the local consumer one
//! at a time. Two watermarks partition the sequence space: `last_acked` is
//! the lowest message number not yet confirmed by the consumer,
//! `last_heard` the lowest not yet fully reassembled, with
//! `last_acked <= last_heard` always.
//!
//! Ack policy is deliberately asymmetric around the final fragment. For
//! anything at or above `last_acked`, a final fragment is never
//! fragment-acked: the only honest answer to "did the whole message land"
//! is the message-ack, and that cannot be sent until the consumer has
//! spoken. Below `last_acked` the outcome is already known, so a duplicate
//! final fragment gets the cached message-ack replayed instead of
//! reprocessing.

use std::{
    collections::{BTreeMap, HashSet, VecDeque},
    time::Instant,
};

use ames_proto::{Ack, Fragment};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::AmesError;

/// How many messages past `last_acked` we accept before shedding.
const RECEIVE_WINDOW: u32 = 10;

/// Effects the sink asks its owner to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkGift {
    /// Seal and transmit an acknowledgment
    Ack {
        /// Message the ack refers to
        num: u32,
        /// The acknowledgment itself
        ack: Ack,
    },
    /// Offer a completed message to the local consumer
    Deliver {
        /// Message sequence number
        num: u32,
        /// Reassembled message blob
        blob: Bytes,
    },
}

#[derive(Debug, Clone)]
struct Partial {
    total: u32,
    fragments: BTreeMap<u32, Bytes>,
}

impl Partial {
    fn new(total: u32) -> Self {
        Self {
            total,
            fragments: BTreeMap::new(),
        }
    }

    fn is_complete(&self) -> bool {
        self.fragments.len() as u32 == self.total
    }

    fn assemble(self) -> Bytes {
        let mut blob = BytesMut::new();
        for fragment in self.fragments.into_values() {
            blob.extend_from_slice(&fragment);
        }
        blob.freeze()
    }
}

#[derive(Debug, Clone)]
struct PendingMessage {
    num: u32,
    blob: Bytes,
    heard_at: Instant,
}

/// Serializable sink snapshot. Partial reassemblies are dropped — the
/// sender retransmits anything unacked — but messages already heard and
/// awaiting the consumer are kept so nothing is lost or re-requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkSnapshot {
    /// Lowest message number not yet consumer-confirmed
    pub last_acked: u32,
    /// Lowest message number not yet fully reassembled
    pub last_heard: u32,
    /// Messages the consumer rejected, kept until the sender drops them
    pub nax: Vec<u32>,
    /// Completed messages awaiting consumer confirmation
    pub pending: Vec<(u32, Bytes)>,
}

/// Receiver side of one flow.
#[derive(Debug, Clone)]
pub struct MessageSink {
    /// Lowest message number not yet confirmed by the consumer
    last_acked: u32,
    /// Lowest message number not yet fully reassembled
    last_heard: u32,
    /// Partial reassemblies, by message number
    live: BTreeMap<u32, Partial>,
    /// Completed messages awaiting the consumer, head is outstanding
    pending: VecDeque<PendingMessage>,
    /// Messages the consumer rejected; retained for duplicate suppression
    /// until the sender acknowledges the nack
    nax: HashSet<u32>,
}

impl MessageSink {
    /// A fresh flow expecting message zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_acked: 0,
            last_heard: 0,
            live: BTreeMap::new(),
            pending: VecDeque::new(),
            nax: HashSet::new(),
        }
    }

    /// Process one inbound fragment.
    ///
    /// # Errors
    ///
    /// Returns an [`AmesError`] when fragments of one message disagree on
    /// the fragment count or index range — a protocol violation that kills
    /// the flow rather than risking a corrupt reassembly.
    pub fn hear(
        &mut self,
        now: Instant,
        num: u32,
        fragment: Fragment,
        gifts: &mut Vec<SinkGift>,
    ) -> Result<(), AmesError> {
        // sliding window: shed everything too far ahead
        if num >= self.last_acked.saturating_add(RECEIVE_WINDOW) {
            return Ok(());
        }

        let is_final = fragment.index + 1 >= fragment.total;

        if num < self.last_acked {
            // concluded message: replay the cached outcome for a final
            // fragment, plain fragment-ack otherwise
            if is_final {
                gifts.push(SinkGift::Ack {
                    num,
                    ack: Ack::Message {
                        ok: !self.nax.contains(&num),
                        lag_micros: 0,
                    },
                });
            } else {
                gifts.push(SinkGift::Ack {
                    num,
                    ack: Ack::Fragment {
                        index: fragment.index,
                    },
                });
            }
            return Ok(());
        }

        if num < self.last_heard {
            // reassembled but the consumer has not spoken: never commit to
            // a message-ack early, so the final fragment is dropped
            if !is_final {
                gifts.push(SinkGift::Ack {
                    num,
                    ack: Ack::Fragment {
                        index: fragment.index,
                    },
                });
            }
            return Ok(());
        }

        // live region: insert into the partial reassembly
        let partial = self
            .live
            .entry(num)
            .or_insert_with(|| Partial::new(fragment.total));
        if partial.total != fragment.total {
            return Err(AmesError::FragmentCountMismatch {
                num,
                had: partial.total,
                got: fragment.total,
            });
        }
        if fragment.index >= partial.total {
            return Err(AmesError::FragmentOutOfRange {
                index: fragment.index,
                total: partial.total,
            });
        }

        partial.fragments.entry(fragment.index).or_insert(fragment.data);

        // ack unless this fragment completes the message: the completing
        // fragment is answered by the message-ack, after the consumer
        if !partial.is_complete() {
            gifts.push(SinkGift::Ack {
                num,
                ack: Ack::Fragment {
                    index: fragment.index,
                },
            });
        }

        self.advance(now, gifts);
        Ok(())
    }

    /// The consumer finished with the outstanding message.
    ///
    /// Pops it, advances `last_acked`, remembers a rejection in `nax`,
    /// emits the message-ack, and offers the next pending message.
    /// Returns the number of the message concluded, if one was pending.
    pub fn done(&mut self, now: Instant, ok: bool, gifts: &mut Vec<SinkGift>) -> Option<u32> {
        let pending = self.pending.pop_front()?;
        self.last_acked += 1;
        if !ok {
            self.nax.insert(pending.num);
        }

        let lag = now.saturating_duration_since(pending.heard_at);
        gifts.push(SinkGift::Ack {
            num: pending.num,
            ack: Ack::Message {
                ok,
                lag_micros: lag.as_micros() as u64,
            },
        });

        if let Some(next) = self.pending.front() {
            gifts.push(SinkGift::Deliver {
                num: next.num,
                blob: next.blob.clone(),
            });
        }
        Some(pending.num)
    }

    /// The sender acknowledged our nack: the rejection no longer needs to
    /// be remembered for duplicate suppression.
    pub fn drop_nack(&mut self, num: u32) {
        self.nax.remove(&num);
    }

    /// Re-offer the outstanding message (recovery after restart).
    pub fn stir(&mut self, gifts: &mut Vec<SinkGift>) {
        if let Some(head) = self.pending.front() {
            gifts.push(SinkGift::Deliver {
                num: head.num,
                blob: head.blob.clone(),
            });
        }
    }

    /// Lowest message number not yet consumer-confirmed.
    #[must_use]
    pub fn last_acked(&self) -> u32 {
        self.last_acked
    }

    /// Lowest message number not yet fully reassembled.
    #[must_use]
    pub fn last_heard(&self) -> u32 {
        self.last_heard
    }

    /// Whether `num` is remembered as nacked.
    #[must_use]
    pub fn is_nacked(&self, num: u32) -> bool {
        self.nax.contains(&num)
    }

    /// Snapshot for persistence.
    #[must_use]
    pub fn snapshot(&self) -> SinkSnapshot {
        SinkSnapshot {
            last_acked: self.last_acked,
            last_heard: self.last_heard,
            nax: self.nax.iter().copied().collect(),
            pending: self
                .pending
                .iter()
                .map(|p| (p.num, p.blob.clone()))
                .collect(),
        }
    }

    /// Rebuild from a snapshot; `stir` re-offers the outstanding message.
    #[must_use]
    pub fn restore(now: Instant, snapshot: SinkSnapshot) -> Self {
        Self {
            last_acked: snapshot.last_acked,
            last_heard: snapshot.last_heard,
            live: BTreeMap::new(),
            pending: snapshot
                .pending
                .into_iter()
                .map(|(num, blob)| PendingMessage {
                    num,
                    blob,
                    heard_at: now,
                })
                .collect(),
            nax: snapshot.nax.into_iter().collect(),
        }
    }

    /// Advance `last_heard` over every message now complete, enqueueing
    /// each for the consumer in order. Only the queue head is ever
    /// outstanding with the consumer.
    fn advance(&mut self, now: Instant, gifts: &mut Vec<SinkGift>) {
        while self
            .live
            .get(&self.last_heard)
            .is_some_and(Partial::is_complete)
        {
            let partial = self
                .live
                .remove(&self.last_heard)
                .unwrap_or_else(|| unreachable!("checked by loop condition"));
            let num = self.last_heard;
            self.last_heard += 1;

            let blob = partial.assemble();
            self.pending.push_back(PendingMessage {
                num,
                blob: blob.clone(),
                heard_at: now,
            });
            if self.pending.len() == 1 {
                gifts.push(SinkGift::Deliver { num, blob });
            }
        }
    }
}

impl Default for MessageSink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(total: u32, index: u32, data: &[u8]) -> Fragment {
        Fragment {
            total,
            index,
            data: Bytes::copy_from_slice(data),
        }
    }

    fn acks(gifts: &[SinkGift]) -> Vec<(u32, Ack)> {
        gifts
            .iter()
            .filter_map(|g| match g {
                SinkGift::Ack { num, ack } => Some((*num, *ack)),
                _ => None,
            })
            .collect()
    }

    fn delivers(gifts: &[SinkGift]) -> Vec<u32> {
        gifts
            .iter()
            .filter_map(|g| match g {
                SinkGift::Deliver { num, .. } => Some(*num),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_fragment_message_delivers_without_a_fragment_ack() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(1, 0, b"hello"), &mut gifts).unwrap();

        // final fragment: no fragment-ack, only delivery
        assert_eq!(acks(&gifts), vec![]);
        assert_eq!(delivers(&gifts), vec![0]);
        assert_eq!(sink.last_heard(), 1);
        assert_eq!(sink.last_acked(), 0);

        gifts.clear();
        sink.done(now, true, &mut gifts);
        assert_eq!(
            acks(&gifts),
            vec![(
                0,
                Ack::Message {
                    ok: true,
                    lag_micros: 0
                }
            )]
        );
        assert_eq!(sink.last_acked(), 1);
    }

    #[test]
    fn multi_fragment_reassembly_in_any_order() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(3, 2, b"!"), &mut gifts).unwrap();
        sink.hear(now, 0, frag(3, 0, b"he"), &mut gifts).unwrap();
        assert_eq!(delivers(&gifts), vec![]);
        // every non-completing fragment is acked, the last-index one too
        assert_eq!(
            acks(&gifts),
            vec![(0, Ack::Fragment { index: 2 }), (0, Ack::Fragment { index: 0 })]
        );

        // fragment 1 completes the message: no fragment-ack for it
        sink.hear(now, 0, frag(3, 1, b"llo"), &mut gifts).unwrap();
        let deliver = gifts
            .iter()
            .find_map(|g| match g {
                SinkGift::Deliver { blob, .. } => Some(blob.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(&deliver[..], b"hello!");
        assert_eq!(sink.last_heard(), 1);
    }

    #[test]
    fn window_edge() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        // last_acked = 0: message 9 accepted, message 10 shed
        sink.hear(now, 9, frag(2, 0, b"in"), &mut gifts).unwrap();
        assert_eq!(acks(&gifts), vec![(9, Ack::Fragment { index: 0 })]);

        gifts.clear();
        sink.hear(now, 10, frag(2, 0, b"out"), &mut gifts).unwrap();
        assert!(gifts.is_empty());
    }

    #[test]
    fn duplicate_final_fragment_replays_cached_ack() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(1, 0, b"msg"), &mut gifts).unwrap();
        sink.done(now, false, &mut gifts);
        assert!(sink.is_nacked(0));

        // retransmitted final fragment: cached (negative) message-ack, no
        // second delivery
        gifts.clear();
        sink.hear(now, 0, frag(1, 0, b"msg"), &mut gifts).unwrap();
        assert_eq!(
            acks(&gifts),
            vec![(
                0,
                Ack::Message {
                    ok: false,
                    lag_micros: 0
                }
            )]
        );
        assert_eq!(delivers(&gifts), vec![]);

        // once the sender acknowledges the nack, the memory is dropped
        sink.drop_nack(0);
        assert!(!sink.is_nacked(0));
    }

    #[test]
    fn heard_but_unacked_never_reacks_final_fragment() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(2, 0, b"ab"), &mut gifts).unwrap();
        sink.hear(now, 0, frag(2, 1, b"cd"), &mut gifts).unwrap();
        assert_eq!(sink.last_heard(), 1);

        // consumer still deciding; duplicates arrive
        gifts.clear();
        sink.hear(now, 0, frag(2, 0, b"ab"), &mut gifts).unwrap();
        assert_eq!(acks(&gifts), vec![(0, Ack::Fragment { index: 0 })]);

        gifts.clear();
        sink.hear(now, 0, frag(2, 1, b"cd"), &mut gifts).unwrap();
        // the final fragment is dropped, not acked
        assert!(gifts.is_empty());
    }

    #[test]
    fn one_message_outstanding_at_a_time() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(1, 0, b"first"), &mut gifts).unwrap();
        sink.hear(now, 1, frag(1, 0, b"second"), &mut gifts).unwrap();

        // only the first is offered
        assert_eq!(delivers(&gifts), vec![0]);
        assert_eq!(sink.last_heard(), 2);

        // confirming it releases the second
        gifts.clear();
        sink.done(now, true, &mut gifts);
        assert_eq!(delivers(&gifts), vec![1]);
    }

    #[test]
    fn fragment_count_mismatch_is_a_protocol_violation() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(3, 0, b"a"), &mut gifts).unwrap();
        let result = sink.hear(now, 0, frag(4, 1, b"b"), &mut gifts);
        assert!(matches!(
            result,
            Err(AmesError::FragmentCountMismatch { had: 3, got: 4, .. })
        ));
    }

    #[test]
    fn out_of_order_completion_waits_for_the_gap() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        // message 1 completes before message 0
        sink.hear(now, 1, frag(1, 0, b"second"), &mut gifts).unwrap();
        assert_eq!(delivers(&gifts), vec![]);
        assert_eq!(sink.last_heard(), 0);

        sink.hear(now, 0, frag(1, 0, b"first"), &mut gifts).unwrap();
        // both complete now; delivery is in order, one at a time
        assert_eq!(delivers(&gifts), vec![0]);
        assert_eq!(sink.last_heard(), 2);
    }

    #[test]
    fn reassembled_length_is_sum_of_fragments() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        let parts: [&[u8]; 3] = [b"aa", b"bbb", b"c"];
        for (i, part) in parts.iter().enumerate() {
            sink.hear(now, 0, frag(3, i as u32, part), &mut gifts)
                .unwrap();
        }
        let blob = gifts
            .iter()
            .find_map(|g| match g {
                SinkGift::Deliver { blob, .. } => Some(blob.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(blob.len(), parts.iter().map(|p| p.len()).sum::<usize>());
    }

    proptest::proptest! {
        /// Whatever arrives, in whatever order, the watermarks never
        /// cross and never run ahead of the receive window.
        #[test]
        fn watermarks_stay_ordered(
            fragments in proptest::collection::vec(
                (0u32..15, 1u32..4, 0u32..4),
                0..60,
            ),
        ) {
            let now = Instant::now();
            let mut sink = MessageSink::new();
            let mut gifts = Vec::new();

            for (num, total, index) in fragments {
                // protocol violations abort the event; state stays sane
                let _ = sink.hear(now, num, frag(total, index.min(total - 1), b"x"), &mut gifts);
                proptest::prop_assert!(sink.last_acked() <= sink.last_heard());
                proptest::prop_assert!(sink.last_heard() < sink.last_acked() + 10 + 1);

                // keep the consumer responsive half the time
                if sink.last_heard() % 2 == 0 {
                    sink.done(now, true, &mut gifts);
                }
                proptest::prop_assert!(sink.last_acked() <= sink.last_heard());
            }
        }
    }

    #[test]
    fn snapshot_restore_keeps_pending_and_nax() {
        let now = Instant::now();
        let mut sink = MessageSink::new();
        let mut gifts = Vec::new();

        sink.hear(now, 0, frag(1, 0, b"a"), &mut gifts).unwrap();
        sink.done(now, false, &mut gifts);
        sink.hear(now, 1, frag(1, 0, b"b"), &mut gifts).unwrap();

        let snapshot = sink.snapshot();
        let mut restored = MessageSink::restore(now, snapshot);
        assert_eq!(restored.last_acked(), 1);
        assert_eq!(restored.last_heard(), 2);
        assert!(restored.is_nacked(0));

        gifts.clear();
        restored.stir(&mut gifts);
        assert_eq!(delivers(&gifts), vec![1]);
    }
}
