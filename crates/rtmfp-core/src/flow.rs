// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One-way receive stream paired with a remote writer (§3 "Flow", §4.4).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rtmfp_proto::{Ack, AckRun, Fragment, FragmentFlags, RECEIVE_BUFFER_IDLE};
use tracing::{debug, trace, warn};

/// A flow is reaped 120s after its `END` flag is observed (§3 "Flow").
pub const FLOW_REAP_DELAY: Duration = Duration::from_secs(120);

/// In-progress reassembly state: at most one message is ever "in flight"
/// per flow (§4.4 "Reassembly").
#[derive(Debug)]
struct InProgress {
    bytes: BytesMut,
}

/// A one-way receive channel keyed by a 64-bit id scoped to a session
/// (§3 "Flow").
#[derive(Debug)]
pub struct Flow {
    id: u64,
    signature: Bytes,
    writer_ref: Option<u16>,
    next_stage: u32,
    buffer: BTreeMap<u32, Fragment>,
    lost_count: u32,
    completed: bool,
    complete_at: Option<Instant>,
    in_progress: Option<InProgress>,
}

impl Flow {
    /// Create a new flow, keyed by `id`, for the given flow-header
    /// signature and optional fullduplex writer back-reference.
    #[must_use]
    pub fn new(id: u64, signature: Bytes, writer_ref: Option<u16>) -> Self {
        Self {
            id,
            signature,
            writer_ref,
            next_stage: 1,
            buffer: BTreeMap::new(),
            lost_count: 0,
            completed: false,
            complete_at: None,
            in_progress: None,
        }
    }

    /// Flow id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flow-purpose signature, used by the session to dispatch to the
    /// correct handler.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Back-referenced writer id, if the peer declared fullduplex pairing.
    #[must_use]
    pub fn writer_ref(&self) -> Option<u16> {
        self.writer_ref
    }

    /// Count of fragments this flow gave up waiting for and counted as lost.
    #[must_use]
    pub fn lost_count(&self) -> u32 {
        self.lost_count
    }

    /// Whether `END` has been observed and delivered.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Whether this flow is eligible for removal (`END` observed
    /// [`FLOW_REAP_DELAY`] ago).
    #[must_use]
    pub fn is_reapable(&self, now: Instant) -> bool {
        self.complete_at
            .is_some_and(|t| now.duration_since(t) >= FLOW_REAP_DELAY)
    }

    /// Feed one received fragment into this flow. Returns zero or more
    /// complete reassembled messages, in delivery order (§4.4 "Delivery
    /// algorithm").
    pub fn receive(&mut self, fragment: Fragment) -> Vec<Bytes> {
        if self.completed {
            return Vec::new();
        }
        let stage = fragment.stage;
        if stage < self.next_stage {
            trace!(flow = self.id, stage, "discarding stale fragment");
            return Vec::new();
        }
        if stage == self.next_stage {
            let mut delivered = Vec::new();
            self.deliver_one(fragment, &mut delivered);
            self.drain_buffer(&mut delivered);
            delivered
        } else {
            self.buffer.insert(stage, fragment);
            Vec::new()
        }
    }

    /// Evaluate the out-of-order gap against `delta_nack` and, if the gap
    /// exceeds it, skip ahead (§4.4: "advance `nextStage = stage −
    /// deltaNAck`").
    pub fn note_delta_nack(&mut self, stage: u32, delta_nack: u32) -> Vec<Bytes> {
        if self.completed || stage < self.next_stage {
            return Vec::new();
        }
        let gap = stage.saturating_sub(self.next_stage);
        if gap <= delta_nack {
            return Vec::new();
        }
        let skip_to = stage.saturating_sub(delta_nack);
        let skipped = skip_to.saturating_sub(self.next_stage);
        if skipped > 0 {
            warn!(
                flow = self.id,
                skipped, "advancing past unrecoverable gap, marking as lost"
            );
            self.lost_count += skipped;
            self.next_stage = skip_to;
        }
        let mut delivered = Vec::new();
        self.drain_buffer(&mut delivered);
        delivered
    }

    fn deliver_one(&mut self, fragment: Fragment, delivered: &mut Vec<Bytes>) {
        self.next_stage = fragment.stage + 1;
        if fragment.flags.contains(FragmentFlags::ABANDON) {
            debug!(flow = self.id, "abandoning in-progress message");
            self.in_progress = None;
        }
        let begins = !fragment.flags.contains(FragmentFlags::WITH_BEFOREPART);
        let continues = fragment.flags.contains(FragmentFlags::WITH_AFTERPART);

        if begins {
            let mut bytes = BytesMut::with_capacity(fragment.bytes.len());
            bytes.extend_from_slice(&fragment.bytes);
            if continues {
                self.in_progress = Some(InProgress { bytes });
            } else {
                delivered.push(bytes.freeze());
            }
        } else if let Some(mut msg) = self.in_progress.take() {
            msg.bytes.extend_from_slice(&fragment.bytes);
            if continues {
                self.in_progress = Some(msg);
            } else {
                delivered.push(msg.bytes.freeze());
            }
        } else {
            warn!(flow = self.id, "continuation fragment with no in-progress message");
        }

        if fragment.flags.contains(FragmentFlags::END) {
            self.completed = true;
            self.complete_at = Some(Instant::now());
        }
    }

    fn drain_buffer(&mut self, delivered: &mut Vec<Bytes>) {
        while let Some(fragment) = self.buffer.remove(&self.next_stage) {
            self.deliver_one(fragment, delivered);
            if self.completed {
                break;
            }
        }
    }

    /// Build the `0x51` ack chunk body for this flow's current state
    /// (§4.4 "ACK policy").
    #[must_use]
    pub fn build_ack(&self) -> Ack {
        let runs = self.selective_ack_runs();
        let receive_buffer = if self.buffer.is_empty() {
            RECEIVE_BUFFER_IDLE
        } else {
            RECEIVE_BUFFER_IDLE.saturating_sub(self.buffer.len() as u32)
        };
        Ack {
            flow_id: self.id,
            receive_buffer,
            stage_ack: self.next_stage.saturating_sub(1),
            runs,
        }
    }

    fn selective_ack_runs(&self) -> Vec<AckRun> {
        let mut runs = Vec::new();
        let mut prev = self.next_stage.saturating_sub(1);
        let mut iter = self.buffer.keys().copied().peekable();
        while let Some(start) = iter.next() {
            let gap = start - prev - 1;
            let mut run = 0u32;
            let mut last = start;
            while let Some(&next) = iter.peek() {
                if next == last + 1 {
                    run += 1;
                    last = next;
                    iter.next();
                } else {
                    break;
                }
            }
            runs.push(AckRun { gap, run });
            prev = last;
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(stage: u32, flags: FragmentFlags, body: &[u8]) -> Fragment {
        Fragment {
            stage,
            flags,
            bytes: Bytes::copy_from_slice(body),
        }
    }

    #[test]
    fn in_order_whole_messages_deliver_immediately() {
        let mut flow = Flow::new(1, Bytes::from_static(b"sig"), None);
        let delivered = flow.receive(frag(1, FragmentFlags::HEADER, b"hello"));
        assert_eq!(delivered, vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn reassembles_split_message_across_three_fragments() {
        let mut flow = Flow::new(1, Bytes::from_static(b"sig"), None);
        let none = flow.receive(frag(1, FragmentFlags::WITH_AFTERPART, b"AAA"));
        assert!(none.is_empty());
        let none = flow.receive(frag(
            2,
            FragmentFlags::WITH_BEFOREPART | FragmentFlags::WITH_AFTERPART,
            b"BBB",
        ));
        assert!(none.is_empty());
        let delivered = flow.receive(frag(3, FragmentFlags::WITH_BEFOREPART, b"CCC"));
        assert_eq!(delivered, vec![Bytes::from_static(b"AAABBBCCC")]);
    }

    #[test]
    fn out_of_order_fragment_buffers_then_drains() {
        let mut flow = Flow::new(1, Bytes::from_static(b"sig"), None);
        assert!(flow
            .receive(frag(2, FragmentFlags::HEADER, b"second"))
            .is_empty());
        let delivered = flow.receive(frag(1, FragmentFlags::HEADER, b"first"));
        assert_eq!(
            delivered,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[test]
    fn stale_fragment_is_discarded() {
        let mut flow = Flow::new(1, Bytes::from_static(b"sig"), None);
        flow.receive(frag(1, FragmentFlags::HEADER, b"a"));
        assert!(flow
            .receive(frag(1, FragmentFlags::HEADER, b"dup"))
            .is_empty());
    }

    #[test]
    fn delta_nack_gap_advances_and_counts_loss() {
        let mut flow = Flow::new(1, Bytes::from_static(b"sig"), None);
        // next_stage is 1; stage 5 arrives with deltaNAck=1, meaning
        // sender tolerates only 1 stage of slack before giving up on it.
        let delivered = flow.note_delta_nack(5, 1);
        assert!(delivered.is_empty());
        assert_eq!(flow.next_stage, 4);
        assert_eq!(flow.lost_count(), 3);
    }

    #[test]
    fn ack_reports_selective_runs_for_buffered_gaps() {
        let mut flow = Flow::new(7, Bytes::from_static(b"sig"), None);
        flow.receive(frag(1, FragmentFlags::HEADER, b"a"));
        flow.receive(frag(3, FragmentFlags::HEADER, b"c"));
        flow.receive(frag(4, FragmentFlags::HEADER, b"d"));
        let ack = flow.build_ack();
        assert_eq!(ack.flow_id, 7);
        assert_eq!(ack.stage_ack, 1);
        assert_eq!(ack.runs, vec![AckRun { gap: 1, run: 1 }]);
    }

    #[test]
    fn end_flag_completes_flow_and_blocks_further_delivery() {
        let mut flow = Flow::new(1, Bytes::from_static(b"sig"), None);
        let delivered = flow.receive(frag(1, FragmentFlags::HEADER | FragmentFlags::END, b"x"));
        assert_eq!(delivered, vec![Bytes::from_static(b"x")]);
        assert!(flow.is_completed());
        assert!(flow
            .receive(frag(2, FragmentFlags::HEADER, b"ignored"))
            .is_empty());
    }
}
