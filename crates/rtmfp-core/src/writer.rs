// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One-way reliable-or-unreliable send stream with ARQ (§3 "Writer", §4.5).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtmfp_proto::{Ack, FragmentFlags, Message, Reliability};
use tracing::{debug, trace, warn};

use crate::error::{Result, SessionError};
use crate::retry::RetryTimer;

/// A writer is reaped 130s after entering [`WriterState::NearClosed`]
/// (§3 "Writer").
pub const WRITER_REAP_DELAY: Duration = Duration::from_secs(130);

/// Writer id reserved for the main NetConnection flow (§9): its options
/// block never carries a `flowId` back-reference.
pub const MAIN_WRITER_ID: u16 = 2;

/// Conservative per-fragment payload budget, leaving room for the packet
/// header, chunk framing, and flow-header fields inside one 1192-byte
/// datagram (§6).
pub const FRAGMENT_BUDGET: usize = 900;

/// Writer lifecycle (§3 "Writer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    /// Not yet acknowledged by any peer activity.
    Opening,
    /// Normal send/ack operation.
    Opened,
    /// Close initiated; draining final acks.
    NearClosed,
    /// Fully reaped.
    Closed,
}

struct PendingMessage {
    message: Message,
}

/// One outgoing fragment still awaiting (or past) acknowledgment.
#[derive(Debug, Clone)]
struct SentFragment {
    stage: u32,
    flags: FragmentFlags,
    bytes: Bytes,
    reliable: bool,
}

/// One fragment ready to be wire-encoded by the owning session.
#[derive(Debug, Clone)]
pub struct OutgoingFragment {
    /// Assigned stage.
    pub stage: u32,
    /// Distance from the writer's last-acked stage at emission time
    /// (`stage - stageAck`), carried so the flow header's `deltaNAck`
    /// field can be filled in by the session.
    pub delta_from_ack: u32,
    /// Fragment flags.
    pub flags: FragmentFlags,
    /// Whether the first-fragment options block (signature + optional
    /// writer back-reference) must be attached.
    pub needs_options: bool,
    /// Payload bytes.
    pub bytes: Bytes,
}

/// One-way send channel keyed by a 16-bit per-session id (§3 "Writer").
pub struct Writer {
    id: u16,
    flow_id: u64,
    signature: Bytes,
    stage: u32,
    stage_ack: u32,
    pending: VecDeque<PendingMessage>,
    sent: VecDeque<SentFragment>,
    /// NAK-triggered retransmits awaiting a freshly assigned stage; once
    /// flushed they become new entries in `sent` (§4.5 "Selective NAK").
    nak_queue: VecDeque<SentFragment>,
    /// Timeout-triggered resends of fragments still tracked in `sent` under
    /// their original stage (§4.5 "Retransmission trigger").
    timeout_queue: VecDeque<SentFragment>,
    trigger: RetryTimer,
    state: WriterState,
    options_sent: bool,
    near_closed_at: Option<Instant>,
}

impl Writer {
    /// Create a new writer. `flow_id` is the remote flow id this writer
    /// answers (0 if unpaired).
    #[must_use]
    pub fn new(id: u16, flow_id: u64, signature: Bytes) -> Self {
        Self {
            id,
            flow_id,
            signature,
            stage: 1,
            stage_ack: 0,
            pending: VecDeque::new(),
            sent: VecDeque::new(),
            nak_queue: VecDeque::new(),
            timeout_queue: VecDeque::new(),
            trigger: RetryTimer::writer_retransmit(),
            state: WriterState::Opening,
            options_sent: false,
            near_closed_at: None,
        }
    }

    /// Writer id.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// The remote flow id this writer answers (0 if unpaired, §3 "Writer").
    #[must_use]
    pub fn flow_id(&self) -> u64 {
        self.flow_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Highest acknowledged stage.
    #[must_use]
    pub fn stage_ack(&self) -> u32 {
        self.stage_ack
    }

    /// Whether 130s have elapsed since [`WriterState::NearClosed`] was
    /// entered.
    #[must_use]
    pub fn is_reapable(&self, now: Instant) -> bool {
        self.near_closed_at
            .is_some_and(|t| now.duration_since(t) >= WRITER_REAP_DELAY)
    }

    /// Enqueue a message for transmission (§4.5 `write()`).
    pub fn write(&mut self, message: Message) {
        if self.state == WriterState::NearClosed || self.state == WriterState::Closed {
            warn!(writer = self.id, "write() after close, dropping message");
            return;
        }
        if self.pending.len() > 100 {
            warn!(writer = self.id, "pending queue exceeds 100 messages");
        }
        self.pending.push_back(PendingMessage { message });
    }

    fn should_attach_options(&self) -> bool {
        !self.options_sent
    }

    fn writer_ref_for_options(&self) -> Option<u16> {
        if self.flow_id == 0 || self.id <= MAIN_WRITER_ID {
            None
        } else {
            Some(self.id)
        }
    }

    /// Back-reference writer id to attach to the first fragment's options
    /// block, if any (§4.5, §9).
    #[must_use]
    pub fn pending_writer_ref(&self) -> Option<u16> {
        self.writer_ref_for_options()
    }

    /// Flow-purpose signature for the options block.
    #[must_use]
    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Split queued messages into fragments that fit `budget` bytes,
    /// draining the retransmit queue first (§4.5 "Queue and transmit").
    pub fn flush(&mut self, budget: usize) -> Vec<OutgoingFragment> {
        if self.state == WriterState::Opening {
            self.state = WriterState::Opened;
        }
        let mut out = Vec::new();
        let mut remaining = budget;

        while let Some(retx) = self.timeout_queue.pop_front() {
            if retx.bytes.len() > remaining && !out.is_empty() {
                self.timeout_queue.push_front(retx);
                break;
            }
            remaining = remaining.saturating_sub(retx.bytes.len());
            out.push(OutgoingFragment {
                stage: retx.stage,
                delta_from_ack: retx.stage.saturating_sub(self.stage_ack),
                flags: retx.flags,
                needs_options: false,
                bytes: retx.bytes,
            });
        }

        while let Some(retx) = self.nak_queue.pop_front() {
            if retx.bytes.len() > remaining && !out.is_empty() {
                self.nak_queue.push_front(retx);
                break;
            }
            remaining = remaining.saturating_sub(retx.bytes.len());
            out.push(OutgoingFragment {
                stage: retx.stage,
                delta_from_ack: retx.stage.saturating_sub(self.stage_ack),
                flags: retx.flags,
                needs_options: false,
                bytes: retx.bytes.clone(),
            });
            self.sent.push_back(retx);
        }

        while let Some(pending) = self.pending.pop_front() {
            let msg = pending.message;
            let mut body = Vec::with_capacity(msg.prefix_len() + msg.body.len());
            msg.encode_prefix(&mut body);
            body.extend_from_slice(&msg.body);
            let reliable = msg.reliability == Reliability::Reliable;
            let chunks = split_into_fragments(&body, FRAGMENT_BUDGET);
            let n_chunks = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                let mut flags = FragmentFlags::empty();
                if i > 0 {
                    flags.insert(FragmentFlags::WITH_BEFOREPART);
                }
                if i + 1 < n_chunks {
                    flags.insert(FragmentFlags::WITH_AFTERPART);
                }
                let needs_options = self.should_attach_options() && i == 0;
                if needs_options {
                    self.options_sent = true;
                }
                let stage = self.stage;
                self.stage += 1;
                let bytes = Bytes::copy_from_slice(&chunk);
                out.push(OutgoingFragment {
                    stage,
                    delta_from_ack: stage.saturating_sub(self.stage_ack),
                    flags,
                    needs_options,
                    bytes: bytes.clone(),
                });
                if reliable {
                    self.sent.push_back(SentFragment {
                        stage,
                        flags,
                        bytes,
                        reliable: true,
                    });
                    if self.sent.len() == 1 {
                        self.trigger.reset();
                    }
                }
            }
        }
        out
    }

    /// Append a final `END`-flagged fragment and move to `NearClosed`
    /// (§4.5 "On close").
    pub fn close(&mut self) {
        if self.state == WriterState::NearClosed || self.state == WriterState::Closed {
            return;
        }
        self.pending.push_back(PendingMessage {
            message: Message::new(
                rtmfp_proto::AmfType::Raw,
                None,
                Reliability::Reliable,
                Bytes::new(),
            ),
        });
        self.state = WriterState::NearClosed;
        self.near_closed_at = Some(Instant::now());
        debug!(writer = self.id, "writer closing");
    }

    /// Process an incoming `0x51` ack chunk (§4.5 "ACK handling").
    pub fn handle_ack(&mut self, ack: &Ack) {
        while let Some(front) = self.sent.front() {
            if front.stage > ack.stage_ack {
                break;
            }
            self.sent.pop_front();
        }
        self.stage_ack = self.stage_ack.max(ack.stage_ack);

        let mut cursor = ack.stage_ack;
        for run in &ack.runs {
            let lost_start = cursor + 1;
            let lost_end = cursor + run.gap;
            for lost_stage in lost_start..=lost_end {
                self.mark_lost(lost_stage);
            }
            cursor = lost_end + run.run + 1;
        }
    }

    fn mark_lost(&mut self, stage: u32) {
        let Some(pos) = self.sent.iter().position(|f| f.stage == stage) else {
            return;
        };
        let Some(frag) = self.sent.remove(pos) else {
            return;
        };
        if !frag.reliable {
            trace!(writer = self.id, stage, "unreliable fragment lost, not retransmitting");
            return;
        }
        debug!(writer = self.id, stage, "fragment lost, queuing retransmit");
        let new_stage = self.stage;
        self.stage += 1;
        self.nak_queue.push_back(SentFragment {
            stage: new_stage,
            flags: frag.flags,
            bytes: frag.bytes,
            reliable: true,
        });
    }

    /// Drive the retransmission trigger. Returns `Err` once the trigger has
    /// exhausted its 8-cycle cap (§4.5 "Retransmission trigger", §7
    /// "Congestion").
    pub fn manage(&mut self, now: Instant) -> Result<bool> {
        if self.sent.is_empty() {
            return Ok(false);
        }
        if !self.trigger.is_due(now) {
            return Ok(false);
        }
        if self.trigger.exhausted() {
            return Err(SessionError::Congestion { writer_id: self.id });
        }
        self.trigger.record_fired(now);
        for frag in self.sent.iter().cloned() {
            self.timeout_queue.push_back(frag);
        }
        Ok(true)
    }
}

fn split_into_fragments(body: &[u8], budget: usize) -> Vec<Vec<u8>> {
    if body.is_empty() {
        return vec![Vec::new()];
    }
    body.chunks(budget.max(1)).map(<[u8]>::to_vec).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmfp_proto::{AckRun, AmfType};

    fn reliable_msg(body: &'static [u8]) -> Message {
        Message::new(AmfType::Data, None, Reliability::Reliable, Bytes::from_static(body))
    }

    #[test]
    fn flush_assigns_increasing_stages() {
        let mut writer = Writer::new(5, 9, Bytes::from_static(b"sig"));
        writer.write(reliable_msg(b"one"));
        writer.write(reliable_msg(b"two"));
        let out = writer.flush(FRAGMENT_BUDGET);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].stage, 1);
        assert_eq!(out[1].stage, 2);
        assert!(out[0].needs_options);
        assert!(!out[1].needs_options);
    }

    #[test]
    fn large_message_splits_into_budgeted_fragments() {
        let mut writer = Writer::new(5, 9, Bytes::from_static(b"sig"));
        let payload = vec![7u8; 3000];
        writer.write(Message::new(
            AmfType::Video,
            Some(0),
            Reliability::Reliable,
            Bytes::from(payload),
        ));
        let out = writer.flush(FRAGMENT_BUDGET);
        assert!(out.len() >= 3);
        assert!(!out[0].flags.contains(FragmentFlags::WITH_BEFOREPART));
        assert!(out[0].flags.contains(FragmentFlags::WITH_AFTERPART));
        let last = out.last().unwrap();
        assert!(last.flags.contains(FragmentFlags::WITH_BEFOREPART));
        assert!(!last.flags.contains(FragmentFlags::WITH_AFTERPART));
    }

    #[test]
    fn ack_pops_sent_queue_up_to_stage_ack() {
        let mut writer = Writer::new(5, 9, Bytes::from_static(b"sig"));
        for _ in 0..3 {
            writer.write(reliable_msg(b"m"));
        }
        writer.flush(FRAGMENT_BUDGET);
        writer.handle_ack(&Ack {
            flow_id: 9,
            receive_buffer: 0x7F,
            stage_ack: 2,
            runs: vec![],
        });
        assert_eq!(writer.stage_ack(), 2);
        assert_eq!(writer.sent.len(), 1);
    }

    #[test]
    fn selective_nak_retransmits_under_new_stage() {
        let mut writer = Writer::new(5, 9, Bytes::from_static(b"sig"));
        for _ in 0..10 {
            writer.write(reliable_msg(b"m"));
        }
        writer.flush(FRAGMENT_BUDGET);
        // stageAck=3, gap=1, run=0 marks stage 4 lost.
        writer.handle_ack(&Ack {
            flow_id: 9,
            receive_buffer: 0x7F,
            stage_ack: 3,
            runs: vec![AckRun { gap: 1, run: 0 }],
        });
        let retransmitted = writer.flush(FRAGMENT_BUDGET);
        assert_eq!(retransmitted.len(), 1);
        assert_eq!(retransmitted[0].stage, 11);
    }

    #[test]
    fn writer_fails_after_eight_retransmit_cycles() {
        let mut writer = Writer::new(5, 9, Bytes::from_static(b"sig"));
        writer.write(reliable_msg(b"m"));
        writer.flush(FRAGMENT_BUDGET);
        let mut now = Instant::now();
        for _ in 0..8 {
            assert!(writer.manage(now).unwrap());
            now += Duration::from_secs(600);
        }
        assert!(writer.manage(now).is_err());
    }
}
