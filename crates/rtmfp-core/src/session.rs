// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The state machine common to server and peer sessions (§3 "Session",
//! §4.10): owns flows/writers, dispatches chunks, drives keepalive, the
//! close handshake, and timestamp-echo RTT sampling.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtmfp_proto::{
    decode_flow_exception, flow_chunk_type as chunk_type, Ack, Address, Fragment, FlowData,
    FlowOptions,
};
use tracing::{debug, trace, warn};

use crate::congestion::Congestion;
use crate::error::{Result, SessionError};
use crate::flow::Flow;
use crate::retry::{Backoff, RetryTimer};
use crate::writer::Writer;

/// No packet received for this long while [`SessionStatus::Connected`]
/// triggers a keepalive (§4.10).
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(25);
/// Close requests repeat on this cadence (§4.10).
pub const CLOSE_REPEAT: Duration = Duration::from_secs(5);
/// Close repeats stop after this much elapsed time without a reply
/// (`90s / 5s = 18` cycles, §4.10).
pub const CLOSE_MAX_CYCLES: u32 = 18;
/// How long a `FAILED` session is kept around to absorb late packets
/// (§3 "Session").
pub const FAILED_ABSORPTION: Duration = Duration::from_secs(19);
/// How long a `NEAR_CLOSED` session is kept around (§3 "Session").
pub const NEAR_CLOSED_ABSORPTION: Duration = Duration::from_secs(90);

/// 4ms clock ticks per millisecond of RTT, per the wire timestamp unit
/// (§4.10 "Timestamp echo").
const RTT_TICK_MS: u64 = 4;

/// Session lifecycle (§3 "Session"). Transitions are monotonic except on the
/// close path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Not yet handshaking.
    Stopped,
    /// Initiator sent `0x30`, awaiting `0x70`.
    Hs30,
    /// Responder sent `0x70`, awaiting `0x38`.
    Hs70,
    /// Initiator sent `0x38`, awaiting `0x78`.
    Hs38,
    /// Responder sent `0x78`; session usable from here.
    Hs78,
    /// Fully established.
    Connected,
    /// Close initiated or acknowledged; draining.
    NearClosed,
    /// Failed; kept briefly to absorb late packets.
    Failed,
}

/// One reassembled message delivered out of a flow, tagged with enough
/// context for the owning layer (`ServerSession`/`PeerSession`) to dispatch
/// it by signature.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Id of the session this message arrived on, so a multiplexing caller
    /// (the `Invoker`'s consumers) can route it back to the right
    /// connection/media stream.
    pub session_id: u32,
    /// Flow id the message arrived on.
    pub flow_id: u64,
    /// The flow's purpose signature.
    pub signature: Bytes,
    /// Back-referenced writer id, if the peer declared fullduplex pairing.
    pub writer_ref: Option<u16>,
    /// Reassembled message bytes.
    pub body: Bytes,
}

/// Common per-session state machine (§3 "Session", §4.10).
pub struct Session {
    session_id: u32,
    far_id: u32,
    address: Address,
    responder: bool,
    status: SessionStatus,
    flows: HashMap<u64, Flow>,
    writers: HashMap<u16, Writer>,
    next_writer_id: u16,
    congestion: Congestion,
    last_received: Instant,
    keepalive_sent_at: Option<Instant>,
    close_trigger: RetryTimer,
    near_closed_at: Option<Instant>,
    failed_at: Option<Instant>,
    outbox: VecDeque<(u8, Vec<u8>)>,
    last_seen_flow: Option<(u64, u32)>,
}

impl Session {
    /// Build a new session. Created by the `Handshaker` once a session id
    /// pair has been agreed (§4.2).
    #[must_use]
    pub fn new(session_id: u32, far_id: u32, address: Address, responder: bool) -> Self {
        Self {
            session_id,
            far_id,
            address,
            responder,
            status: SessionStatus::Stopped,
            flows: HashMap::new(),
            writers: HashMap::new(),
            next_writer_id: 3,
            congestion: Congestion::new(),
            last_received: Instant::now(),
            keepalive_sent_at: None,
            close_trigger: RetryTimer::new(CLOSE_REPEAT, Backoff::Fixed, CLOSE_MAX_CYCLES),
            near_closed_at: None,
            failed_at: None,
            outbox: VecDeque::new(),
            last_seen_flow: None,
        }
    }

    /// Local session id (routing key for incoming scrambled ids).
    #[must_use]
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Peer-chosen far id, used for outgoing packet scrambling.
    #[must_use]
    pub fn far_id(&self) -> u32 {
        self.far_id
    }

    /// Current network address of the peer.
    #[must_use]
    pub fn address(&self) -> Address {
        self.address
    }

    /// Whether this session was created by the responder side of the
    /// handshake.
    #[must_use]
    pub fn is_responder(&self) -> bool {
        self.responder
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Force the status, used by the handshake state machine as it
    /// progresses `HS30 → HS70 → HS38 → HS78 → CONNECTED`.
    pub fn set_status(&mut self, status: SessionStatus) {
        debug!(session = self.session_id, ?status, "session status change");
        self.status = status;
    }

    /// Smoothed RTT / congestion tracker.
    #[must_use]
    pub fn congestion(&self) -> &Congestion {
        &self.congestion
    }

    /// Update the peer's address (e.g. after a redirection chunk or a
    /// migrating UDP source).
    pub fn set_address(&mut self, address: Address) {
        self.address = address;
    }

    /// Allocate a new writer bound to this session, answering `flow_id` (0
    /// if unpaired), and register it.
    pub fn open_writer(&mut self, flow_id: u64, signature: Bytes) -> u16 {
        let id = self.next_writer_id;
        self.next_writer_id += 1;
        self.writers.insert(id, Writer::new(id, flow_id, signature));
        id
    }

    /// Borrow a writer mutably.
    pub fn writer_mut(&mut self, id: u16) -> Option<&mut Writer> {
        self.writers.get_mut(&id)
    }

    /// Iterate all writers mutably, e.g. to flush pending data.
    pub fn writers_mut(&mut self) -> impl Iterator<Item = &mut Writer> {
        self.writers.values_mut()
    }

    /// Look up a flow by id.
    #[must_use]
    pub fn flow(&self, id: u64) -> Option<&Flow> {
        self.flows.get(&id)
    }

    /// Record that a datagram just arrived, resetting the keepalive clock.
    pub fn note_received(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Fold in an RTT sample from a timestamp-echo header: `local_now` and
    /// `echoed` are both in 4ms clock ticks (§4.10 "Timestamp echo").
    pub fn note_timestamp_echo(&mut self, local_now: u16, echoed: u16) {
        let ticks = local_now.wrapping_sub(echoed);
        let rtt_ms = u64::from(ticks) * RTT_TICK_MS;
        self.congestion.sample(rtt_ms as f64);
    }

    /// Queue a raw chunk for the next outgoing packet.
    fn queue_chunk(&mut self, chunk_type: u8, body: Vec<u8>) {
        self.outbox.push_back((chunk_type, body));
    }

    /// Drain chunks queued by chunk handling and `manage()` since the last
    /// call.
    pub fn drain_outbox(&mut self) -> Vec<(u8, Vec<u8>)> {
        self.outbox.drain(..).collect()
    }

    /// Drain every writer's pending/retransmit queues into `FLOW_HEADER`
    /// chunks on the outbox (§4.4, §4.5 "Queue and transmit"). Every
    /// fragment is framed as a header chunk (explicit `flowId`/`stage`/
    /// `deltaNAck`) rather than relying on continuation-chunk bookkeeping
    /// across independently-packed datagrams.
    pub fn flush_writers(&mut self) {
        let mut chunks = Vec::new();
        for writer in self.writers.values_mut() {
            for fragment in writer.flush(crate::writer::FRAGMENT_BUDGET) {
                let options = fragment.needs_options.then(|| FlowOptions {
                    signature: Bytes::copy_from_slice(writer.signature()),
                    writer_ref: writer.pending_writer_ref(),
                });
                let body = FlowData::encode_header(
                    fragment.flags,
                    writer.flow_id(),
                    fragment.stage,
                    fragment.delta_from_ack,
                    options.as_ref(),
                    &fragment.bytes,
                );
                chunks.push((chunk_type::FLOW_HEADER, body));
            }
        }
        self.outbox.extend(chunks);
    }

    /// Dispatch one incoming session chunk. Returns any reassembled
    /// messages ready for the owning layer to route by signature.
    pub fn handle_chunk(&mut self, ty: u8, body: &[u8], now: Instant) -> Result<Vec<Delivery>> {
        match ty {
            chunk_type::FLOW_HEADER => self.handle_flow_data(true, body),
            chunk_type::FLOW_CONTINUATION => self.handle_flow_data(false, body),
            chunk_type::ACK => {
                let ack = Ack::decode(body)?;
                if let Ok(writer_id) = u16::try_from(ack.flow_id) {
                    if let Some(writer) = self.writers.get_mut(&writer_id) {
                        writer.handle_ack(&ack);
                    }
                }
                Ok(Vec::new())
            }
            chunk_type::FLOW_EXCEPTION => {
                let flow_id = decode_flow_exception(body)?;
                trace!(session = self.session_id, flow_id, "flow exception, dropping flow");
                self.flows.remove(&flow_id);
                Ok(Vec::new())
            }
            chunk_type::KEEPALIVE => {
                self.queue_chunk(chunk_type::KEEPALIVE_ACK, Vec::new());
                Ok(Vec::new())
            }
            chunk_type::KEEPALIVE_ACK => Ok(Vec::new()),
            chunk_type::CLOSE => {
                if self.status != SessionStatus::NearClosed {
                    self.queue_chunk(chunk_type::CLOSE, Vec::new());
                }
                self.enter_near_closed(now);
                Ok(Vec::new())
            }
            chunk_type::CLOSE_ACK => {
                self.status = SessionStatus::Failed;
                self.failed_at = Some(now);
                Ok(Vec::new())
            }
            other => Err(SessionError::Protocol(rtmfp_proto::ProtoError::UnknownChunk(other))),
        }
    }

    fn handle_flow_data(&mut self, is_header: bool, body: &[u8]) -> Result<Vec<Delivery>> {
        let data = FlowData::decode(body, is_header)?;
        let (flow_id, stage) = if is_header {
            let flow_id = data.flow_id.ok_or(SessionError::Application("header chunk missing flowId"))?;
            let stage = data.stage.ok_or(SessionError::Application("header chunk missing stage"))?;
            self.last_seen_flow = Some((flow_id, stage));
            (flow_id, stage)
        } else {
            let (flow_id, prev_stage) = self
                .last_seen_flow
                .ok_or(SessionError::Application("continuation chunk with no prior flow"))?;
            let stage = prev_stage + 1;
            self.last_seen_flow = Some((flow_id, stage));
            (flow_id, stage)
        };

        let flow = self.flows.entry(flow_id).or_insert_with(|| {
            let signature = data
                .options
                .as_ref()
                .map(|o| o.signature.clone())
                .unwrap_or_default();
            let writer_ref = data.options.as_ref().and_then(|o| o.writer_ref);
            Flow::new(flow_id, signature, writer_ref)
        });

        let fragment = Fragment {
            stage,
            flags: data.flags,
            bytes: data.payload,
        };
        let mut delivered = flow.receive(fragment);
        if let Some(delta_nack) = data.delta_nack {
            delivered.extend(flow.note_delta_nack(stage, delta_nack));
        }

        let ack = flow.build_ack();
        self.queue_chunk(chunk_type::ACK, ack.encode());

        let signature = Bytes::copy_from_slice(flow.signature());
        let writer_ref = flow.writer_ref();
        let session_id = self.session_id;
        Ok(delivered
            .into_iter()
            .map(|body| Delivery {
                session_id,
                flow_id,
                signature: signature.clone(),
                writer_ref,
                body,
            })
            .collect())
    }

    /// Initiate a graceful close: send `0x0C`, move to `NearClosed`.
    pub fn close(&mut self, now: Instant) {
        if self.status == SessionStatus::NearClosed || self.status == SessionStatus::Failed {
            return;
        }
        self.queue_chunk(chunk_type::CLOSE, Vec::new());
        self.enter_near_closed(now);
        self.close_trigger.record_fired(now);
    }

    fn enter_near_closed(&mut self, now: Instant) {
        self.status = SessionStatus::NearClosed;
        self.near_closed_at.get_or_insert(now);
        for writer in self.writers.values_mut() {
            writer.close();
        }
    }

    /// Periodic housekeeping: keepalive, close retries, writer ARQ, and
    /// flow/writer reaping. Returns `Err` if a writer's retransmission
    /// trigger exhausts its cycle cap (§7 "Congestion").
    pub fn manage(&mut self, now: Instant) -> Result<()> {
        match self.status {
            SessionStatus::Connected => {
                if now.duration_since(self.last_received) >= KEEPALIVE_TIMEOUT
                    && self
                        .keepalive_sent_at
                        .is_none_or(|t| now.duration_since(t) >= KEEPALIVE_TIMEOUT)
                {
                    self.queue_chunk(chunk_type::KEEPALIVE, Vec::new());
                    self.keepalive_sent_at = Some(now);
                }
            }
            SessionStatus::NearClosed => {
                if self.close_trigger.is_due(now) {
                    if self.close_trigger.exhausted() {
                        self.status = SessionStatus::Failed;
                        self.failed_at = Some(now);
                    } else {
                        self.queue_chunk(chunk_type::CLOSE, Vec::new());
                        self.close_trigger.record_fired(now);
                    }
                }
            }
            _ => {}
        }

        let mut failed_writer = None;
        for (id, writer) in &mut self.writers {
            match writer.manage(now) {
                Ok(_) => {}
                Err(err) => {
                    warn!(session = self.session_id, writer = id, "writer congestion exhausted");
                    failed_writer = Some(err);
                }
            }
        }
        self.flush_writers();
        self.writers.retain(|_, w| !w.is_reapable(now));
        self.flows.retain(|_, f| !f.is_reapable(now));

        if let Some(err) = failed_writer {
            return Err(err);
        }
        Ok(())
    }

    /// Whether the `Invoker` may discard this session entirely.
    #[must_use]
    pub fn is_reapable(&self, now: Instant) -> bool {
        match self.status {
            SessionStatus::Failed => self
                .failed_at
                .is_some_and(|t| now.duration_since(t) >= FAILED_ABSORPTION),
            SessionStatus::NearClosed => self
                .near_closed_at
                .is_some_and(|t| now.duration_since(t) >= NEAR_CLOSED_ABSORPTION),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmfp_proto::{AddressKind, FlowOptions, FragmentFlags};
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> Address {
        Address::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 1935),
            AddressKind::Public,
        )
    }

    fn session() -> Session {
        let mut s = Session::new(0x0300_0001, 0x0300_0002, addr(), false);
        s.set_status(SessionStatus::Connected);
        s
    }

    #[test]
    fn keepalive_fires_after_timeout() {
        let mut s = session();
        s.note_received(Instant::now());
        let later = Instant::now() + KEEPALIVE_TIMEOUT + Duration::from_millis(1);
        s.manage(later).unwrap();
        let sent = s.drain_outbox();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, chunk_type::KEEPALIVE);
    }

    #[test]
    fn receiving_keepalive_queues_ack() {
        let mut s = session();
        let delivered = s.handle_chunk(chunk_type::KEEPALIVE, &[], Instant::now()).unwrap();
        assert!(delivered.is_empty());
        let sent = s.drain_outbox();
        assert_eq!(sent, vec![(chunk_type::KEEPALIVE_ACK, Vec::new())]);
    }

    #[test]
    fn close_then_peer_close_ack_transitions_to_failed() {
        let mut s = session();
        s.close(Instant::now());
        assert_eq!(s.status(), SessionStatus::NearClosed);
        s.handle_chunk(chunk_type::CLOSE_ACK, &[], Instant::now()).unwrap();
        assert_eq!(s.status(), SessionStatus::Failed);
    }

    #[test]
    fn close_retries_then_fails_after_max_cycles() {
        let mut s = session();
        let mut now = Instant::now();
        s.close(now);
        for _ in 0..CLOSE_MAX_CYCLES {
            now += CLOSE_REPEAT;
            s.manage(now).unwrap();
        }
        assert_eq!(s.status(), SessionStatus::Failed);
    }

    #[test]
    fn header_chunk_creates_flow_and_delivers_whole_message() {
        let mut s = session();
        let opts = FlowOptions {
            signature: Bytes::from_static(b"\x00\x54\x43\x04"),
            writer_ref: None,
        };
        let body = FlowData::encode_header(FragmentFlags::HEADER, 9, 1, 1, Some(&opts), b"hi");
        let delivered = s
            .handle_chunk(chunk_type::FLOW_HEADER, &body, Instant::now())
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, Bytes::from_static(b"hi"));
        assert_eq!(delivered[0].signature, Bytes::from_static(b"\x00\x54\x43\x04"));
        assert!(s.flow(9).is_some());
        // an ack chunk should have been queued
        let sent = s.drain_outbox();
        assert_eq!(sent[0].0, chunk_type::ACK);
    }

    #[test]
    fn continuation_chunk_uses_prior_stage_plus_one() {
        let mut s = session();
        let opts = FlowOptions {
            signature: Bytes::from_static(b"sig"),
            writer_ref: None,
        };
        let header = FlowData::encode_header(
            FragmentFlags::HEADER | FragmentFlags::WITH_AFTERPART,
            9,
            1,
            1,
            Some(&opts),
            b"AAA",
        );
        s.handle_chunk(chunk_type::FLOW_HEADER, &header, Instant::now())
            .unwrap();
        let cont = FlowData::encode_continuation(FragmentFlags::WITH_BEFOREPART, b"BBB");
        let delivered = s
            .handle_chunk(chunk_type::FLOW_CONTINUATION, &cont, Instant::now())
            .unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].body, Bytes::from_static(b"AAABBB"));
    }

    #[test]
    fn ack_chunk_routes_to_matching_writer() {
        let mut s = session();
        let writer_id = s.open_writer(0, Bytes::from_static(b"sig"));
        s.writer_mut(writer_id).unwrap().write(rtmfp_proto::Message::new(
            rtmfp_proto::AmfType::Data,
            None,
            rtmfp_proto::Reliability::Reliable,
            Bytes::from_static(b"x"),
        ));
        s.writer_mut(writer_id).unwrap().flush(900);
        let ack = Ack {
            flow_id: u64::from(writer_id),
            receive_buffer: 0x7F,
            stage_ack: 1,
            runs: vec![],
        };
        s.handle_chunk(chunk_type::ACK, &ack.encode(), Instant::now())
            .unwrap();
        assert_eq!(s.writer_mut(writer_id).unwrap().stage_ack(), 1);
    }
}
