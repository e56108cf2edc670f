// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! One published/subscribed media stream inside a NetGroup: fragment
//! splitting, the fragments-map gossip, push/pull scheduling, fragment
//! ingestion, and window eviction (§4.9).

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtmfp_proto::{AmfType, FragmentsMap, GroupFragment, GroupMarker, PeerId};
use tracing::{trace, warn};

/// Conservative per-datagram payload budget for one `GroupFragment` piece
/// (§4.9.2 "959-byte per-datagram budget").
pub const FRAGMENT_BUDGET: usize = 959;

/// Tunables for one [`GroupMedia`] stream (§4.9.3, §4.9.7).
#[derive(Debug, Clone, Copy)]
pub struct GroupMediaConfig {
    /// How often the fragments-map is re-advertised (§4.9.3, default 100ms).
    pub availability_update_period: Duration,
    /// Rolling window kept before eviction (§4.9.7).
    pub window_duration: Duration,
    /// Extra slack added to `window_duration` before evicting (§4.9.7
    /// "relay margin").
    pub relay_margin: Duration,
    /// Pull target offset: `now - fetch_period` (§4.9.5, default 2500ms).
    pub fetch_period: Duration,
    /// Push-mask cycle length (§4.9.4, fixed at 2s by the spec).
    pub push_cycle: Duration,
}

impl Default for GroupMediaConfig {
    fn default() -> Self {
        Self {
            availability_update_period: Duration::from_millis(100),
            window_duration: Duration::from_secs(8),
            relay_margin: Duration::from_secs(2),
            fetch_period: Duration::from_millis(2500),
            push_cycle: Duration::from_secs(2),
        }
    }
}

struct HeldFragment {
    fragment: GroupFragment,
    received_at: Instant,
}

/// Outcome of offering a fragment into a [`GroupMedia`]'s window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Accepted: new, in-order data the caller should deliver/relay.
    Accepted,
    /// Discarded: at or behind `current_id`, already delivered (§4.9.6).
    StaleDuplicate,
    /// Accepted but out of order; buffered pending the gap being filled.
    BufferedOutOfOrder,
}

/// One subscribed/published stream within a NetGroup (§3 "GroupMedia").
pub struct GroupMedia {
    stream_name: String,
    stream_key: [u8; 34],
    config: GroupMediaConfig,
    next_publish_id: u64,
    current_id: u64,
    held: HashMap<u64, HeldFragment>,
    in_order_ready: VecDeque<GroupFragment>,
    split_buffer: Vec<Bytes>,
    split_media_type: Option<AmfType>,
    split_timestamp: Option<u32>,
    last_map_sent: Option<Instant>,
    last_report_secs: HashMap<PeerId, u64>,
    in_flight_pulls: HashMap<u64, (PeerId, Instant)>,
    ended: bool,
    /// Reassembled fragments kept around (within the window) so a peer's
    /// `PLAY_PULL` can be served after the data has already drained to the
    /// application (§4.9.5, §4.9.7).
    served: HashMap<u64, (GroupFragment, Instant)>,
}

impl GroupMedia {
    /// Begin a fresh stream, e.g. from a received `MEDIA_INFO` advertisement
    /// or before publishing one ourselves (§4.9.1).
    #[must_use]
    pub fn new(stream_name: String, stream_key: [u8; 34], config: GroupMediaConfig) -> Self {
        Self {
            stream_name,
            stream_key,
            config,
            next_publish_id: 1,
            current_id: 0,
            held: HashMap::new(),
            in_order_ready: VecDeque::new(),
            split_buffer: Vec::new(),
            split_media_type: None,
            split_timestamp: None,
            last_map_sent: None,
            last_report_secs: HashMap::new(),
            in_flight_pulls: HashMap::new(),
            ended: false,
            served: HashMap::new(),
        }
    }

    /// The stream's advertised name.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// The 34-byte `21 01 || 32 random` stream key (§4.9.1).
    #[must_use]
    pub fn stream_key(&self) -> &[u8; 34] {
        &self.stream_key
    }

    /// Configured pull target offset (§4.9.5).
    #[must_use]
    pub fn fetch_period(&self) -> Duration {
        self.config.fetch_period
    }

    /// Highest fragment id delivered in order so far.
    #[must_use]
    pub fn current_id(&self) -> u64 {
        self.current_id
    }

    /// Encode a publisher-side media payload into one or more
    /// `GroupFragment`s, splitting across [`FRAGMENT_BUDGET`]-sized pieces
    /// (§4.9.2: whole `MEDIA_DATA`, or `MEDIA_START`+`MEDIA_NEXT`*+`MEDIA_END`).
    pub fn publish(
        &mut self,
        media_type: AmfType,
        timestamp: u32,
        payload: &Bytes,
    ) -> Vec<GroupFragment> {
        let id = self.next_publish_id;
        self.next_publish_id += 1;
        if payload.len() <= FRAGMENT_BUDGET {
            return vec![GroupFragment {
                id,
                marker: GroupMarker::Data,
                split_remaining: 0,
                media_type: Some(media_type),
                timestamp: Some(timestamp),
                bytes: payload.clone(),
            }];
        }
        let chunks: Vec<Bytes> = payload
            .chunks(FRAGMENT_BUDGET)
            .map(|c| Bytes::copy_from_slice(c))
            .collect();
        let total = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| {
                let remaining = (total - i - 1) as u8;
                let marker = if i == 0 {
                    GroupMarker::Start
                } else if i == total - 1 {
                    GroupMarker::End
                } else {
                    GroupMarker::Next
                };
                GroupFragment {
                    id,
                    marker,
                    split_remaining: remaining,
                    media_type: if i == 0 { Some(media_type) } else { None },
                    timestamp: if i == 0 { Some(timestamp) } else { None },
                    bytes,
                }
            })
            .collect()
    }

    /// Final virtual fragment marking end of stream at `lastId + 1`
    /// (§4.9.8).
    pub fn publish_end(&mut self) -> GroupFragment {
        self.ended = true;
        let id = self.next_publish_id;
        self.next_publish_id += 1;
        GroupFragment {
            id,
            marker: GroupMarker::End,
            split_remaining: 0,
            media_type: None,
            timestamp: None,
            bytes: Bytes::new(),
        }
    }

    /// Ingest one received fragment piece, reassembling split sequences and
    /// delivering strictly in id order (§4.9.6).
    pub fn ingest(&mut self, fragment: GroupFragment, now: Instant) -> PushOutcome {
        if fragment.id <= self.current_id {
            trace!(id = fragment.id, current = self.current_id, "stale fragment discarded");
            return PushOutcome::StaleDuplicate;
        }
        self.in_flight_pulls.remove(&fragment.id);
        let before = self.current_id;
        if fragment.is_split() {
            match fragment.marker {
                GroupMarker::Start => {
                    self.split_buffer.clear();
                    self.split_media_type = fragment.media_type;
                    self.split_timestamp = fragment.timestamp;
                    self.split_buffer.push(fragment.bytes.clone());
                }
                GroupMarker::Next => {
                    self.split_buffer.push(fragment.bytes.clone());
                }
                GroupMarker::End if fragment.split_remaining == 0 && !self.split_buffer.is_empty() => {
                    self.split_buffer.push(fragment.bytes.clone());
                    let mut whole = Vec::new();
                    for piece in &self.split_buffer {
                        whole.extend_from_slice(piece);
                    }
                    self.split_buffer.clear();
                    self.held.insert(
                        fragment.id,
                        HeldFragment {
                            fragment: GroupFragment {
                                id: fragment.id,
                                marker: GroupMarker::Data,
                                split_remaining: 0,
                                media_type: self.split_media_type.take(),
                                timestamp: self.split_timestamp.take(),
                                bytes: Bytes::from(whole),
                            },
                            received_at: now,
                        },
                    );
                }
                _ => {
                    self.ended = true;
                }
            }
        } else {
            self.held.insert(
                fragment.id,
                HeldFragment {
                    fragment,
                    received_at: now,
                },
            );
        }
        self.drain_in_order();
        if self.current_id > before {
            PushOutcome::Accepted
        } else {
            PushOutcome::BufferedOutOfOrder
        }
    }

    fn drain_in_order(&mut self) {
        loop {
            let next = self.current_id + 1;
            let Some(held) = self.held.remove(&next) else {
                break;
            };
            self.current_id = next;
            self.served.insert(next, (held.fragment.clone(), held.received_at));
            self.in_order_ready.push_back(held.fragment);
        }
    }

    /// A previously-delivered fragment, if it's still within the window
    /// (§4.9.5 "serve `PLAY_PULL` from the window, not just the reorder
    /// buffer").
    #[must_use]
    pub fn get_served(&self, id: u64) -> Option<&GroupFragment> {
        self.served.get(&id).map(|(fragment, _)| fragment)
    }

    /// Pop fragments that are ready for in-order delivery to the application.
    pub fn take_ready(&mut self) -> Vec<GroupFragment> {
        self.in_order_ready.drain(..).collect()
    }

    /// Evict held fragments whose span since the oldest exceeds
    /// `window_duration + relay_margin` (§4.9.7). If the eviction drops the
    /// fragment right after `current_id` (a permanently lost hole), warn and
    /// fast-forward `current_id` past it, then try to deliver whatever of
    /// the remaining window is now contiguous.
    pub fn evict_expired(&mut self, now: Instant) {
        let cutoff = self.config.window_duration + self.config.relay_margin;
        let mut evicted_max: Option<u64> = None;
        self.held.retain(|id, h| {
            let expired = now.duration_since(h.received_at) >= cutoff;
            if expired {
                evicted_max = Some(evicted_max.map_or(*id, |m| m.max(*id)));
            }
            !expired
        });
        self.served.retain(|_, (_, at)| now.duration_since(*at) < cutoff);

        if let Some(evicted_max) = evicted_max {
            if evicted_max > self.current_id {
                warn!(
                    stream = %self.stream_name,
                    from = self.current_id + 1,
                    to = evicted_max,
                    "fast-forwarding past window-expired fragments"
                );
                self.current_id = evicted_max;
                self.held.retain(|id, _| *id > self.current_id);
                self.drain_in_order();
            }
        }
    }

    /// Whether a fresh fragments-map advertisement is due (§4.9.3).
    #[must_use]
    pub fn map_due(&self, now: Instant) -> bool {
        self.last_map_sent
            .is_none_or(|t| now.duration_since(t) >= self.config.availability_update_period)
    }

    /// Build and timestamp a fragments-map advertisement of our held ids,
    /// bitmap LSB-ordered as the oldest-in-range fragment (§4.9.3).
    pub fn build_fragments_map(&mut self, now: Instant, depth: usize) -> FragmentsMap {
        self.last_map_sent = Some(now);
        let held_ids: Vec<u64> = self
            .held
            .keys()
            .copied()
            .chain(std::iter::once(self.current_id))
            .filter(|id| *id > 0)
            .collect();
        let last_id = held_ids.iter().copied().max().unwrap_or(self.current_id);
        FragmentsMap::build(last_id, &held_ids, depth)
    }

    /// Record that we've asked `peer` for `id`, so repeat pulls can be
    /// blacklisted while the request is in flight (§4.9.5).
    pub fn note_pull_sent(&mut self, id: u64, peer: PeerId, now: Instant) {
        self.in_flight_pulls.insert(id, (peer, now));
    }

    /// Whether `id` has an in-flight pull younger than `timeout`.
    #[must_use]
    pub fn is_pull_in_flight(&self, id: u64, now: Instant, timeout: Duration) -> bool {
        self.in_flight_pulls
            .get(&id)
            .is_some_and(|(_, sent)| now.duration_since(*sent) < timeout)
    }

    /// Record the reporting peer's last-seen time for Group Report
    /// bookkeeping (§4.8.2's `time_since_last_report_secs`).
    pub fn note_report(&mut self, peer: PeerId, now_secs: u64) {
        self.last_report_secs.insert(peer, now_secs);
    }

    /// Whether the end-of-stream virtual fragment has been published or
    /// observed.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> [u8; 34] {
        let mut k = [0u8; 34];
        k[0] = 0x21;
        k[1] = 0x01;
        k
    }

    #[test]
    fn short_payload_publishes_as_single_data_fragment() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let frags = gm.publish(AmfType::Video, 0, &Bytes::from_static(b"hi"));
        assert_eq!(frags.len(), 1);
        assert_eq!(frags[0].marker, GroupMarker::Data);
    }

    #[test]
    fn long_payload_splits_into_start_next_end() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let payload = Bytes::from(vec![7u8; FRAGMENT_BUDGET * 2 + 10]);
        let frags = gm.publish(AmfType::Video, 0, &payload);
        assert_eq!(frags.first().unwrap().marker, GroupMarker::Start);
        assert_eq!(frags.last().unwrap().marker, GroupMarker::End);
        assert!(frags
            .iter()
            .skip(1)
            .take(frags.len() - 2)
            .all(|f| f.marker == GroupMarker::Next));
    }

    #[test]
    fn ingest_delivers_strictly_in_order() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let now = Instant::now();
        let f2 = GroupFragment {
            id: 2,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(1),
            bytes: Bytes::from_static(b"b"),
        };
        gm.ingest(f2, now);
        assert!(gm.take_ready().is_empty());
        let f1 = GroupFragment {
            id: 1,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(0),
            bytes: Bytes::from_static(b"a"),
        };
        gm.ingest(f1, now);
        let ready = gm.take_ready();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, 1);
        assert_eq!(ready[1].id, 2);
    }

    #[test]
    fn stale_fragment_is_rejected() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let now = Instant::now();
        let f1 = GroupFragment {
            id: 1,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(0),
            bytes: Bytes::from_static(b"a"),
        };
        gm.ingest(f1, now);
        gm.take_ready();
        let dup = GroupFragment {
            id: 1,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(0),
            bytes: Bytes::from_static(b"a"),
        };
        assert_eq!(gm.ingest(dup, now), PushOutcome::StaleDuplicate);
    }

    #[test]
    fn split_sequence_reassembles_to_one_fragment() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let now = Instant::now();
        let start = GroupFragment {
            id: 1,
            marker: GroupMarker::Start,
            split_remaining: 1,
            media_type: Some(AmfType::Video),
            timestamp: Some(5),
            bytes: Bytes::from_static(b"hel"),
        };
        let end = GroupFragment {
            id: 1,
            marker: GroupMarker::End,
            split_remaining: 0,
            media_type: None,
            timestamp: None,
            bytes: Bytes::from_static(b"lo"),
        };
        gm.ingest(start, now);
        gm.ingest(end, now);
        let ready = gm.take_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(&ready[0].bytes[..], b"hello");
    }

    #[test]
    fn delivered_fragments_remain_servable_until_eviction() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let now = Instant::now();
        let f1 = GroupFragment {
            id: 1,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(0),
            bytes: Bytes::from_static(b"a"),
        };
        gm.ingest(f1, now);
        gm.take_ready();
        assert!(gm.get_served(1).is_some());
        gm.evict_expired(now + Duration::from_secs(20));
        assert!(gm.get_served(1).is_none());
    }

    #[test]
    fn eviction_drops_stale_held_fragments() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let old = Instant::now();
        let f3 = GroupFragment {
            id: 3,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(0),
            bytes: Bytes::from_static(b"c"),
        };
        gm.ingest(f3, old);
        let later = old + Duration::from_secs(20);
        gm.evict_expired(later);
        assert!(gm.held.is_empty());
    }

    #[test]
    fn eviction_fast_forwards_past_a_permanently_lost_fragment() {
        let mut gm = GroupMedia::new("s".into(), key(), GroupMediaConfig::default());
        let old = Instant::now();
        // id 1 never arrives; id 2 sits buffered behind the hole.
        let f2 = GroupFragment {
            id: 2,
            marker: GroupMarker::Data,
            split_remaining: 0,
            media_type: Some(AmfType::Video),
            timestamp: Some(0),
            bytes: Bytes::from_static(b"b"),
        };
        gm.ingest(f2, old);
        assert!(gm.take_ready().is_empty());
        assert_eq!(gm.current_id(), 0);

        let later = old + Duration::from_secs(20);
        gm.evict_expired(later);

        assert_eq!(gm.current_id(), 2);
        assert!(gm.held.is_empty());
    }
}
