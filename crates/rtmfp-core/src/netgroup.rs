// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! NetGroup membership: heard list, best-list construction, and best-list
//! reconciliation (§4.7).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use rtmfp_proto::{Address, PeerId};
use tracing::{debug, trace};

use crate::retry::RetryTimer;

/// Heard-list entries expire after 5 min of silence (§4.7 "Heard list").
const HEARD_LIST_TTL: Duration = Duration::from_secs(5 * 60);

/// Best list is recomputed no more often than every 10 s (§4.7 "Best list").
const BEST_LIST_PERIOD: Duration = Duration::from_secs(10);

/// Literal hex prefix marking a "v2" groupspec (§9 open question: "token
/// `7F 02`"). A v1 groupspec hashes to its `idHex` with a single SHA-256; a
/// v2 one is hashed twice.
const V2_GROUPSPEC_PREFIX: [u8; 2] = [0x7F, 0x02];

/// Derive a groupspec's `idHex` (§3 "NetGroup" `idHex`), applying the
/// double-SHA-256 the original reserves for v2 groupspecs (those whose
/// decoded bytes start with the `7F 02` token) and a single hash otherwise.
/// `group_id_txt` is treated as hex digits when it parses as such; any text
/// that isn't valid hex (e.g. this crate's own URL-derived groupspecs, see
/// `rtmfp-client::client`) is hashed as raw UTF-8 bytes and is never v2.
#[must_use]
pub fn group_id_hex(group_id_txt: &str) -> String {
    let is_v2 = hex::decode(group_id_txt.trim())
        .is_ok_and(|bytes| bytes.starts_with(&V2_GROUPSPEC_PREFIX));
    let bytes = group_id_txt.as_bytes();
    let digest = if is_v2 {
        rtmfp_crypto::sha256_twice(bytes)
    } else {
        rtmfp_crypto::sha256(bytes)
    };
    hex::encode(digest)
}

/// One peer we've heard about, directly or via a Group Report (§3 "NetGroup").
#[derive(Debug, Clone)]
pub struct HeardPeer {
    /// The peer's raw 32-byte id.
    pub raw_id: PeerId,
    /// `SHA-256(rawId)`, the ring coordinate this peer sits at.
    pub group_address: [u8; 32],
    /// Addresses we've been told this peer answers at.
    pub known_addresses: Vec<Address>,
    /// Rendezvous-style host address, if known.
    pub host_address: Option<Address>,
    /// When we last heard anything about this peer.
    pub last_report: Instant,
    /// Smoothed RTT to this peer, if we're directly connected (used to rank
    /// "lowest-latency" candidates in step 3 of best-list construction).
    pub rtt: Option<Duration>,
}

/// Tunables for a single [`NetGroup`] instance (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct NetGroupConfig {
    /// How many of the 6 ring-closest neighbors to target (split evenly
    /// lower/higher around our own address).
    pub ring_neighbors: usize,
    /// How many lowest-latency connected peers to add.
    pub low_latency_slots: usize,
}

impl Default for NetGroupConfig {
    fn default() -> Self {
        Self {
            ring_neighbors: 6,
            low_latency_slots: 6,
        }
    }
}

/// Group-address ring and membership tables for one NetGroup (§3 "NetGroup",
/// §4.7).
#[derive(Debug)]
pub struct NetGroup {
    id_txt: String,
    my_group_address: [u8; 32],
    heard_list: HashMap<PeerId, HeardPeer>,
    best_list: Vec<PeerId>,
    connected: HashMap<PeerId, Duration>,
    config: NetGroupConfig,
    last_best_list_build: Option<Instant>,
    ask_to_disconnect: HashMap<PeerId, RetryTimer>,
}

impl NetGroup {
    /// Build a group rooted at `my_raw_id`'s group address.
    #[must_use]
    pub fn new(id_txt: String, my_raw_id: &PeerId, config: NetGroupConfig) -> Self {
        Self {
            id_txt,
            my_group_address: rtmfp_crypto::sha256(my_raw_id.as_bytes()),
            heard_list: HashMap::new(),
            best_list: Vec::new(),
            connected: HashMap::new(),
            config,
            last_best_list_build: None,
            ask_to_disconnect: HashMap::new(),
        }
    }

    /// The groupspec text this instance was built from.
    #[must_use]
    pub fn id_txt(&self) -> &str {
        &self.id_txt
    }

    /// Our own ring coordinate.
    #[must_use]
    pub fn my_group_address(&self) -> [u8; 32] {
        self.my_group_address
    }

    /// Current best-list membership.
    #[must_use]
    pub fn best_list(&self) -> &[PeerId] {
        &self.best_list
    }

    /// A known address to dial `peer` at (host/rendezvous address preferred,
    /// falling back to the first directly-reported one), if we've heard of
    /// it at all.
    #[must_use]
    pub fn heard_address(&self, peer: &PeerId) -> Option<Address> {
        let entry = self.heard_list.get(peer)?;
        entry.host_address.or_else(|| entry.known_addresses.first().copied())
    }

    /// Record (or refresh) a heard-list entry, e.g. from a Group Report or
    /// a completed direct handshake (§4.7 "Heard list").
    pub fn note_heard(&mut self, peer: PeerId, addresses: Vec<Address>, host: Option<Address>, now: Instant) {
        let group_address = rtmfp_crypto::sha256(peer.as_bytes());
        self.heard_list
            .entry(peer)
            .and_modify(|e| {
                for addr in &addresses {
                    if !e.known_addresses.contains(addr) {
                        e.known_addresses.push(*addr);
                    }
                }
                if host.is_some() {
                    e.host_address = host;
                }
                e.last_report = now;
            })
            .or_insert(HeardPeer {
                raw_id: peer,
                group_address,
                known_addresses: addresses,
                host_address: host,
                last_report: now,
                rtt: None,
            });
    }

    /// Mark a peer as directly connected with a measured RTT, used to rank
    /// "lowest-latency" candidates (§4.7 step 3).
    pub fn note_connected(&mut self, peer: PeerId, rtt: Duration) {
        self.connected.insert(peer, rtt);
        if let Some(entry) = self.heard_list.get_mut(&peer) {
            entry.rtt = Some(rtt);
        }
    }

    /// Drop a peer from the connected set (it disconnected or we asked it to).
    pub fn note_disconnected(&mut self, peer: &PeerId) {
        self.connected.remove(peer);
    }

    /// Expire heard-list entries silent for longer than [`HEARD_LIST_TTL`].
    pub fn expire(&mut self, now: Instant) {
        self.heard_list
            .retain(|_, e| now.duration_since(e.last_report) < HEARD_LIST_TTL);
        self.best_list.retain(|id| self.heard_list.contains_key(id));
    }

    /// Estimate total group size from the peers two ring positions away on
    /// each side of us (§4.7 "Estimated group size").
    #[must_use]
    pub fn estimate_group_size(&self) -> u64 {
        let ring = self.sorted_ring();
        if ring.len() < 5 {
            return ring.len() as u64 + 1;
        }
        let me = ring
            .iter()
            .position(|(addr, _)| *addr == self.my_group_address);
        let Some(me) = me else {
            return ring.len() as u64 + 1;
        };
        let len = ring.len();
        let minus2 = ring[(me + len - 2) % len].0;
        let plus2 = ring[(me + 2) % len].0;
        let hi = |a: [u8; 32]| u64::from_be_bytes(a[0..8].try_into().unwrap_or([0; 8]));
        let span = hi(plus2).wrapping_sub(hi(minus2)) / 4;
        if span == 0 {
            return ring.len() as u64 + 1;
        }
        (u64::MAX / span).saturating_add(1)
    }

    fn sorted_ring(&self) -> Vec<([u8; 32], PeerId)> {
        let mut ring: Vec<_> = self
            .heard_list
            .values()
            .map(|e| (e.group_address, e.raw_id))
            .collect();
        ring.push((self.my_group_address, self.id_placeholder()));
        ring.sort_by_key(|(addr, _)| *addr);
        ring
    }

    fn id_placeholder(&self) -> PeerId {
        PeerId::from_bytes(self.my_group_address)
    }

    /// Whether the best list is due for a rebuild (§4.7 "computed
    /// periodically (≥ every 10s)").
    #[must_use]
    pub fn due_for_rebuild(&self, now: Instant) -> bool {
        self.last_best_list_build
            .is_none_or(|t| now.duration_since(t) >= BEST_LIST_PERIOD)
    }

    /// Rebuild the best list from the heard list (§4.7 "Best list").
    pub fn rebuild_best_list(&mut self, now: Instant, rng: &mut impl Rng) {
        self.last_best_list_build = Some(now);
        let ring = self.sorted_ring();
        let me_pos = ring
            .iter()
            .position(|(addr, _)| *addr == self.my_group_address);
        let Some(me_pos) = me_pos else {
            self.best_list.clear();
            return;
        };
        let len = ring.len();
        let mut chosen: Vec<PeerId> = Vec::new();
        let per_side = self.config.ring_neighbors / 2;
        for step in 1..=per_side {
            let lower = ring[(me_pos + len - step) % len].1;
            let upper = ring[(me_pos + step) % len].1;
            if lower != self.id_placeholder() {
                chosen.push(lower);
            }
            if upper != self.id_placeholder() {
                chosen.push(upper);
            }
        }
        let mut by_latency: Vec<_> = self.connected.iter().collect();
        by_latency.sort_by_key(|(_, rtt)| **rtt);
        for (peer, _) in by_latency.into_iter().take(self.config.low_latency_slots) {
            if !chosen.contains(peer) {
                chosen.push(*peer);
            }
        }
        let candidates: Vec<PeerId> = self
            .heard_list
            .keys()
            .copied()
            .filter(|p| !chosen.contains(p))
            .collect();
        if !candidates.is_empty() {
            let idx = rng.gen_range(0..candidates.len());
            chosen.push(candidates[idx]);
        }
        let n = self.estimate_group_size().max(1);
        let target = 2 * (64 - n.leading_zeros().min(64)) + 13;
        let mut fraction_idx = 1usize;
        while chosen.len() < target as usize && chosen.len() < len.saturating_sub(1) {
            let span = len / (1 << fraction_idx.min(20));
            if span == 0 {
                break;
            }
            let candidate = ring[(me_pos + span) % len].1;
            if candidate != self.id_placeholder() && !chosen.contains(&candidate) {
                chosen.push(candidate);
            }
            fraction_idx += 1;
            if fraction_idx > 32 {
                break;
            }
        }
        chosen.dedup();
        debug!(group = %self.id_txt, size = chosen.len(), estimated_n = n, "rebuilt best list");
        self.best_list = chosen;
    }

    /// Peers we should newly connect to (in `bestList \ peers`) and peers we
    /// should ask to disconnect (in `peers \ bestList`), rate-limited to once
    /// per 90 s per peer (§4.7 "Best-list reconciliation").
    pub fn reconcile(&mut self, now: Instant) -> (Vec<PeerId>, Vec<PeerId>) {
        let to_connect: Vec<PeerId> = self
            .best_list
            .iter()
            .filter(|p| !self.connected.contains_key(p))
            .copied()
            .collect();
        let mut to_disconnect = Vec::new();
        for peer in self.connected.keys().copied().collect::<Vec<_>>() {
            if self.best_list.contains(&peer) {
                continue;
            }
            let timer = self
                .ask_to_disconnect
                .entry(peer)
                .or_insert_with(RetryTimer::ask_to_disconnect);
            if timer.is_due(now) {
                timer.record_fired(now);
                to_disconnect.push(peer);
            }
        }
        if !to_connect.is_empty() || !to_disconnect.is_empty() {
            trace!(connect = to_connect.len(), disconnect = to_disconnect.len(), "reconciling best list");
        }
        (to_connect, to_disconnect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn peer(byte: u8) -> PeerId {
        PeerId::from_public_key(&[byte; 8])
    }

    fn addr(port: u16) -> Address {
        Address::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port),
            rtmfp_proto::AddressKind::Public,
        )
    }

    #[test]
    fn heard_list_grows_and_merges_addresses() {
        let mut group = NetGroup::new("g".to_string(), &peer(1), NetGroupConfig::default());
        let now = Instant::now();
        group.note_heard(peer(2), vec![addr(10)], None, now);
        group.note_heard(peer(2), vec![addr(11)], None, now);
        let entry = &group.heard_list[&peer(2)];
        assert_eq!(entry.known_addresses.len(), 2);
    }

    #[test]
    fn expire_drops_stale_entries() {
        let mut group = NetGroup::new("g".to_string(), &peer(1), NetGroupConfig::default());
        let old = Instant::now() - Duration::from_secs(400);
        group.note_heard(peer(2), vec![], None, old);
        group.expire(Instant::now());
        assert!(!group.heard_list.contains_key(&peer(2)));
    }

    #[test]
    fn best_list_is_subset_of_heard_list() {
        let mut group = NetGroup::new("g".to_string(), &peer(0), NetGroupConfig::default());
        let now = Instant::now();
        for i in 1..20u8 {
            group.note_heard(peer(i), vec![], None, now);
        }
        let mut rng = StepRng::new(3, 1);
        group.rebuild_best_list(now, &mut rng);
        for peer_id in group.best_list() {
            assert!(group.heard_list.contains_key(peer_id));
        }
    }

    #[test]
    fn reconcile_asks_non_best_connected_peers_to_disconnect() {
        let mut group = NetGroup::new("g".to_string(), &peer(0), NetGroupConfig::default());
        let now = Instant::now();
        group.note_heard(peer(5), vec![], None, now);
        group.note_connected(peer(5), Duration::from_millis(10));
        group.best_list.clear();
        let (_, disconnect) = group.reconcile(now);
        assert_eq!(disconnect, vec![peer(5)]);
    }

    #[test]
    fn v1_groupspec_hashes_once() {
        assert_eq!(group_id_hex("my-stream-group"), hex::encode(rtmfp_crypto::sha256(b"my-stream-group")));
    }

    #[test]
    fn v2_groupspec_hex_token_hashes_twice() {
        let spec = "7f0200aabbcc";
        let expected = hex::encode(rtmfp_crypto::sha256_twice(spec.as_bytes()));
        assert_eq!(group_id_hex(spec), expected);
        assert_ne!(group_id_hex(spec), hex::encode(rtmfp_crypto::sha256(spec.as_bytes())));
    }

    #[test]
    fn non_hex_groupspec_is_never_v2() {
        let spec = "udp://server/app?group=stream";
        assert_eq!(group_id_hex(spec), hex::encode(rtmfp_crypto::sha256(spec.as_bytes())));
    }
}
