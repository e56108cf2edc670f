// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A session to the rendezvous server: the main `NetConnection` writer,
//! `setPeerInfo`-reported addresses, and the peer-introduction bookkeeping
//! that brokers direct peer-to-peer connections (§4.6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rtmfp_proto::{Address, Hs79, PeerId, Tag};
use tracing::debug;

use crate::error::Result;
use crate::session::{Delivery, Session};

/// An introduction request is considered stale (and its tag reusable) after
/// this long without a matching `HS38` arriving at the callee (§4.6).
const INTRODUCTION_TTL: Duration = Duration::from_secs(95);

/// One peer, as announced to the server via `setPeerInfo`, kept so the
/// server can answer introduction requests naming it.
#[derive(Debug, Clone)]
struct AnnouncedPeer {
    addresses: Vec<Address>,
}

/// One in-flight introduction: peer `from` asked to reach peer `to`, tagged
/// so the resulting `HS38` at the callee can be matched back to this
/// request (§4.6 "tag table").
#[derive(Debug, Clone)]
struct PendingIntroduction {
    tag: Tag,
    from_peer: PeerId,
    from_address: Address,
    created: Instant,
}

/// A session to the rendezvous server (§3 "ServerSession", §4.6).
pub struct ServerSession {
    inner: Session,
    main_writer: u16,
    announced_peers: HashMap<PeerId, AnnouncedPeer>,
    pending_introductions: Vec<PendingIntroduction>,
}

impl ServerSession {
    /// Wrap a freshly-handshaken [`Session`] to the server, opening the
    /// main `NetConnection` writer (§9).
    #[must_use]
    pub fn new(mut inner: Session) -> Self {
        let main_writer = inner.open_writer(0, Bytes::new());
        Self {
            inner,
            main_writer,
            announced_peers: HashMap::new(),
            pending_introductions: Vec::new(),
        }
    }

    /// Borrow the underlying session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.inner
    }

    /// Mutably borrow the underlying session.
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.inner
    }

    /// The main `NetConnection` writer id.
    #[must_use]
    pub fn main_writer(&self) -> u16 {
        self.main_writer
    }

    /// Record (or refresh) the reachable addresses this server knows for
    /// `peer`, as learned from its `setPeerInfo` call (§6 user API table).
    pub fn announce_peer(&mut self, peer: PeerId, addresses: Vec<Address>) {
        self.announced_peers.insert(peer, AnnouncedPeer { addresses });
    }

    /// Forget a peer, e.g. once its session to the server closes.
    pub fn forget_peer(&mut self, peer: &PeerId) {
        self.announced_peers.remove(peer);
    }

    /// Handle a rendezvous request (the `0x0F`-type forwarded chunk, §4.6
    /// step 1): peer `from` at `from_address`, tagged `tag`, wants to reach
    /// `to`. Returns the `HS71` redirection addresses to send back to
    /// `from` immediately, plus the `HS79` to forward to `to` so it can
    /// preemptively send its own `HS70` (§4.6 steps 2-4).
    pub fn introduce(
        &mut self,
        from: PeerId,
        from_address: Address,
        to: PeerId,
        tag: Tag,
        now: Instant,
    ) -> Option<(Vec<Address>, Hs79)> {
        let target = self.announced_peers.get(&to)?;
        self.pending_introductions.push(PendingIntroduction {
            tag,
            from_peer: from,
            from_address,
            created: now,
        });
        let hs79 = Hs79 {
            tag,
            from_peer: from,
            from_address,
        };
        debug!(from = %from.to_hex(), to = %to.to_hex(), "brokering peer introduction");
        Some((target.addresses.clone(), hs79))
    }

    /// Drop introduction requests older than [`INTRODUCTION_TTL`] with no
    /// matching `HS38` arrival.
    pub fn expire_introductions(&mut self, now: Instant) {
        self.pending_introductions
            .retain(|p| now.duration_since(p.created) < INTRODUCTION_TTL);
    }

    /// Dispatch an incoming chunk through the underlying session.
    pub fn handle_chunk(&mut self, ty: u8, body: &[u8], now: Instant) -> Result<Vec<Delivery>> {
        self.inner.handle_chunk(ty, body, now)
    }

    /// Periodic housekeeping, delegated to the underlying session plus
    /// introduction-table expiry.
    pub fn manage(&mut self, now: Instant) -> Result<()> {
        self.expire_introductions(now);
        self.inner.manage(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmfp_proto::AddressKind;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> Address {
        Address::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 1)), port),
            AddressKind::Public,
        )
    }

    fn session() -> Session {
        Session::new(0x0200_0001, 0x0200_0002, addr(1935), false)
    }

    #[test]
    fn opens_a_main_writer() {
        let server = ServerSession::new(session());
        assert!(server.main_writer() >= 3);
    }

    #[test]
    fn introduce_returns_none_for_unknown_target() {
        let mut server = ServerSession::new(session());
        let from = PeerId::from_public_key(b"a");
        let to = PeerId::from_public_key(b"b");
        let tag = Tag([7u8; 16]);
        assert!(server
            .introduce(from, addr(2000), to, tag, Instant::now())
            .is_none());
    }

    #[test]
    fn introduce_brokers_known_peer() {
        let mut server = ServerSession::new(session());
        let from = PeerId::from_public_key(b"a");
        let to = PeerId::from_public_key(b"b");
        server.announce_peer(to, vec![addr(3000)]);
        let tag = Tag([9u8; 16]);
        let (addresses, hs79) = server
            .introduce(from, addr(2000), to, tag, Instant::now())
            .unwrap();
        assert_eq!(addresses, vec![addr(3000)]);
        assert_eq!(hs79.from_peer, from);
        assert_eq!(hs79.tag, tag);
    }

    #[test]
    fn expire_introductions_drops_stale_entries() {
        let mut server = ServerSession::new(session());
        let from = PeerId::from_public_key(b"a");
        let to = PeerId::from_public_key(b"b");
        server.announce_peer(to, vec![addr(3000)]);
        let old = Instant::now();
        server
            .introduce(from, addr(2000), to, Tag([1u8; 16]), old)
            .unwrap();
        server.expire_introductions(old + INTRODUCTION_TTL + Duration::from_secs(1));
        assert!(server.pending_introductions.is_empty());
    }
}
