// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Local session id allocation (§3 "Session"): server sessions draw from a
//! counter starting at `0x02000000`, peer sessions from `0x03000000`.

/// First local session id handed to a server (`ServerSession`).
pub const SERVER_SESSION_BASE: u32 = 0x0200_0000;
/// First local session id handed to a peer (`PeerSession`).
pub const PEER_SESSION_BASE: u32 = 0x0300_0000;

/// Which family of session a [`SessionIdAllocator`] is minting ids for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// Rendezvous/server session.
    Server,
    /// Direct peer-to-peer session.
    Peer,
}

/// Monotonic per-kind counter handing out fresh local session ids.
#[derive(Debug, Clone)]
pub struct SessionIdAllocator {
    next_server: u32,
    next_peer: u32,
}

impl Default for SessionIdAllocator {
    fn default() -> Self {
        Self {
            next_server: SERVER_SESSION_BASE,
            next_peer: PEER_SESSION_BASE,
        }
    }
}

impl SessionIdAllocator {
    /// Build a fresh allocator at the base counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next id for `kind`.
    pub fn next(&mut self, kind: SessionKind) -> u32 {
        match kind {
            SessionKind::Server => {
                let id = self.next_server;
                self.next_server = self.next_server.wrapping_add(1);
                id
            }
            SessionKind::Peer => {
                let id = self.next_peer;
                self.next_peer = self.next_peer.wrapping_add(1);
                id
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_and_peer_ids_start_at_their_own_base() {
        let mut alloc = SessionIdAllocator::new();
        assert_eq!(alloc.next(SessionKind::Server), SERVER_SESSION_BASE);
        assert_eq!(alloc.next(SessionKind::Peer), PEER_SESSION_BASE);
        assert_eq!(alloc.next(SessionKind::Server), SERVER_SESSION_BASE + 1);
    }
}
