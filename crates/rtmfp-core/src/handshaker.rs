// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The handshake state machine (§4.2): tag table (connections we initiated),
//! cookie table (initiators we've challenged), DH key agreement, and
//! concurrent-initiation arbitration by lexicographic peer id (§4.2
//! "Concurrent initiation").
//!
//! A [`Handshaker`] is routed to by the session-id-zero scramble (§4.1
//! "Session routing"); everything here is pre-session state. Once a
//! handshake completes, [`HandshakerEvent::SessionEstablished`] carries
//! enough to build a [`crate::session::Session`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::RngCore;
use rtmfp_crypto::{derive_session_keys, DhKeyPair, SessionKeys};
use rtmfp_proto::{Address, Cookie, Credential, Epd, Hs30, Hs38, Hs70, Hs71, Hs78, Nonce73,
    Nonce76, PeerId, Tag};
use tracing::{debug, trace, warn};

use crate::error::{Result, SessionError};
use crate::retry::RetryTimer;

/// Cookies expire 95 s after issue (§4.2 "Timers").
const COOKIE_TTL: Duration = Duration::from_secs(95);

/// Upper bound on simultaneously pending responder handshakes, guarding
/// against cookie-table exhaustion from spoofed `0x30` floods (§7
/// "Resource").
pub const MAX_PENDING_RESPONDERS: usize = 512;

/// State for a handshake we initiated, keyed by the tag we chose (§4.2
/// "Initiator").
#[derive(Debug)]
pub struct PendingInitiator {
    /// What we're dialing: a server URL or a peer id.
    pub epd: Epd,
    /// The tag identifying this attempt on the wire.
    pub tag: Tag,
    /// Retries remaining / backoff schedule for re-sending `0x30`.
    retry: RetryTimer,
    /// Our half of the DH exchange, generated once at dial time.
    dh: DhKeyPair,
    /// Our nonce, sent in HS38, needed again to derive session keys once
    /// HS78 arrives.
    nonce: Nonce76,
    /// The local session id we picked when sending HS38, once sent.
    local_session_id: Option<u32>,
    /// Remote address we last sent `0x30`/`0x38` to.
    address: Address,
    /// The far side's raw DH public key, carried in HS70 and needed again
    /// at HS78 time since HS78 itself carries no key material (§4.2).
    far_public_key: Option<Vec<u8>>,
}

/// State for a handshake someone else initiated and we're responding to,
/// keyed by the cookie we issued (§4.2 "Responder").
#[derive(Debug)]
pub struct PendingResponder {
    /// The cookie we issued in `0x70`.
    cookie: Cookie,
    /// The tag the initiator sent us (echoed nowhere on the wire again, but
    /// useful for diagnostics).
    tag: Tag,
    /// Our half of the DH exchange.
    dh: DhKeyPair,
    /// Our nonce, sent in HS78.
    nonce: Nonce73,
    /// Remote address of the initiator.
    address: Address,
    /// When this cookie was issued.
    created: Instant,
    /// Which id space our own session id gets minted from once we reply
    /// with HS78 (§3 "Session").
    kind: crate::session_id::SessionKind,
}

/// Outcome of feeding a handshake chunk to a [`Handshaker`].
#[derive(Debug)]
pub enum HandshakerEvent {
    /// Send a handshake chunk to `address`.
    Send {
        /// Destination.
        address: Address,
        /// Handshake chunk type (`0x30`/`0x38`/`0x70`/`0x71`/`0x78`/`0x79`).
        chunk_type: u8,
        /// Encoded chunk body.
        body: Vec<u8>,
    },
    /// A session is ready to be created by the caller.
    SessionEstablished {
        /// Local session id we picked (our future `sessionId`).
        local_session_id: u32,
        /// Remote session id the peer picked (our future `farId`).
        far_session_id: u32,
        /// Address the handshake completed at.
        address: Address,
        /// Derived symmetric keys (§4.3).
        keys: SessionKeys,
        /// Whether we were the responder.
        responder: bool,
        /// The far side's canonical peer id, when known (absent for plain
        /// server dials where no peer public key was exchanged).
        peer_id: Option<PeerId>,
        /// The raw DH shared secret, kept so a peer session can later derive
        /// its NetGroup `kConnect`/`kExpected` (§4.8.1) without re-running
        /// the exchange.
        shared_secret: Vec<u8>,
        /// Our own handshake nonce.
        near_nonce: Vec<u8>,
        /// The far side's handshake nonce.
        far_nonce: Vec<u8>,
    },
    /// An HS71 redirection/address list arrived for one of our pending
    /// server or peer dials (§4.2 "Receive 0x71", §4.6 step 2).
    Redirected {
        /// The tag this redirection answers.
        tag: Tag,
        /// Candidate addresses to try next.
        addresses: Vec<Address>,
    },
}

/// The handshake FSM. One instance per [`crate::invoker::Invoker`].
#[derive(Debug)]
pub struct Handshaker {
    local_peer_id: PeerId,
    tag_table: HashMap<[u8; 16], PendingInitiator>,
    cookie_table: HashMap<Vec<u8>, PendingResponder>,
    id_alloc: crate::session_id::SessionIdAllocator,
}

impl Handshaker {
    /// Build a new handshaker for a node identified by `local_peer_id`,
    /// used to break concurrent-initiation ties (§4.2).
    #[must_use]
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            local_peer_id,
            tag_table: HashMap::new(),
            cookie_table: HashMap::new(),
            id_alloc: crate::session_id::SessionIdAllocator::new(),
        }
    }

    /// Start dialing a server or peer: generate a tag, our DH keypair and
    /// nonce, and return the `0x30` chunk to send (§4.2 "HS30").
    pub fn dial(
        &mut self,
        epd: Epd,
        address: Address,
        rng: &mut impl RngCore,
    ) -> HandshakerEvent {
        let tag = Tag::generate(rng);
        let dh = DhKeyPair::generate(rng);
        let nonce = Nonce76::generate(rng);
        let body = Hs30 {
            tag,
            epd: epd.clone(),
        }
        .encode();
        self.tag_table.insert(
            tag.0,
            PendingInitiator {
                epd,
                tag,
                retry: RetryTimer::handshake_dial(),
                dh,
                nonce,
                local_session_id: None,
                address,
                far_public_key: None,
            },
        );
        HandshakerEvent::Send {
            address,
            chunk_type: rtmfp_proto::handshake_chunk_type::HS30,
            body,
        }
    }

    /// Drive retransmission and expiry. Returns re-sends for tags whose
    /// backoff has elapsed and drops ones that exhausted their attempt
    /// budget or cookies older than [`COOKIE_TTL`].
    pub fn manage(&mut self, now: Instant) -> Vec<HandshakerEvent> {
        let mut events = Vec::new();
        self.tag_table.retain(|_, pending| {
            if pending.retry.exhausted() {
                debug!(tag = ?pending.tag.0, "giving up on handshake dial");
                return false;
            }
            if pending.local_session_id.is_none() && pending.retry.is_due(now) {
                pending.retry.record_fired(now);
                events.push(HandshakerEvent::Send {
                    address: pending.address,
                    chunk_type: rtmfp_proto::handshake_chunk_type::HS30,
                    body: Hs30 {
                        tag: pending.tag,
                        epd: pending.epd.clone(),
                    }
                    .encode(),
                });
            }
            true
        });
        self.cookie_table
            .retain(|_, pending| now.duration_since(pending.created) < COOKIE_TTL);
        events
    }

    /// Handle an inbound `0x70` (direct accept) for one of our pending
    /// dials (§4.2 "Receive 0x70").
    pub fn handle_hs70(
        &mut self,
        body: &[u8],
        from: Address,
        rng: &mut impl RngCore,
        is_peer_dial: bool,
    ) -> Result<HandshakerEvent> {
        let hs70 = Hs70::decode(body, is_peer_dial)?;
        let far_public_key = match &hs70.credential {
            Credential::ServerCert(_) => Vec::new(),
            Credential::PeerPublicKey(key) => key.clone(),
        };
        let kind = {
            let pending = self
                .tag_table
                .get(&hs70.tag.0)
                .ok_or(SessionError::UnexpectedHandshakeState("hs70: unknown tag"))?;
            match &pending.epd {
                Epd::Server(_) => crate::session_id::SessionKind::Server,
                Epd::Peer(_) => crate::session_id::SessionKind::Peer,
            }
        };
        let local_session_id = self.id_alloc.next(kind);
        let pending = self
            .tag_table
            .get_mut(&hs70.tag.0)
            .ok_or(SessionError::UnexpectedHandshakeState("hs70: unknown tag"))?;
        pending.address = from;
        pending.far_public_key = Some(far_public_key);
        let body = Hs38 {
            session_id: local_session_id,
            cookie: hs70.cookie,
            public_key: pending.dh.public_bytes(),
            nonce: pending.nonce.clone(),
        }
        .encode();
        pending.local_session_id = Some(local_session_id);
        Ok(HandshakerEvent::Send {
            address: from,
            chunk_type: rtmfp_proto::handshake_chunk_type::HS38,
            body,
        })
    }

    /// Handle an inbound `0x30` (someone dialing us) (§4.2 "Receive 0x30").
    ///
    /// Applies concurrent-initiation arbitration (§4.2): if the caller is a
    /// peer we are *also* currently dialing, and our own peer id sorts
    /// lower, we become the responder and our outbound attempt is dropped.
    /// If our id sorts higher, we refuse: the remote side is expected to
    /// back off and accept our own dial instead.
    pub fn handle_hs30(
        &mut self,
        body: &[u8],
        from: Address,
        now: Instant,
        rng: &mut impl RngCore,
        far_peer_id: Option<PeerId>,
    ) -> Result<Option<HandshakerEvent>> {
        let hs30 = Hs30::decode(body)?;
        if let Epd::Peer(peer_id) = &hs30.epd {
            if self.is_dialing(peer_id) && far_peer_id.is_some_and(|far| self.local_peer_id < far)
            {
                trace!(peer = %peer_id.to_hex(), "concurrent dial: we stay initiator");
                return Ok(None);
            }
            if self.is_dialing(peer_id) {
                debug!(peer = %peer_id.to_hex(), "concurrent dial: yielding to remote initiator");
                self.tag_table.retain(|_, p| !matches!(&p.epd, Epd::Peer(id) if id == peer_id));
            }
        }
        if self.cookie_table.len() >= MAX_PENDING_RESPONDERS {
            warn!("cookie table full, dropping inbound hs30");
            return Err(SessionError::Resource("cookie table exhausted"));
        }
        let cookie = Cookie::generate(rng);
        let dh = DhKeyPair::generate(rng);
        let nonce = Nonce73::generate(rng);
        let credential = match &hs30.epd {
            Epd::Server(_) => Credential::ServerCert([0u8; 77]),
            Epd::Peer(_) => Credential::PeerPublicKey(dh.public_bytes()),
        };
        let reply = Hs70 {
            tag: hs30.tag,
            cookie,
            credential,
        }
        .encode();
        let kind = match &hs30.epd {
            Epd::Server(_) => crate::session_id::SessionKind::Server,
            Epd::Peer(_) => crate::session_id::SessionKind::Peer,
        };
        self.cookie_table.insert(
            cookie.0.to_vec(),
            PendingResponder {
                cookie,
                tag: hs30.tag,
                dh,
                nonce,
                address: from,
                created: now,
                kind,
            },
        );
        Ok(Some(HandshakerEvent::Send {
            address: from,
            chunk_type: rtmfp_proto::handshake_chunk_type::HS70,
            body: reply,
        }))
    }

    /// Handle an inbound `0x38` for a cookie we issued (§4.2 "Receive
    /// 0x38"). The responder has both nonces and the DH shared secret as
    /// soon as this arrives, so the session is established immediately
    /// (both the `0x78` reply and [`HandshakerEvent::SessionEstablished`]
    /// are returned together).
    pub fn handle_hs38(&mut self, body: &[u8], from: Address) -> Result<Vec<HandshakerEvent>> {
        let far_id = rtmfp_proto::peek_far_id(body)?;
        let hs38 = Hs38::decode(body)?;
        let cookie_key = hs38.cookie.0.to_vec();
        let pending = self
            .cookie_table
            .remove(&cookie_key)
            .ok_or(SessionError::UnexpectedHandshakeState("hs38: unknown cookie"))?;
        let shared_secret = pending.dh.agree(&hs38.public_key)?;
        let keys = derive_session_keys(&shared_secret, &hs38.nonce.0, &pending.nonce.0);
        let near_nonce = pending.nonce.0.to_vec();
        let far_nonce = hs38.nonce.0.to_vec();
        let reply = Hs78 {
            session_id: far_id,
            nonce: pending.nonce,
        }
        .encode();
        let peer_id = PeerId::from_public_key(&hs38.public_key);
        let local_session_id = self.id_alloc.next(pending.kind);
        Ok(vec![
            HandshakerEvent::Send {
                address: from,
                chunk_type: rtmfp_proto::handshake_chunk_type::HS78,
                body: reply,
            },
            HandshakerEvent::SessionEstablished {
                local_session_id,
                far_session_id: far_id,
                address: from,
                keys,
                responder: true,
                peer_id: Some(peer_id),
                shared_secret,
                near_nonce,
                far_nonce,
            },
        ])
    }

    /// Handle an inbound `0x78` completing an initiator's handshake (§4.2
    /// "Receive 0x78"). HS78 carries no key material of its own (just the
    /// far side's session id and nonce), so we correlate it to a pending
    /// dial by source address — only one handshake is ever outstanding per
    /// address at a time (§3 "a peer appears in at most one handshake table
    /// ... at a time").
    pub fn handle_hs78(&mut self, body: &[u8], from: Address) -> Result<HandshakerEvent> {
        let far_id = rtmfp_proto::peek_far_id(body)?;
        let hs78 = Hs78::decode(body)?;
        let tag_bytes = self
            .tag_table
            .iter()
            .find(|(_, p)| p.address == from && p.local_session_id.is_some())
            .map(|(tag, _)| *tag)
            .ok_or(SessionError::UnexpectedHandshakeState("hs78: no pending dial for address"))?;
        let pending = self
            .tag_table
            .remove(&tag_bytes)
            .ok_or(SessionError::UnexpectedHandshakeState("hs78: unknown tag"))?;
        let far_public_key = pending.far_public_key.clone().unwrap_or_default();
        let shared_secret = pending.dh.agree(&far_public_key)?;
        let keys = derive_session_keys(&shared_secret, &pending.nonce.0, &hs78.nonce.0);
        let near_nonce = pending.nonce.0.to_vec();
        let far_nonce = hs78.nonce.0.to_vec();
        let local_session_id = pending
            .local_session_id
            .ok_or(SessionError::UnexpectedHandshakeState("hs78: hs38 not yet sent"))?;
        let peer_id = matches!(pending.epd, Epd::Peer(_))
            .then(|| PeerId::from_public_key(&far_public_key));
        Ok(HandshakerEvent::SessionEstablished {
            local_session_id,
            far_session_id: far_id,
            address: from,
            keys,
            responder: false,
            peer_id,
            shared_secret,
            near_nonce,
            far_nonce,
        })
    }

    /// Handle an inbound `0x71` redirection/address list (§4.2 "Receive
    /// 0x71", §4.6 step 2).
    pub fn handle_hs71(&self, body: &[u8]) -> Result<HandshakerEvent> {
        let hs71 = Hs71::decode(body)?;
        Ok(HandshakerEvent::Redirected {
            tag: hs71.tag,
            addresses: hs71.addresses,
        })
    }

    /// Act on an `0x71` redirection for a still-pending dial: re-send `0x30`
    /// directly to each candidate address (§4.6 step 2). This is how a peer
    /// dial routed through a rendezvous server's address turns into a direct
    /// dial against the callee once the server answers with its addresses.
    /// Returns no events if the tag is no longer pending (already
    /// established, or the dial gave up before the redirection arrived).
    pub fn redirect(&mut self, tag: Tag, addresses: &[Address]) -> Vec<HandshakerEvent> {
        let Some(pending) = self.tag_table.get_mut(&tag.0) else {
            return Vec::new();
        };
        if pending.local_session_id.is_some() {
            return Vec::new();
        }
        addresses
            .iter()
            .map(|&address| {
                pending.address = address;
                HandshakerEvent::Send {
                    address,
                    chunk_type: rtmfp_proto::handshake_chunk_type::HS30,
                    body: Hs30 { tag: pending.tag, epd: pending.epd.clone() }.encode(),
                }
            })
            .collect()
    }

    fn is_dialing(&self, peer_id: &PeerId) -> bool {
        self.tag_table
            .values()
            .any(|p| matches!(&p.epd, Epd::Peer(id) if id == peer_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> Address {
        Address::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port),
            rtmfp_proto::AddressKind::Public,
        )
    }

    #[test]
    fn dial_inserts_pending_initiator_and_emits_hs30() {
        let mut hs = Handshaker::new(PeerId::from_public_key(b"me"));
        let mut rng = StepRng::new(7, 1);
        let event = hs.dial(Epd::Server("rtmfp://host".to_string()), addr(1935), &mut rng);
        assert!(matches!(
            event,
            HandshakerEvent::Send { chunk_type, .. }
                if chunk_type == rtmfp_proto::handshake_chunk_type::HS30
        ));
        assert_eq!(hs.tag_table.len(), 1);
    }

    #[test]
    fn manage_drops_exhausted_initiators() {
        let mut hs = Handshaker::new(PeerId::from_public_key(b"me"));
        let mut rng = StepRng::new(7, 1);
        hs.dial(Epd::Server("rtmfp://host".to_string()), addr(1935), &mut rng);
        let tag = *hs.tag_table.keys().next().unwrap();
        hs.tag_table.get_mut(&tag).unwrap().retry = RetryTimer::new(
            Duration::from_millis(0),
            crate::retry::Backoff::Fixed,
            0,
        );
        let _ = hs.manage(Instant::now());
        assert!(hs.tag_table.is_empty());
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn responder_rejects_when_cookie_table_full() {
        let mut hs = Handshaker::new(PeerId::from_public_key(b"me"));
        let mut rng = StepRng::new(7, 1);
        for i in 0..MAX_PENDING_RESPONDERS {
            let mut raw = [0u8; 64];
            raw[0..2].copy_from_slice(&(i as u16).to_be_bytes());
            hs.cookie_table.insert(
                raw.to_vec(),
                PendingResponder {
                    cookie: Cookie(raw),
                    tag: Tag::generate(&mut rng),
                    dh: DhKeyPair::generate(&mut rng),
                    nonce: Nonce73::generate(&mut rng),
                    address: addr(1935),
                    created: Instant::now(),
                    kind: crate::session_id::SessionKind::Server,
                },
            );
        }
        let hs30 = Hs30 {
            tag: Tag::generate(&mut rng),
            epd: Epd::Server("rtmfp://host".to_string()),
        }
        .encode();
        let result = hs.handle_hs30(&hs30, addr(2000), Instant::now(), &mut rng, None);
        assert!(result.is_err());
    }
}
