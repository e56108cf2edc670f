// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! A session to another peer: the four distinguished NetGroup writers, the
//! group handshake, and per-session `GroupMedia` carriage (§4.8, §4.8.1).

use std::time::Instant;

use bytes::Bytes;
use rtmfp_proto::{group_signature, GroupInit, PeerId};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::session::{Delivery, Session, SessionStatus};

/// One peer-to-peer session, layered over the common [`Session`] state
/// machine (§3 "PeerSession", §4.8).
pub struct PeerSession {
    inner: Session,
    report_writer: u16,
    media_report_writer: u16,
    media_writer: u16,
    data_writer: u16,
    remote_peer_id: Option<PeerId>,
    group_active: bool,
    group_sent_init: bool,
    group_id_txt: Option<String>,
    k_expected: Option<[u8; 32]>,
}

impl PeerSession {
    /// Wrap a freshly-handshaken [`Session`], opening the four distinguished
    /// group writers up front (§4.8 signature table).
    #[must_use]
    pub fn new(mut inner: Session) -> Self {
        let report_writer = inner.open_writer(0, Bytes::copy_from_slice(&group_signature::REPORT));
        let media_report_writer =
            inner.open_writer(0, Bytes::copy_from_slice(&group_signature::MEDIA_REPORT));
        let media_writer = inner.open_writer(0, Bytes::copy_from_slice(&group_signature::MEDIA));
        let data_writer = inner.open_writer(0, Bytes::copy_from_slice(&group_signature::DATA));
        Self {
            inner,
            report_writer,
            media_report_writer,
            media_writer,
            data_writer,
            remote_peer_id: None,
            group_active: false,
            group_sent_init: false,
            group_id_txt: None,
            k_expected: None,
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

    /// Writer carrying `GROUP_REPORT`/`MEMBER`/`ASK_CLOSE`/`BEGIN` opcodes.
    #[must_use]
    pub fn report_writer(&self) -> u16 {
        self.report_writer
    }

    /// Writer carrying `FRAGMENTS_MAP`/`PLAY_PUSH`/`PLAY_PULL`.
    #[must_use]
    pub fn media_report_writer(&self) -> u16 {
        self.media_report_writer
    }

    /// Writer carrying `MEDIA_DATA`/`MEDIA_START`/`MEDIA_NEXT`/`MEDIA_END`.
    #[must_use]
    pub fn media_writer(&self) -> u16 {
        self.media_writer
    }

    /// Writer carrying raw NetGroup data messages.
    #[must_use]
    pub fn data_writer(&self) -> u16 {
        self.data_writer
    }

    /// Whether the group handshake has completed (both sides' `GROUP_INIT`
    /// validated) and the one-time `BEGIN` has been sent (§4.8.1).
    #[must_use]
    pub fn is_group_active(&self) -> bool {
        self.group_active
    }

    /// Begin the group handshake: compute `kConnect`/`kExpected` and queue
    /// our `GROUP_INIT` on the report writer (§4.8.1).
    pub fn start_group_handshake(
        &mut self,
        group_id_txt: &str,
        shared_secret: &[u8],
        near_nonce: &[u8],
        far_nonce: &[u8],
        local_peer_id: PeerId,
    ) {
        let k_connect = rtmfp_crypto::derive_group_key(shared_secret, far_nonce, group_id_txt.as_bytes());
        let k_expected = rtmfp_crypto::derive_group_key(shared_secret, near_nonce, group_id_txt.as_bytes());
        self.k_expected = Some(k_expected);
        self.group_id_txt = Some(group_id_txt.to_string());
        let init = GroupInit {
            group_id_hex: crate::netgroup::group_id_hex(group_id_txt),
            key: k_connect,
            peer_id: local_peer_id,
        };
        if let Some(writer) = self.inner.writer_mut(self.report_writer) {
            let mut body = vec![rtmfp_proto::group_opcode::GROUP_INIT];
            body.extend(init.encode());
            writer.write(rtmfp_proto::Message::new(
                rtmfp_proto::AmfType::Raw,
                None,
                rtmfp_proto::Reliability::Reliable,
                Bytes::from(body),
            ));
        }
        self.group_sent_init = true;
    }

    /// Validate an inbound `GROUP_INIT` against our computed `kExpected` and,
    /// on success, mark the group handshake complete and queue the one-time
    /// `BEGIN` (§4.8.1).
    pub fn handle_group_init(&mut self, body: &[u8]) -> Result<()> {
        let init = GroupInit::decode(body).map_err(SessionError::Protocol)?;
        let expected = self
            .k_expected
            .ok_or(SessionError::UnexpectedHandshakeState("group handshake not started"))?;
        if init.key != expected {
            return Err(SessionError::Application("group_init key mismatch"));
        }
        self.remote_peer_id = Some(init.peer_id);
        if !self.group_active {
            self.group_active = true;
            if let Some(writer) = self.inner.writer_mut(self.report_writer) {
                writer.write(rtmfp_proto::Message::new(
                    rtmfp_proto::AmfType::Raw,
                    None,
                    rtmfp_proto::Reliability::Reliable,
                    Bytes::from(vec![rtmfp_proto::group_opcode::BEGIN]),
                ));
            }
            debug!(peer = ?self.remote_peer_id, "group handshake complete");
        }
        Ok(())
    }

    /// The peer id learned from the remote's `GROUP_INIT`, once validated.
    #[must_use]
    pub fn remote_peer_id(&self) -> Option<PeerId> {
        self.remote_peer_id
    }

    /// The groupspec text this session's group handshake was started for.
    #[must_use]
    pub fn group_id_txt(&self) -> Option<&str> {
        self.group_id_txt.as_deref()
    }

    /// Dispatch an incoming chunk through the underlying session.
    pub fn handle_chunk(&mut self, ty: u8, body: &[u8], now: Instant) -> Result<Vec<Delivery>> {
        self.inner.handle_chunk(ty, body, now)
    }

    /// Periodic housekeeping, delegated to the underlying session.
    pub fn manage(&mut self, now: Instant) -> Result<()> {
        self.inner.manage(now)
    }

    /// Whether the session has reached [`SessionStatus::Connected`].
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.status() == SessionStatus::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmfp_proto::AddressKind;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn addr() -> rtmfp_proto::Address {
        rtmfp_proto::Address::new(
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
    fn opens_four_distinguished_writers() {
        let peer = PeerSession::new(session());
        let ids = [
            peer.report_writer(),
            peer.media_report_writer(),
            peer.media_writer(),
            peer.data_writer(),
        ];
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 4);
    }

    #[test]
    fn group_handshake_activates_on_matching_key() {
        let mut peer = PeerSession::new(session());
        let secret = b"shared-secret-bytes";
        let near = b"near-nonce";
        let far = b"far-nonce";
        let local = PeerId::from_public_key(b"me");
        let remote = PeerId::from_public_key(b"them");
        peer.start_group_handshake("group-id", secret, near, far, local);

        let remote_k_connect = rtmfp_crypto::derive_group_key(secret, near, b"group-id");
        let remote_init = GroupInit {
            group_id_hex: hex::encode(rtmfp_crypto::sha256(b"group-id")),
            key: remote_k_connect,
            peer_id: remote,
        };
        peer.handle_group_init(&remote_init.encode()).unwrap();
        assert!(peer.is_group_active());
        assert_eq!(peer.remote_peer_id(), Some(remote));
    }

    #[test]
    fn group_handshake_rejects_wrong_key() {
        let mut peer = PeerSession::new(session());
        peer.start_group_handshake("group-id", b"secret", b"near", b"far", PeerId::from_public_key(b"me"));
        let bad_init = GroupInit {
            group_id_hex: hex::encode(rtmfp_crypto::sha256(b"group-id")),
            key: [0u8; 32],
            peer_id: PeerId::from_public_key(b"them"),
        };
        assert!(peer.handle_group_init(&bad_init.encode()).is_err());
    }
}
