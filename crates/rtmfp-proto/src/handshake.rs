// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Handshake chunk bodies (§4.2): `0x30`/`0x38`/`0x70`/`0x71`/`0x78`/`0x79`.
//!
//! These ride inside a [`crate::chunk`]-framed packet whose
//! [`crate::marker::HANDSHAKE`] marker always carries session id 0.

use rand::RngCore;

use crate::address::Address;
use crate::error::ProtoError;
use crate::peer_id::PeerId;
use crate::varint::{read_u32, write_u32};

/// Handshake chunk type bytes (§4.2).
pub mod chunk_type {
    /// Initiator -> responder: EPD + tag.
    pub const HS30: u8 = 0x30;
    /// Initiator -> responder: session id, cookie echo, public key, nonce.
    pub const HS38: u8 = 0x38;
    /// Responder -> initiator: cookie + certificate/public key.
    pub const HS70: u8 = 0x70;
    /// Responder -> initiator: redirection/address exchange.
    pub const HS71: u8 = 0x71;
    /// Responder -> initiator: session id + nonce, handshake complete.
    pub const HS78: u8 = 0x78;
    /// Server -> callee: rendezvous forward ("peer X will contact you").
    pub const HS79: u8 = 0x79;
}

/// 16 random bytes identifying one pending initiator handshake (§3 "Tag").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(pub [u8; 16]);

impl Tag {
    /// Generate a fresh random tag.
    #[must_use]
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

/// 64 random bytes proving address-reachability of an initiator (§3 "Cookie").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub [u8; 64]);

impl Cookie {
    /// Generate a fresh random cookie.
    #[must_use]
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 64];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }
}

const NONCE76_PREFIX: [u8; 5] = [0x02, 0x1D, 0x02, 0x41, 0x0E];
const NONCE76_SUFFIX: [u8; 7] = [0x03, 0x1A, 0x02, 0x0A, 0x02, 0x1E, 0x02];
const NONCE73_PREFIX: [u8; 9] = [0x03, 0x1A, 0x00, 0x00, 0x02, 0x1E, 0x00, 0x41, 0x0E];

/// The initiator's 76-byte handshake nonce (§4.2 HS38).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce76(pub [u8; 76]);

impl Nonce76 {
    /// Build from 64 random middle bytes, filling in the literal prefix/suffix.
    #[must_use]
    pub fn new(random: [u8; 64]) -> Self {
        let mut bytes = [0u8; 76];
        bytes[0..5].copy_from_slice(&NONCE76_PREFIX);
        bytes[5..69].copy_from_slice(&random);
        bytes[69..76].copy_from_slice(&NONCE76_SUFFIX);
        Self(bytes)
    }

    /// Generate with fresh random middle bytes.
    #[must_use]
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut random = [0u8; 64];
        rng.fill_bytes(&mut random);
        Self::new(random)
    }

    /// Parse from exactly 76 bytes, validating the literal prefix/suffix.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() != 76 {
            return Err(ProtoError::Truncated);
        }
        if buf[0..5] != NONCE76_PREFIX || buf[69..76] != NONCE76_SUFFIX {
            return Err(ProtoError::UnknownSignature);
        }
        let mut bytes = [0u8; 76];
        bytes.copy_from_slice(buf);
        Ok(Self(bytes))
    }
}

/// The responder's 73-byte handshake nonce (§4.2 HS78).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce73(pub [u8; 73]);

impl Nonce73 {
    /// Build from 64 random trailing bytes, filling in the literal prefix.
    #[must_use]
    pub fn new(random: [u8; 64]) -> Self {
        let mut bytes = [0u8; 73];
        bytes[0..9].copy_from_slice(&NONCE73_PREFIX);
        bytes[9..73].copy_from_slice(&random);
        Self(bytes)
    }

    /// Generate with fresh random trailing bytes.
    #[must_use]
    pub fn generate<R: RngCore>(rng: &mut R) -> Self {
        let mut random = [0u8; 64];
        rng.fill_bytes(&mut random);
        Self::new(random)
    }

    /// Parse from exactly 73 bytes, validating the literal prefix.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() != 73 {
            return Err(ProtoError::Truncated);
        }
        if buf[0..9] != NONCE73_PREFIX {
            return Err(ProtoError::UnknownSignature);
        }
        let mut bytes = [0u8; 73];
        bytes.copy_from_slice(buf);
        Ok(Self(bytes))
    }
}

/// Endpoint descriptor: what an `HS30` initiator wants to reach (§3 "EPD").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Epd {
    /// Dial a server at this URL.
    Server(String),
    /// Dial a specific peer, introduced by the server (§4.6).
    Peer(PeerId),
}

const EPD_SERVER: u8 = 0x0A;
const EPD_PEER: u8 = 0x0F;

impl Epd {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Epd::Server(url) => {
                out.push(EPD_SERVER);
                out.extend_from_slice(url.as_bytes());
            }
            Epd::Peer(peer_id) => {
                out.push(EPD_PEER);
                out.extend_from_slice(peer_id.as_bytes());
            }
        }
    }

    fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        let kind = *buf.first().ok_or(ProtoError::Truncated)?;
        match kind {
            EPD_SERVER => Ok(Epd::Server(
                String::from_utf8_lossy(&buf[1..]).into_owned(),
            )),
            EPD_PEER => {
                if buf.len() < 33 {
                    return Err(ProtoError::Truncated);
                }
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&buf[1..33]);
                Ok(Epd::Peer(PeerId::from_bytes(bytes)))
            }
            other => Err(ProtoError::UnknownMarker(other)),
        }
    }
}

/// Body of an `HS30` chunk: tag + EPD.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs30 {
    /// Pending-handshake tag.
    pub tag: Tag,
    /// What we want to reach.
    pub epd: Epd,
}

impl Hs30 {
    /// Encode this chunk's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.epd.encode(&mut out);
        out.extend_from_slice(&self.tag.0);
        out
    }

    /// Decode this chunk's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 16 {
            return Err(ProtoError::Truncated);
        }
        let split = buf.len() - 16;
        let epd = Epd::decode(&buf[..split])?;
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[split..]);
        Ok(Self {
            tag: Tag(tag_bytes),
            epd,
        })
    }
}

const SIGNATURE_PUBLIC_KEY: [u8; 2] = [0x1D, 0x02];

/// Credential carried in an `HS70` response: either a server certificate or
/// a signed peer public key (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Fixed-size server certificate.
    ServerCert([u8; 77]),
    /// DH public key, signature-prefixed.
    PeerPublicKey(Vec<u8>),
}

impl Credential {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Credential::ServerCert(bytes) => out.extend_from_slice(bytes),
            Credential::PeerPublicKey(key) => {
                out.extend_from_slice(&SIGNATURE_PUBLIC_KEY);
                out.extend_from_slice(key);
            }
        }
    }

    fn decode(buf: &[u8], is_peer: bool) -> Result<Self, ProtoError> {
        if is_peer {
            if buf.len() < 2 || buf[0..2] != SIGNATURE_PUBLIC_KEY {
                return Err(ProtoError::UnknownSignature);
            }
            Ok(Credential::PeerPublicKey(buf[2..].to_vec()))
        } else {
            if buf.len() != 77 {
                return Err(ProtoError::Truncated);
            }
            let mut bytes = [0u8; 77];
            bytes.copy_from_slice(buf);
            Ok(Credential::ServerCert(bytes))
        }
    }
}

/// Body of an `HS70` chunk: echoed tag + cookie + credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs70 {
    /// Echoed initiator tag.
    pub tag: Tag,
    /// Freshly issued responder cookie.
    pub cookie: Cookie,
    /// Server certificate or peer public key.
    pub credential: Credential,
}

impl Hs70 {
    /// Encode this chunk's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 64 + 80);
        out.extend_from_slice(&self.tag.0);
        out.extend_from_slice(&self.cookie.0);
        self.credential.encode(&mut out);
        out
    }

    /// Decode this chunk's body. `is_peer` disambiguates a peer public key
    /// from a server certificate (the caller knows which `Epd` it sent).
    pub fn decode(buf: &[u8], is_peer: bool) -> Result<Self, ProtoError> {
        if buf.len() < 16 + 64 {
            return Err(ProtoError::Truncated);
        }
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[0..16]);
        let mut cookie_bytes = [0u8; 64];
        cookie_bytes.copy_from_slice(&buf[16..80]);
        let credential = Credential::decode(&buf[80..], is_peer)?;
        Ok(Self {
            tag: Tag(tag_bytes),
            cookie: Cookie(cookie_bytes),
            credential,
        })
    }
}

/// Trailing byte appended to `HS38`/`HS78` bodies (§4.2).
pub const HANDSHAKE_TRAILER: u8 = 0x58;

/// Body of an `HS38` chunk: our session id, the echoed cookie, our DH public
/// key, and our nonce (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs38 {
    /// Session id the initiator has chosen for itself.
    pub session_id: u32,
    /// Echoed cookie from `HS70`.
    pub cookie: Cookie,
    /// DH public key, signature-prefixed.
    pub public_key: Vec<u8>,
    /// 76-byte initiator nonce.
    pub nonce: Nonce76,
}

impl Hs38 {
    /// Encode this chunk's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.extend_from_slice(&self.cookie.0);
        out.extend_from_slice(&SIGNATURE_PUBLIC_KEY);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.nonce.0);
        out.push(HANDSHAKE_TRAILER);
        out
    }

    /// Decode this chunk's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 4 + 64 + 2 + 76 + 1 {
            return Err(ProtoError::Truncated);
        }
        let session_id = u32::from_be_bytes(buf[0..4].try_into().unwrap_or_default());
        let mut cookie_bytes = [0u8; 64];
        cookie_bytes.copy_from_slice(&buf[4..68]);
        if buf[68..70] != SIGNATURE_PUBLIC_KEY {
            return Err(ProtoError::UnknownSignature);
        }
        let key_end = buf.len() - 76 - 1;
        let public_key = buf[70..key_end].to_vec();
        let nonce = Nonce76::from_bytes(&buf[key_end..key_end + 76])?;
        Ok(Self {
            session_id,
            cookie: Cookie(cookie_bytes),
            public_key,
            nonce,
        })
    }
}

/// Body of an `HS78` chunk: the responder's session id and nonce (§4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs78 {
    /// Responder's session id (becomes the initiator's `farId`).
    pub session_id: u32,
    /// 73-byte responder nonce.
    pub nonce: Nonce73,
}

impl Hs78 {
    /// Encode this chunk's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 73 + 1);
        out.extend_from_slice(&self.session_id.to_be_bytes());
        out.extend_from_slice(&self.nonce.0);
        out.push(HANDSHAKE_TRAILER);
        out
    }

    /// Decode this chunk's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 4 + 73 + 1 {
            return Err(ProtoError::Truncated);
        }
        let session_id = u32::from_be_bytes(buf[0..4].try_into().unwrap_or_default());
        let nonce = Nonce73::from_bytes(&buf[4..77])?;
        Ok(Self { session_id, nonce })
    }
}

/// Body of an `HS71` chunk: echoed tag + a list of type-tagged addresses
/// (§4.2, §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs71 {
    /// Echoed initiator tag.
    pub tag: Tag,
    /// Addresses the responder (or rendezvous server) knows about the
    /// intended peer/alternate path.
    pub addresses: Vec<Address>,
}

impl Hs71 {
    /// Encode this chunk's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tag.0);
        for addr in &self.addresses {
            addr.encode(&mut out);
        }
        out
    }

    /// Decode this chunk's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 16 {
            return Err(ProtoError::Truncated);
        }
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[0..16]);
        let mut pos = 16;
        let mut addresses = Vec::new();
        while pos < buf.len() {
            let (addr, n) = Address::decode(&buf[pos..])?;
            addresses.push(addr);
            pos += n;
        }
        Ok(Self {
            tag: Tag(tag_bytes),
            addresses,
        })
    }
}

/// Body of an `HS79` rendezvous-forward chunk: the server telling a callee
/// "peer `from_peer` at `from_address` will contact you with tag `tag`"
/// (§4.6 step 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hs79 {
    /// Tag the dialing peer used in its `HS30`, so the callee can match the
    /// incoming `HS38`.
    pub tag: Tag,
    /// Identity of the dialing peer.
    pub from_peer: PeerId,
    /// Address the dialing peer is contacting from.
    pub from_address: Address,
}

impl Hs79 {
    /// Encode this chunk's body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 32 + 19);
        out.extend_from_slice(&self.tag.0);
        out.extend_from_slice(self.from_peer.as_bytes());
        self.from_address.encode(&mut out);
        out
    }

    /// Decode this chunk's body.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtoError> {
        if buf.len() < 16 + 32 {
            return Err(ProtoError::Truncated);
        }
        let mut tag_bytes = [0u8; 16];
        tag_bytes.copy_from_slice(&buf[0..16]);
        let mut peer_bytes = [0u8; 32];
        peer_bytes.copy_from_slice(&buf[16..48]);
        let (from_address, _) = Address::decode(&buf[48..])?;
        Ok(Self {
            tag: Tag(tag_bytes),
            from_peer: PeerId::from_bytes(peer_bytes),
            from_address,
        })
    }
}

/// `far_id` field helper used by both sides of `HS38`: the first four bytes
/// of the body are the initiator's chosen session id, read without the rest
/// of the structure (used by a responder validating a cookie before fully
/// parsing, per §4.2 "Responder: Receive 0x38").
pub fn peek_far_id(hs38_body: &[u8]) -> Result<u32, ProtoError> {
    if hs38_body.len() < 4 {
        return Err(ProtoError::Truncated);
    }
    let (value, _) = read_u32(hs38_body)?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn hs30_round_trips_server_epd() {
        let hs30 = Hs30 {
            tag: Tag::generate(&mut rng()),
            epd: Epd::Server("rtmfp://example.com/app".to_string()),
        };
        let decoded = Hs30::decode(&hs30.encode()).unwrap();
        assert_eq!(decoded, hs30);
    }

    #[test]
    fn hs30_round_trips_peer_epd() {
        let hs30 = Hs30 {
            tag: Tag::generate(&mut rng()),
            epd: Epd::Peer(PeerId::from_public_key(b"peer-key")),
        };
        let decoded = Hs30::decode(&hs30.encode()).unwrap();
        assert_eq!(decoded, hs30);
    }

    #[test]
    fn hs70_round_trips_server_cert() {
        let hs70 = Hs70 {
            tag: Tag::generate(&mut rng()),
            cookie: Cookie::generate(&mut rng()),
            credential: Credential::ServerCert([7u8; 77]),
        };
        let decoded = Hs70::decode(&hs70.encode(), false).unwrap();
        assert_eq!(decoded, hs70);
    }

    #[test]
    fn hs70_round_trips_peer_key() {
        let hs70 = Hs70 {
            tag: Tag::generate(&mut rng()),
            cookie: Cookie::generate(&mut rng()),
            credential: Credential::PeerPublicKey(vec![9u8; 128]),
        };
        let decoded = Hs70::decode(&hs70.encode(), true).unwrap();
        assert_eq!(decoded, hs70);
    }

    #[test]
    fn hs38_round_trips() {
        let hs38 = Hs38 {
            session_id: 0x0200_0001,
            cookie: Cookie::generate(&mut rng()),
            public_key: vec![3u8; 128],
            nonce: Nonce76::generate(&mut rng()),
        };
        let decoded = Hs38::decode(&hs38.encode()).unwrap();
        assert_eq!(decoded, hs38);
        assert_eq!(peek_far_id(&hs38.encode()).unwrap(), hs38.session_id);
    }

    #[test]
    fn hs78_round_trips() {
        let hs78 = Hs78 {
            session_id: 0x0300_0002,
            nonce: Nonce73::generate(&mut rng()),
        };
        let decoded = Hs78::decode(&hs78.encode()).unwrap();
        assert_eq!(decoded, hs78);
    }

    #[test]
    fn hs71_round_trips_with_addresses() {
        let hs71 = Hs71 {
            tag: Tag::generate(&mut rng()),
            addresses: vec![
                Address::new(
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 1935),
                    crate::address::AddressKind::Local,
                ),
                Address::new(
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)), 1935),
                    crate::address::AddressKind::Public,
                ),
            ],
        };
        let decoded = Hs71::decode(&hs71.encode()).unwrap();
        assert_eq!(decoded, hs71);
    }

    #[test]
    fn hs79_round_trips() {
        let hs79 = Hs79 {
            tag: Tag::generate(&mut rng()),
            from_peer: PeerId::from_public_key(b"dialer"),
            from_address: Address::new(
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 2)), 1935),
                crate::address::AddressKind::Public,
            ),
        };
        let decoded = Hs79::decode(&hs79.encode()).unwrap();
        assert_eq!(decoded, hs79);
    }

    #[test]
    fn nonce_rejects_bad_prefix() {
        let bad = vec![0u8; 76];
        assert!(Nonce76::from_bytes(&bad).is_err());
    }
}
