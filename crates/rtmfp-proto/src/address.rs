// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire representation of RTMFP addresses (§3 "Address").
//!
//! Addresses are carried type-tagged: the low two bits of the type byte pick
//! [`AddressKind`], bit 0x80 marks the family as IPv6 rather than IPv4. This
//! matches the "`(typeCode, address)`" tuples referenced by §4.2's `0x71`
//! redirection chunk and §4.8.2's Group Report.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::ProtoError;

/// How an address was learned, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    /// A publicly routable address, as seen by the remote side.
    Public,
    /// An address on the same local subnet as the peer that reported it.
    Local,
    /// An address forwarded on behalf of a third party (rendezvous/host).
    Redirection,
}

impl AddressKind {
    const fn low_bits(self) -> u8 {
        match self {
            AddressKind::Local => 0x01,
            AddressKind::Public => 0x02,
            AddressKind::Redirection => 0x03,
        }
    }

    fn from_low_bits(bits: u8) -> Result<Self, ProtoError> {
        match bits {
            0x01 => Ok(AddressKind::Local),
            0x02 => Ok(AddressKind::Public),
            0x03 => Ok(AddressKind::Redirection),
            _ => Err(ProtoError::UnknownMarker(bits)),
        }
    }
}

const IPV6_FLAG: u8 = 0x80;

/// A classified `(ip, port)` pair as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    /// Socket address (IPv4 or IPv6).
    pub socket: SocketAddr,
    /// How this address was learned.
    pub kind: AddressKind,
}

impl Address {
    /// Build a new classified address.
    #[must_use]
    pub fn new(socket: SocketAddr, kind: AddressKind) -> Self {
        Self { socket, kind }
    }

    fn type_byte(&self) -> u8 {
        let family = if self.socket.is_ipv6() { IPV6_FLAG } else { 0 };
        family | self.kind.low_bits()
    }

    /// Encode as `type(8) || ip(4 or 16) || port(16, big-endian)`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.type_byte());
        match self.socket.ip() {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
        }
        out.extend_from_slice(&self.socket.port().to_be_bytes());
    }

    /// Decode one address from the front of `buf`, returning it and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), ProtoError> {
        let type_byte = *buf.first().ok_or(ProtoError::Truncated)?;
        let is_v6 = type_byte & IPV6_FLAG != 0;
        let kind = AddressKind::from_low_bits(type_byte & !IPV6_FLAG)?;
        let ip_len = if is_v6 { 16 } else { 4 };
        let needed = 1 + ip_len + 2;
        if buf.len() < needed {
            return Err(ProtoError::Truncated);
        }
        let ip_bytes = &buf[1..1 + ip_len];
        let ip = if is_v6 {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(ip_bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        } else {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(ip_bytes);
            IpAddr::V4(Ipv4Addr::from(octets))
        };
        let port = u16::from_be_bytes([buf[1 + ip_len], buf[2 + ip_len]]);
        Ok((
            Self::new(SocketAddr::new(ip, port), kind),
            needed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn round_trips_ipv4_public() {
        let addr = Address::new(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)), 1935),
            AddressKind::Public,
        );
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        let (decoded, consumed) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn round_trips_ipv6_redirection() {
        let addr = Address::new(
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 9000),
            AddressKind::Redirection,
        );
        let mut buf = Vec::new();
        addr.encode(&mut buf);
        let (decoded, _) = Address::decode(&buf).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn truncated_buffer_is_an_error() {
        assert_eq!(Address::decode(&[0x02, 1, 2]), Err(ProtoError::Truncated));
    }
}
