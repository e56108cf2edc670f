// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet-level framing (§4.1): the scrambled session id, AES-128-CBC
//! envelope, CRC guard, and the `marker + timestamp [+ timeEcho]` header
//! that leads every decrypted body.

use rtmfp_crypto::{checksum, Engine};

use crate::error::ProtoError;
use crate::marker;

/// Maximum size of one RTMFP datagram (§6).
pub const MAX_PACKET_SIZE: usize = 1192;

const BLOCK: usize = 16;
const CRC_LEN: usize = 2;
/// Scrambled session id occupies the first 4 bytes of every datagram.
const SESSION_ID_LEN: usize = 4;
/// `(total + PAD_ALIGN_OFFSET) % 16 == 0` — "one plaintext block plus five
/// known bytes" (§4.1 "Outgoing padding").
const PAD_ALIGN_OFFSET: usize = 5;

/// A parsed packet header: the leading `marker + timestamp [+ timeEcho]`
/// fields that sit at the front of every decrypted body (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Marker byte (§4.1/marker module) selecting framing variant.
    pub marker: u8,
    /// Sender's timestamp, in units of 4ms.
    pub timestamp: u16,
    /// Echo of the peer's last-seen timestamp, present on echo markers.
    pub time_echo: Option<u16>,
}

impl PacketHeader {
    /// Number of header bytes this value serializes to.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        1 + 2 + if self.time_echo.is_some() { 2 } else { 0 }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.marker);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        if let Some(echo) = self.time_echo {
            out.extend_from_slice(&echo.to_be_bytes());
        }
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), ProtoError> {
        if buf.is_empty() {
            return Err(ProtoError::Truncated);
        }
        let marker = buf[0];
        if buf.len() < 3 {
            return Err(ProtoError::Truncated);
        }
        let timestamp = u16::from_be_bytes([buf[1], buf[2]]);
        let mut consumed = 3;
        let time_echo = if marker::has_time_echo(marker) {
            if buf.len() < 5 {
                return Err(ProtoError::Truncated);
            }
            consumed = 5;
            Some(u16::from_be_bytes([buf[3], buf[4]]))
        } else {
            None
        };
        Ok((
            Self {
                marker,
                timestamp,
                time_echo,
            },
            consumed,
        ))
    }
}

/// `scrambledId = w0 ^ w1 ^ w2` over the first three little-endian 32-bit
/// words of the encrypted body (§4.1). Handshake packets (session id 0)
/// happen to scramble to zero because the responder's default key produces
/// an all-zero XOR only by convention of `startHandshake`'s fixed prefix; we
/// simply compute the XOR here and let the caller special-case zero.
fn scramble(encrypted: &[u8]) -> Result<u32, ProtoError> {
    if encrypted.len() < 12 {
        return Err(ProtoError::Truncated);
    }
    let word = |i: usize| -> u32 {
        u32::from_le_bytes([
            encrypted[i],
            encrypted[i + 1],
            encrypted[i + 2],
            encrypted[i + 3],
        ])
    };
    Ok(word(0) ^ word(4) ^ word(8))
}

/// Pad `plaintext` (which already contains the 2-byte CRC placeholder) with
/// `0xFF` until `(plaintext.len() + PAD_ALIGN_OFFSET) % 16 == 0`, then extend
/// to the next full AES block. The CRC-alignment rule determines *where*
/// padding starts; the block-size rule determines how far it must go for the
/// cipher to accept the buffer.
fn pad_for_encryption(plaintext: &mut Vec<u8>) {
    while (plaintext.len() + PAD_ALIGN_OFFSET) % BLOCK != 0 {
        plaintext.push(0xFF);
    }
    while plaintext.len() % BLOCK != 0 {
        plaintext.push(0xFF);
    }
}

/// Build a full outgoing datagram: scrambled session id (plaintext) followed
/// by the AES-128-CBC ciphertext of `crc(2) || header || chunks`.
///
/// `session_id` is the *local* session id the peer will use to route this
/// packet back to us (0 for handshake packets, per §4.1).
pub fn encode_packet(
    session_id: u32,
    header: &PacketHeader,
    chunks: &[u8],
    engine: &Engine,
) -> Result<Vec<u8>, ProtoError> {
    let mut plaintext = vec![0u8; CRC_LEN];
    header.encode(&mut plaintext);
    plaintext.extend_from_slice(chunks);
    pad_for_encryption(&mut plaintext);

    let crc = checksum(&plaintext[CRC_LEN..]);
    plaintext[0..CRC_LEN].copy_from_slice(&crc.to_be_bytes());

    engine.encode(&mut plaintext)?;

    let scrambled = if session_id == 0 {
        0
    } else {
        scramble(&plaintext)? ^ session_id
    };

    let mut datagram = Vec::with_capacity(SESSION_ID_LEN + plaintext.len());
    datagram.extend_from_slice(&scrambled.to_le_bytes());
    datagram.extend_from_slice(&plaintext);

    if datagram.len() > MAX_PACKET_SIZE {
        return Err(ProtoError::PacketTooLarge(datagram.len()));
    }
    Ok(datagram)
}

/// A decoded incoming datagram: the routing id plus the decrypted,
/// CRC-verified header and chunk bytes.
pub struct DecodedPacket {
    /// Scrambled-session-id XORed back to the raw local session id (0 for
    /// handshake packets).
    pub session_id: u32,
    /// Parsed marker/timestamp/echo header.
    pub header: PacketHeader,
    /// Remaining plaintext after the header: the chunk stream.
    pub body: Vec<u8>,
}

/// Decrypt and validate one incoming datagram.
///
/// `engine` must hold the decryption key for the session this datagram's
/// scrambled id resolves to (the caller is responsible for that routing
/// lookup; `rtmfp_crypto::Engine::handshake()` for session id 0).
pub fn decode_packet(datagram: &[u8], engine: &Engine) -> Result<DecodedPacket, ProtoError> {
    if datagram.len() < SESSION_ID_LEN + BLOCK {
        return Err(ProtoError::Truncated);
    }
    let scrambled = u32::from_le_bytes([
        datagram[0],
        datagram[1],
        datagram[2],
        datagram[3],
    ]);
    let mut plaintext = datagram[SESSION_ID_LEN..].to_vec();
    engine.decode(&mut plaintext)?;

    let session_id = if scrambled == 0 {
        0
    } else {
        scrambled ^ scramble(&plaintext)?
    };

    if plaintext.len() < CRC_LEN {
        return Err(ProtoError::Truncated);
    }
    let expected = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    let computed = checksum(&plaintext[CRC_LEN..]);
    if expected != computed {
        return Err(ProtoError::BadCrc { expected, computed });
    }

    let (header, header_len) = PacketHeader::decode(&plaintext[CRC_LEN..])?;
    let body = plaintext[CRC_LEN + header_len..].to_vec();

    Ok(DecodedPacket {
        session_id,
        header,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtmfp_crypto::Engine;

    #[test]
    fn round_trips_handshake_packet() {
        let engine = Engine::handshake();
        let header = PacketHeader {
            marker: marker::HANDSHAKE,
            timestamp: 1234,
            time_echo: None,
        };
        let chunks = b"hello-handshake-chunk".to_vec();
        let datagram = encode_packet(0, &header, &chunks, &engine).unwrap();
        let decoded = decode_packet(&datagram, &engine).unwrap();
        assert_eq!(decoded.session_id, 0);
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.body, chunks);
    }

    #[test]
    fn round_trips_session_packet_with_echo() {
        let engine = Engine::new(*b"0123456789abcdef");
        let header = PacketHeader {
            marker: marker::NORMAL_ECHO,
            timestamp: 42,
            time_echo: Some(7),
        };
        let chunks = b"some-chunk-bytes-here".to_vec();
        let datagram = encode_packet(0x0200_0001, &header, &chunks, &engine).unwrap();
        let decoded = decode_packet(&datagram, &engine).unwrap();
        assert_eq!(decoded.session_id, 0x0200_0001);
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.body, chunks);
    }

    #[test]
    fn flipped_crc_byte_is_rejected() {
        let engine = Engine::handshake();
        let header = PacketHeader {
            marker: marker::HANDSHAKE,
            timestamp: 1,
            time_echo: None,
        };
        let mut datagram = encode_packet(0, &header, b"chunk", &engine).unwrap();
        // Flip a bit inside the ciphertext so the decrypted CRC no longer matches.
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert!(matches!(
            decode_packet(&datagram, &engine),
            Err(ProtoError::BadCrc { .. })
        ));
    }

    #[test]
    fn datagram_exceeding_max_size_is_rejected() {
        let engine = Engine::handshake();
        let header = PacketHeader {
            marker: marker::HANDSHAKE,
            timestamp: 0,
            time_echo: None,
        };
        let huge = vec![0u8; MAX_PACKET_SIZE * 2];
        assert!(matches!(
            encode_packet(0, &header, &huge, &engine),
            Err(ProtoError::PacketTooLarge(_))
        ));
    }
}
