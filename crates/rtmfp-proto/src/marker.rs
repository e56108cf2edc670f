// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Packet marker bytes (§4.1).
//!
//! The marker is the first plaintext byte of every packet body and decides
//! two things: whether this is a handshake packet (session id always 0), and
//! whether a 16-bit `timeEcho` field follows the timestamp.

/// Handshake packets always carry this marker; their scrambled session id is
/// always zero.
pub const HANDSHAKE: u8 = 0x0B;

/// Base request marker, no time echo. Used by initiators.
pub const REQUEST: u8 = 0x09;
/// Base request marker, with time echo.
pub const REQUEST_ECHO: u8 = 0x89;
/// Concurrent-responder variant of [`REQUEST`] (responder adds +1).
pub const RESPONDER: u8 = 0x0A;
/// Concurrent-responder variant of [`REQUEST_ECHO`].
pub const RESPONDER_ECHO: u8 = 0x8A;

/// Normal-session echo marker (time echo present).
pub const NORMAL_ECHO: u8 = 0x4E;
/// Peer-to-peer echo marker, primary form.
pub const P2P_ECHO: u8 = 0xFE;
/// Peer-to-peer echo marker, alternate form.
pub const P2P_ECHO_ALT: u8 = 0xFD;

/// Whether `marker` is the dedicated handshake marker.
#[must_use]
pub const fn is_handshake(marker: u8) -> bool {
    marker == HANDSHAKE
}

/// Whether `marker` carries a trailing `timeEcho` field (§4.1).
#[must_use]
pub const fn has_time_echo(marker: u8) -> bool {
    matches!(
        marker,
        REQUEST_ECHO | RESPONDER_ECHO | NORMAL_ECHO | P2P_ECHO | P2P_ECHO_ALT
    )
}

/// Whether `marker` is one of the concurrent-responder variants (`+1` over
/// the base initiator marker).
#[must_use]
pub const fn is_responder_variant(marker: u8) -> bool {
    matches!(marker, RESPONDER | RESPONDER_ECHO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_variants_are_base_plus_one() {
        assert_eq!(RESPONDER, REQUEST + 1);
        assert_eq!(RESPONDER_ECHO, REQUEST_ECHO + 1);
    }

    #[test]
    fn echo_classification_matches_spec_list() {
        assert!(!has_time_echo(REQUEST));
        assert!(has_time_echo(REQUEST_ECHO));
        assert!(has_time_echo(NORMAL_ECHO));
        assert!(has_time_echo(P2P_ECHO));
        assert!(has_time_echo(P2P_ECHO_ALT));
        assert!(!has_time_echo(HANDSHAKE));
    }
}
