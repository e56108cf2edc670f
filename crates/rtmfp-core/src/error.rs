// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Session-level error taxonomy (§7).

use thiserror::Error;

/// Errors raised by the session engine.
///
/// Protocol/crypto errors are per-datagram and usually just drop the
/// offending packet (§7 "Protocol"); the other variants carry consequences
/// that propagate to session or writer state.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed chunk, unexpected marker, bad signature (§7 "Protocol").
    #[error(transparent)]
    Protocol(#[from] rtmfp_proto::ProtoError),
    /// DH agreement or shared-secret derivation failure — fatal for the
    /// session (§7 "Crypto").
    #[error(transparent)]
    Crypto(#[from] rtmfp_crypto::CryptoError),
    /// A writer's retransmission trigger exhausted its cycle cap (§7
    /// "Congestion", §4.5).
    #[error("writer {writer_id} can't deliver its data: congestion issue")]
    Congestion {
        /// The writer that failed.
        writer_id: u16,
    },
    /// Requested stream/peer not found, duplicate publication, etc (§7
    /// "Application").
    #[error("application error: {0}")]
    Application(&'static str),
    /// Buffer pool exhaustion or socket send failure (§7 "Resource").
    #[error("resource error: {0}")]
    Resource(&'static str),
    /// A handshake chunk arrived for a tag/cookie we have no pending state
    /// for, or arrived in an unexpected state.
    #[error("unexpected handshake state for {0}")]
    UnexpectedHandshakeState(&'static str),
    /// The session is not in a state that permits the requested operation.
    #[error("session is in state {0:?}, operation not permitted")]
    WrongState(crate::session::SessionStatus),
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, SessionError>;
