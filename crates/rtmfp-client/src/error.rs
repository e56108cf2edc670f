// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error taxonomy for the blocking user-facing API (§7).

use thiserror::Error;

/// Errors surfaced across the `init`/`connect`/`read`/`write` boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Failure inside the session engine (handshake, protocol, crypto,
    /// congestion, application, resource).
    #[error(transparent)]
    Session(#[from] rtmfp_core::SessionError),
    /// Config load/save failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// Socket bind or I/O failure standing up the `Invoker`.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The handle passed to an operation doesn't identify a live
    /// connection or media stream.
    #[error("unknown handle: {0}")]
    UnknownHandle(&'static str),
    /// `connect`/`read` blocked past its configured timeout with no
    /// progress.
    #[error("operation timed out: {0}")]
    Timeout(&'static str),
    /// The background event loop task is gone.
    #[error("client event loop has shut down")]
    LoopShutdown,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ClientError>;
