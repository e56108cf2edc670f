// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! RTMFP session engine: handshake arbitration, flow/writer ARQ, peer
//! introduction, NetGroup mesh overlay, and the tokio event loop that drives
//! them against live UDP sockets.
//!
//! Layering mirrors [`rtmfp_proto`]'s wire codecs: this crate holds the
//! stateful side (timers, retransmit queues, membership tables) and never
//! encodes/decodes bytes itself beyond what [`rtmfp_proto`] already frames.

mod congestion;
mod error;
mod flow;
mod group_media;
mod group_session;
mod handshaker;
mod invoker;
mod netgroup;
mod peer_session;
mod retry;
mod server_session;
mod session;
mod session_id;
mod writer;

pub use congestion::Congestion;
pub use error::{Result, SessionError};
pub use flow::{Flow, FLOW_REAP_DELAY};
pub use group_media::{GroupMedia, GroupMediaConfig, PushOutcome};
pub use group_session::{GroupMediaSession, GroupSession, PeerMedia};
pub use handshaker::{
    Handshaker, HandshakerEvent, PendingInitiator, PendingResponder, MAX_PENDING_RESPONDERS,
};
pub use invoker::{
    GroupFragmentDelivery, GroupWriterIds, Invoker, InvokerConfig, InvokerEvent, InvokerHandle,
};
pub use netgroup::{group_id_hex, NetGroup, NetGroupConfig};
pub use peer_session::PeerSession;
pub use retry::{Backoff, RetryTimer};
pub use server_session::ServerSession;
pub use session::{Delivery, Session, SessionStatus};
pub use session_id::{SessionIdAllocator, SessionKind, PEER_SESSION_BASE, SERVER_SESSION_BASE};
pub use writer::{OutgoingFragment, Writer, WriterState, MAIN_WRITER_ID};
