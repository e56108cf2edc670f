// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The tokio event loop that drives every session against live UDP sockets
//! (§5 "Concurrency & Resource Model"): dual IPv4/IPv6 sockets feeding a
//! single ingress queue, one event loop owning all session state, and a
//! timer tick driving `manage()` across the board.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rtmfp_crypto::{Engine, SessionKeys};
use rtmfp_proto::{
    decode_packet, encode_packet, group_opcode, group_signature, handshake_chunk_type, marker,
    read_chunk, write_chunk, AmfType, Address, AddressKind, Epd, FragmentsMap, GroupFragment,
    GroupReport, Member, MediaInfo, Message, PacketHeader, PeerId, PlayPull, PlayPush, Reliability,
    MAX_PACKET_SIZE,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace, warn};

use crate::error::{Result, SessionError};
use crate::group_media::GroupMedia;
use crate::group_session::GroupSession;
use crate::handshaker::{Handshaker, HandshakerEvent};
use crate::netgroup::NetGroupConfig;
use crate::peer_session::PeerSession;
use crate::server_session::ServerSession;
use crate::session::{Delivery, Session};

/// Pending-inbound-message queue depth past which a backpressure warning is
/// logged (no hard block, §5 "Backpressure").
const BACKPRESSURE_WARN_THRESHOLD: usize = 100;

/// Tunables for one [`Invoker`] (§5, §6).
#[derive(Debug, Clone)]
pub struct InvokerConfig {
    /// IPv4 bind address (§6, default port 1935).
    pub bind_v4: SocketAddr,
    /// Optional IPv6 bind address.
    pub bind_v6: Option<SocketAddr>,
    /// This endpoint's peer identity.
    pub local_peer_id: PeerId,
    /// How often `manage()` runs across handshaker and sessions.
    pub manage_interval: Duration,
}

impl InvokerConfig {
    /// Build a config bound to `0.0.0.0:1935`, IPv4-only, with a 100ms
    /// manage tick.
    #[must_use]
    pub fn new(local_peer_id: PeerId) -> Self {
        Self {
            bind_v4: SocketAddr::from(([0, 0, 0, 0], 1935)),
            bind_v6: None,
            local_peer_id,
            manage_interval: Duration::from_millis(100),
        }
    }
}

/// The two independently-keyed AES engines a connected session uses (§4.3):
/// `enc` encrypts what we send, `dec` decrypts what we receive. Initiator
/// and responder disagree on which derived key plays which role.
struct SessionEngines {
    enc: Engine,
    dec: Engine,
}

impl SessionEngines {
    /// Derive the pair for our role: initiators send under `requestKey` and
    /// receive under `responseKey`; responders do the reverse (§4.1 "first
    /// application chunk from initiator to responder decrypts with
    /// requestKey").
    fn from_keys(keys: &SessionKeys, responder: bool) -> Self {
        if responder {
            Self { enc: Engine::new(keys.response_key), dec: Engine::new(keys.request_key) }
        } else {
            Self { enc: Engine::new(keys.request_key), dec: Engine::new(keys.response_key) }
        }
    }
}

/// Handshake material retained past session establishment so a later
/// `GROUP_INIT` can be computed without redoing the DH exchange (§4.8.1,
/// §3 SUPPLEMENTED "GroupListener").
struct GroupSecret {
    shared_secret: Vec<u8>,
    near_nonce: Vec<u8>,
    far_nonce: Vec<u8>,
}

/// The four distinguished writer ids a peer session carries for NetGroup
/// traffic (§4.8 table), surfaced to callers that drive group membership
/// from outside the `Invoker`.
#[derive(Debug, Clone, Copy)]
pub struct GroupWriterIds {
    /// Carries `GROUP_REPORT`/`MEMBER`/`ASK_CLOSE`/`BEGIN`.
    pub report: u16,
    /// Carries `FRAGMENTS_MAP`/`PLAY_PUSH`/`PLAY_PULL`.
    pub media_report: u16,
    /// Carries fragment delivery.
    pub media: u16,
    /// Reserved data channel.
    pub data: u16,
}

/// Which of a peer session's four distinguished group writers to send on.
#[derive(Debug, Clone, Copy)]
enum GroupWriterKind {
    Report,
    MediaReport,
    Media,
    Data,
}

/// Whether `signature` is one of the four NetGroup writer signatures, used
/// to keep NetGroup protocol chatter out of the application-visible
/// delivery queue (§4.8 table).
fn is_group_signature(signature: &Bytes) -> bool {
    let sig = signature.as_ref();
    sig == group_signature::REPORT.as_slice()
        || sig == group_signature::MEDIA_REPORT.as_slice()
        || sig == group_signature::MEDIA.as_slice()
        || sig == group_signature::DATA.as_slice()
}

enum AnySession {
    Server(ServerSession),
    Peer(PeerSession),
}

impl AnySession {
    fn session(&self) -> &Session {
        match self {
            AnySession::Server(s) => s.session(),
            AnySession::Peer(p) => p.session(),
        }
    }

    fn session_mut(&mut self) -> &mut Session {
        match self {
            AnySession::Server(s) => s.session_mut(),
            AnySession::Peer(p) => p.session_mut(),
        }
    }

    fn handle_chunk(&mut self, ty: u8, body: &[u8], now: Instant) -> Result<Vec<Delivery>> {
        match self {
            AnySession::Server(s) => s.handle_chunk(ty, body, now),
            AnySession::Peer(p) => p.handle_chunk(ty, body, now),
        }
    }

    fn manage(&mut self, now: Instant) -> Result<()> {
        match self {
            AnySession::Server(s) => s.manage(now),
            AnySession::Peer(p) => p.manage(now),
        }
    }
}

/// A notable event surfaced to the owner of an [`InvokerHandle`] (connection
/// lifecycle, since delivered application bytes flow through the separate
/// delivered-media queue).
#[derive(Debug, Clone)]
pub enum InvokerEvent {
    /// A session finished its handshake and is now usable.
    SessionEstablished {
        /// Local routing id for this session.
        session_id: u32,
        /// Whether this is a peer (vs. server) session.
        is_peer: bool,
        /// The far side's canonical peer id, when the handshake carried a
        /// public key (always present for peer sessions; absent for plain
        /// server dials).
        peer_id: Option<PeerId>,
    },
    /// A session was reaped (closed, failed and absorbed, or errored).
    SessionClosed {
        /// Local routing id for the session that closed.
        session_id: u32,
    },
}

/// A fragment, reassembled and in order, ready for an application consumer
/// (§3 "GroupMedia" delivery, distinct from the connection-oriented
/// [`Delivery`] queue).
#[derive(Debug, Clone)]
pub struct GroupFragmentDelivery {
    /// Groupspec text the stream lives under.
    pub group_id_txt: String,
    /// The stream's 34-byte key.
    pub stream_key: [u8; 34],
    /// The stream's advertised name, so a caller who only knows the name it
    /// asked to subscribe to (not the publisher-chosen key) can match its
    /// deliveries.
    pub stream_name: String,
    /// Reassembled payload bytes.
    pub payload: Bytes,
    /// AMF media type, when known (absent for split continuation pieces
    /// that only carry it on their first piece; already resolved by the
    /// time a fragment reaches this queue).
    pub media_type: Option<AmfType>,
    /// Fragment timestamp, when known.
    pub timestamp: Option<u32>,
}

/// Command sent from an [`InvokerHandle`] into the running [`Invoker`] loop.
enum InvokerCommand {
    Dial { epd: Epd, address: Address },
    SendRaw { session_id: u32, chunk_type: u8, body: Vec<u8> },
    WriteMessage { session_id: u32, writer_id: u16, message: Message },
    OpenWriter { session_id: u32, flow_id: u64, signature: Bytes, reply: oneshot::Sender<Option<u16>> },
    GroupWriters { session_id: u32, reply: oneshot::Sender<Option<GroupWriterIds>> },
    MainWriter { session_id: u32, reply: oneshot::Sender<Option<u16>> },
    StartGroupHandshake { session_id: u32, group_id_txt: String, local_peer_id: PeerId },
    JoinGroup { group_id_txt: String },
    PublishGroupStream {
        group_id_txt: String,
        stream_name: String,
        config: crate::group_media::GroupMediaConfig,
        reply: oneshot::Sender<Option<[u8; 34]>>,
    },
    SubscribeGroupStream {
        group_id_txt: String,
        stream_key: [u8; 34],
        stream_name: String,
        config: crate::group_media::GroupMediaConfig,
    },
    PublishGroupFragment {
        group_id_txt: String,
        stream_key: [u8; 34],
        media_type: AmfType,
        timestamp: u32,
        payload: Bytes,
    },
    CallGroup { group_id_txt: String, body: Vec<u8> },
    Close { session_id: u32 },
    Shutdown,
}

/// Cheap, cloneable handle for driving a running [`Invoker`] from other
/// tasks (§5: "suspend points limited to ... explicit user wait_signal
/// points").
#[derive(Clone)]
pub struct InvokerHandle {
    commands: mpsc::UnboundedSender<InvokerCommand>,
    delivered: Arc<Mutex<VecDeque<Delivery>>>,
    events: Arc<Mutex<VecDeque<InvokerEvent>>>,
    group_fragments: Arc<Mutex<VecDeque<GroupFragmentDelivery>>>,
}

impl InvokerHandle {
    /// Start a handshake dial to `address` for the given endpoint discriminator.
    pub fn dial(&self, epd: Epd, address: Address) -> Result<()> {
        self.commands
            .send(InvokerCommand::Dial { epd, address })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Queue a raw chunk for an already-established session.
    pub fn send_raw(&self, session_id: u32, chunk_type: u8, body: Vec<u8>) -> Result<()> {
        self.commands
            .send(InvokerCommand::SendRaw { session_id, chunk_type, body })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Enqueue a message on one of a session's writers (§4.5 `write()`);
    /// flushed into flow-data chunks on the next loop iteration.
    pub fn write_message(&self, session_id: u32, writer_id: u16, message: Message) -> Result<()> {
        self.commands
            .send(InvokerCommand::WriteMessage { session_id, writer_id, message })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Open a new writer on an established session, answering `flow_id` (0
    /// if unpaired), and return its id (§4.5 "Writer").
    pub async fn open_writer(&self, session_id: u32, flow_id: u64, signature: Bytes) -> Option<u16> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(InvokerCommand::OpenWriter { session_id, flow_id, signature, reply: tx })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Fetch the four distinguished NetGroup writer ids for a peer session,
    /// `None` for a server session or unknown id (§4.8 table).
    pub async fn group_writers(&self, session_id: u32) -> Option<GroupWriterIds> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(InvokerCommand::GroupWriters { session_id, reply: tx })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Fetch the main `NetConnection` writer id for a server session,
    /// `None` for a peer session or unknown id (§9 "main writer").
    pub async fn main_writer(&self, session_id: u32) -> Option<u16> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(InvokerCommand::MainWriter { session_id, reply: tx })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Kick off the NetGroup key handshake on an established peer session
    /// (§4.8.1), queuing our `GROUP_INIT` on its report writer.
    pub fn start_group_handshake(&self, session_id: u32, group_id_txt: String, local_peer_id: PeerId) -> Result<()> {
        self.commands
            .send(InvokerCommand::StartGroupHandshake { session_id, group_id_txt, local_peer_id })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Join a NetGroup, creating its membership/gossip state if this is the
    /// first time we've heard of `group_id_txt` (§4.7).
    pub fn join_group(&self, group_id_txt: String) -> Result<()> {
        self.commands
            .send(InvokerCommand::JoinGroup { group_id_txt })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Start publishing a new stream into a joined group, returning its
    /// 34-byte stream key (§4.9.1), or `None` if the group hasn't been
    /// joined yet.
    pub async fn publish_group_stream(
        &self,
        group_id_txt: String,
        stream_name: String,
        config: crate::group_media::GroupMediaConfig,
    ) -> Option<[u8; 34]> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(InvokerCommand::PublishGroupStream { group_id_txt, stream_name, config, reply: tx })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Subscribe to a stream advertised by another member (§4.9.1).
    pub fn subscribe_group_stream(
        &self,
        group_id_txt: String,
        stream_key: [u8; 34],
        stream_name: String,
        config: crate::group_media::GroupMediaConfig,
    ) -> Result<()> {
        self.commands
            .send(InvokerCommand::SubscribeGroupStream { group_id_txt, stream_key, stream_name, config })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Publish one media payload into a stream we're publishing, splitting
    /// it across fragments as needed (§4.9.2) and pushing it to interested
    /// peers.
    pub fn publish_group_fragment(
        &self,
        group_id_txt: String,
        stream_key: [u8; 34],
        media_type: AmfType,
        timestamp: u32,
        payload: Bytes,
    ) -> Result<()> {
        self.commands
            .send(InvokerCommand::PublishGroupFragment {
                group_id_txt,
                stream_key,
                media_type,
                timestamp,
                payload,
            })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Drain reassembled group-media fragments accumulated since the last
    /// call.
    pub async fn take_group_fragments(&self) -> Vec<GroupFragmentDelivery> {
        self.group_fragments.lock().await.drain(..).collect()
    }

    /// Broadcast an application payload over the data writer of every peer
    /// session currently active in `group_id_txt` (§6 `callFunction` with
    /// peer id "all").
    pub fn call_group(&self, group_id_txt: String, body: Vec<u8>) -> Result<()> {
        self.commands
            .send(InvokerCommand::CallGroup { group_id_txt, body })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Request a graceful close of one session.
    pub fn close(&self, session_id: u32) -> Result<()> {
        self.commands
            .send(InvokerCommand::Close { session_id })
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Stop the event loop entirely.
    pub fn shutdown(&self) -> Result<()> {
        self.commands
            .send(InvokerCommand::Shutdown)
            .map_err(|_| SessionError::Resource("invoker loop has shut down"))
    }

    /// Drain application-layer deliveries accumulated since the last call
    /// (§5: delivered media lives behind a separate mutex from event-loop
    /// state).
    pub async fn take_delivered(&self) -> Vec<Delivery> {
        self.delivered.lock().await.drain(..).collect()
    }

    /// Drain connection-lifecycle events accumulated since the last call.
    pub async fn take_events(&self) -> Vec<InvokerEvent> {
        self.events.lock().await.drain(..).collect()
    }
}

/// Owns every session, the handshaker, and the UDP sockets; drives them
/// from a single task (§5).
pub struct Invoker {
    socket_v4: Arc<UdpSocket>,
    socket_v6: Option<Arc<UdpSocket>>,
    handshake_engine: Engine,
    handshaker: Handshaker,
    local_peer_id: PeerId,
    sessions: HashMap<u32, AnySession>,
    engines: HashMap<u32, SessionEngines>,
    group_secrets: HashMap<u32, GroupSecret>,
    /// Groups joined locally, keyed by groupspec text (§4.7, §4.9).
    groups: HashMap<String, GroupSession>,
    /// Index from a group peer's canonical id to its local session id, kept
    /// in sync with `GROUP_INIT` success and session reap.
    peer_sessions: HashMap<PeerId, u32>,
    commands: mpsc::UnboundedReceiver<InvokerCommand>,
    ingress: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    delivered: Arc<Mutex<VecDeque<Delivery>>>,
    events: Arc<Mutex<VecDeque<InvokerEvent>>>,
    group_fragments: Arc<Mutex<VecDeque<GroupFragmentDelivery>>>,
    manage_interval: Duration,
    rng: StdRng,
    started_at: Instant,
}

impl Invoker {
    /// Bind the configured sockets and spawn their ingress-forwarding
    /// tasks, returning the loop and a handle to drive it.
    pub async fn bind(config: InvokerConfig) -> std::io::Result<(Self, InvokerHandle)> {
        let socket_v4 = Arc::new(UdpSocket::bind(config.bind_v4).await?);
        let socket_v6 = match config.bind_v6 {
            Some(addr) => Some(Arc::new(UdpSocket::bind(addr).await?)),
            None => None,
        };

        let (ingress_tx, ingress_rx) = mpsc::channel(256);
        spawn_ingress_reader(socket_v4.clone(), ingress_tx.clone());
        if let Some(v6) = &socket_v6 {
            spawn_ingress_reader(v6.clone(), ingress_tx);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let delivered = Arc::new(Mutex::new(VecDeque::new()));
        let events = Arc::new(Mutex::new(VecDeque::new()));
        let group_fragments = Arc::new(Mutex::new(VecDeque::new()));

        let invoker = Self {
            socket_v4,
            socket_v6,
            handshake_engine: Engine::handshake(),
            handshaker: Handshaker::new(config.local_peer_id),
            local_peer_id: config.local_peer_id,
            sessions: HashMap::new(),
            engines: HashMap::new(),
            group_secrets: HashMap::new(),
            groups: HashMap::new(),
            peer_sessions: HashMap::new(),
            commands: command_rx,
            ingress: ingress_rx,
            delivered: delivered.clone(),
            events: events.clone(),
            group_fragments: group_fragments.clone(),
            manage_interval: config.manage_interval,
            rng: StdRng::from_entropy(),
            started_at: Instant::now(),
        };
        let handle = InvokerHandle {
            commands: command_tx,
            delivered,
            events,
            group_fragments,
        };
        Ok((invoker, handle))
    }

    /// Run the event loop until a [`InvokerCommand::Shutdown`] arrives or a
    /// socket is closed out from under us.
    pub async fn run(mut self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.manage_interval);
        loop {
            tokio::select! {
                biased;
                Some(cmd) = self.commands.recv() => {
                    if matches!(cmd, InvokerCommand::Shutdown) {
                        debug!("invoker shutting down");
                        return Ok(());
                    }
                    self.handle_command(cmd).await;
                }
                Some((datagram, from)) = self.ingress.recv() => {
                    if self.ingress.len() >= BACKPRESSURE_WARN_THRESHOLD {
                        warn!(depth = self.ingress.len(), "ingress queue backpressure");
                    }
                    self.handle_datagram(&datagram, from, Instant::now()).await;
                }
                _ = ticker.tick() => {
                    self.manage_all(Instant::now()).await;
                }
                else => return Ok(()),
            }
        }
    }

    async fn handle_command(&mut self, cmd: InvokerCommand) {
        match cmd {
            InvokerCommand::Dial { epd, address } => {
                let event = self.handshaker.dial(epd, address, &mut self.rng);
                self.dispatch_handshaker_event(event, address).await;
            }
            InvokerCommand::SendRaw { session_id, chunk_type, body } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    let queued = session.session_mut().drain_outbox();
                    let address = session.session().address();
                    let far_id = session.session().far_id();
                    let mut chunks = Vec::new();
                    for (ty, queued_body) in queued {
                        write_chunk(&mut chunks, ty, &queued_body);
                    }
                    write_chunk(&mut chunks, chunk_type, &body);
                    self.send_chunks(session_id, far_id, address.socket, chunks).await;
                }
            }
            InvokerCommand::WriteMessage { session_id, writer_id, message } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    if let Some(writer) = session.session_mut().writer_mut(writer_id) {
                        writer.write(message);
                    } else {
                        warn!(session_id, writer_id, "write_message: no such writer");
                        return;
                    }
                    session.session_mut().flush_writers();
                    let address = session.session().address();
                    let far_id = session.session().far_id();
                    let outbox = session.session_mut().drain_outbox();
                    if !outbox.is_empty() {
                        let mut chunks = Vec::new();
                        for (ty, body) in outbox {
                            write_chunk(&mut chunks, ty, &body);
                        }
                        self.send_chunks(session_id, far_id, address.socket, chunks).await;
                    }
                }
            }
            InvokerCommand::OpenWriter { session_id, flow_id, signature, reply } => {
                let id = self
                    .sessions
                    .get_mut(&session_id)
                    .map(|session| session.session_mut().open_writer(flow_id, signature));
                let _ = reply.send(id);
            }
            InvokerCommand::GroupWriters { session_id, reply } => {
                let ids = self.sessions.get(&session_id).and_then(|session| match session {
                    AnySession::Peer(peer) => Some(GroupWriterIds {
                        report: peer.report_writer(),
                        media_report: peer.media_report_writer(),
                        media: peer.media_writer(),
                        data: peer.data_writer(),
                    }),
                    AnySession::Server(_) => None,
                });
                let _ = reply.send(ids);
            }
            InvokerCommand::MainWriter { session_id, reply } => {
                let id = self.sessions.get(&session_id).and_then(|session| match session {
                    AnySession::Server(server) => Some(server.main_writer()),
                    AnySession::Peer(_) => None,
                });
                let _ = reply.send(id);
            }
            InvokerCommand::StartGroupHandshake { session_id, group_id_txt, local_peer_id } => {
                let Some(secret) = self.group_secrets.get(&session_id) else {
                    warn!(session_id, "start_group_handshake: no handshake secret retained");
                    return;
                };
                let (shared_secret, near_nonce, far_nonce) =
                    (secret.shared_secret.clone(), secret.near_nonce.clone(), secret.far_nonce.clone());
                if let Some(AnySession::Peer(peer)) = self.sessions.get_mut(&session_id) {
                    peer.start_group_handshake(&group_id_txt, &shared_secret, &near_nonce, &far_nonce, local_peer_id);
                    peer.session_mut().flush_writers();
                    let address = peer.session().address();
                    let far_id = peer.session().far_id();
                    let outbox = peer.session_mut().drain_outbox();
                    if !outbox.is_empty() {
                        let mut chunks = Vec::new();
                        for (ty, body) in outbox {
                            write_chunk(&mut chunks, ty, &body);
                        }
                        self.send_chunks(session_id, far_id, address.socket, chunks).await;
                    }
                } else {
                    warn!(session_id, "start_group_handshake: not a peer session");
                }
            }
            InvokerCommand::JoinGroup { group_id_txt } => {
                self.groups.entry(group_id_txt.clone()).or_insert_with(|| {
                    GroupSession::new(group_id_txt, &self.local_peer_id, NetGroupConfig::default())
                });
            }
            InvokerCommand::PublishGroupStream { group_id_txt, stream_name, config, reply } => {
                let key = rtmfp_proto::new_stream_key(self.rng.gen());
                let result = self.groups.get_mut(&group_id_txt).map(|group| {
                    let media = GroupMedia::new(stream_name, key, config);
                    group.subscribe(key, media, true);
                    key
                });
                let _ = reply.send(result);
            }
            InvokerCommand::SubscribeGroupStream { group_id_txt, stream_key, stream_name, config } => {
                if let Some(group) = self.groups.get_mut(&group_id_txt) {
                    let media = GroupMedia::new(stream_name, stream_key, config);
                    group.subscribe(stream_key, media, false);
                } else {
                    warn!(group_id_txt, "subscribe_group_stream: group not joined");
                }
            }
            InvokerCommand::PublishGroupFragment { group_id_txt, stream_key, media_type, timestamp, payload } => {
                self.publish_group_fragment(&group_id_txt, stream_key, media_type, timestamp, &payload)
                    .await;
            }
            InvokerCommand::CallGroup { group_id_txt, body } => {
                let peers: Vec<PeerId> = self
                    .sessions
                    .values()
                    .filter_map(|s| match s {
                        AnySession::Peer(p) if p.group_id_txt() == Some(group_id_txt.as_str()) => {
                            p.remote_peer_id()
                        }
                        _ => None,
                    })
                    .collect();
                for peer in peers {
                    self.send_group_opcode_to_peer(peer, GroupWriterKind::Data, body.clone(), Reliability::Reliable)
                        .await;
                }
            }
            InvokerCommand::Close { session_id } => {
                if let Some(session) = self.sessions.get_mut(&session_id) {
                    session.session_mut().close(Instant::now());
                }
            }
            InvokerCommand::Shutdown => {}
        }
    }

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        if datagram.len() < 4 {
            return;
        }
        let scrambled_probe = u32::from_le_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        if scrambled_probe == 0 {
            self.handle_handshake_datagram(datagram, from, now).await;
            return;
        }
        // The scrambled id alone doesn't identify the session without first
        // decrypting (the XOR mask is computed over the decrypted header),
        // so route by trying each known session's engine; the CRC inside
        // `decode_packet` rejects all but the true match.
        let Some((session_id, decoded)) = self.engines.iter().find_map(|(id, engines)| {
            decode_packet(datagram, &engines.dec).ok().map(|d| (*id, d))
        }) else {
            trace!(from = %from, "datagram matched no known session, dropping");
            return;
        };
        let mut all_deliveries = Vec::new();
        let is_peer;
        {
            let Some(session) = self.sessions.get_mut(&session_id) else {
                return;
            };
            session.session_mut().set_address(Address::new(from, AddressKind::Public));
            session.session_mut().note_received(now);
            if let Some(echo) = decoded.header.time_echo {
                session.session_mut().note_timestamp_echo(decoded.header.timestamp, echo);
            }
            is_peer = matches!(session, AnySession::Peer(_));
            let mut pos = 0usize;
            while pos < decoded.body.len() {
                let Ok((ty, chunk_body, consumed)) = read_chunk(&decoded.body[pos..]) else {
                    break;
                };
                pos += consumed;
                match session.handle_chunk(ty, chunk_body, now) {
                    Ok(deliveries) => all_deliveries.extend(deliveries),
                    Err(err) => warn!(?err, session_id, "chunk handling failed"),
                }
            }
            if let AnySession::Peer(peer) = session {
                for delivery in &all_deliveries {
                    if delivery.signature.as_ref() == group_signature::REPORT.as_slice()
                        && delivery.body.first() == Some(&group_opcode::GROUP_INIT)
                    {
                        if let Err(err) = peer.handle_group_init(&delivery.body[1..]) {
                            warn!(?err, session_id, "group_init handling failed");
                        }
                    }
                }
            }
        }
        if is_peer {
            self.process_group_deliveries(session_id, &all_deliveries, now).await;
        }
        if !all_deliveries.is_empty() {
            let user_visible: Vec<Delivery> = all_deliveries
                .into_iter()
                .filter(|d| !is_group_signature(&d.signature))
                .collect();
            if !user_visible.is_empty() {
                self.delivered.lock().await.extend(user_visible);
            }
        }
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.session_mut().flush_writers();
            let far_id = session.session().far_id();
            let outbox: Vec<_> = session.session_mut().drain_outbox();
            if !outbox.is_empty() {
                let mut chunks = Vec::new();
                for (ty, body) in outbox {
                    write_chunk(&mut chunks, ty, &body);
                }
                self.send_chunks(session_id, far_id, from, chunks).await;
            }
        }
    }

    /// Route a peer session's group-signed deliveries into its NetGroup's
    /// membership and active `GroupMedia` streams (§4.7, §4.9). Several
    /// `GroupMedia` streams can coexist under one NetGroup (§3); gossip and
    /// fragments are routed to the right one by the peer's `idFlow`/
    /// `idFlowMedia` (§3 "PeerMedia") rather than picked arbitrarily. This
    /// crate still shares one report/media-report/media writer per peer
    /// session rather than one per stream (§4.8 table), so two streams
    /// reported by the same peer over the same writer are disambiguated by
    /// the wrapped flow id carried on each `Delivery`.
    async fn process_group_deliveries(&mut self, session_id: u32, deliveries: &[Delivery], now: Instant) {
        let (group_id_txt, remote_peer_id) = {
            let Some(AnySession::Peer(peer)) = self.sessions.get(&session_id) else {
                return;
            };
            let Some(group_id_txt) = peer.group_id_txt().map(str::to_string) else {
                return;
            };
            let Some(remote_peer_id) = peer.remote_peer_id() else {
                return;
            };
            (group_id_txt, remote_peer_id)
        };

        self.peer_sessions.entry(remote_peer_id).or_insert(session_id);
        let local_peer_id = self.local_peer_id;
        self.groups
            .entry(group_id_txt.clone())
            .or_insert_with(|| GroupSession::new(group_id_txt.clone(), &local_peer_id, NetGroupConfig::default()));

        for delivery in deliveries {
            let sig = delivery.signature.as_ref();
            let Some(&opcode) = delivery.body.first() else {
                continue;
            };
            let body = &delivery.body[1..];
            if sig == group_signature::REPORT.as_slice() {
                self.handle_group_report_opcode(&group_id_txt, remote_peer_id, opcode, body, now);
            } else if sig == group_signature::MEDIA_REPORT.as_slice() {
                self.handle_media_report_opcode(&group_id_txt, remote_peer_id, delivery.flow_id, opcode, body, now)
                    .await;
            } else if sig == group_signature::MEDIA.as_slice() {
                self.handle_media_opcode(&group_id_txt, remote_peer_id, delivery.flow_id, delivery.body.clone(), now)
                    .await;
            }
        }
    }

    fn handle_group_report_opcode(
        &mut self,
        group_id_txt: &str,
        remote_peer_id: PeerId,
        opcode: u8,
        body: &[u8],
        now: Instant,
    ) {
        let Some(group) = self.groups.get_mut(group_id_txt) else {
            return;
        };
        match opcode {
            group_opcode::GROUP_REPORT => {
                if let Ok(report) = GroupReport::decode(body) {
                    for reported in &report.peers {
                        group.group.note_heard(
                            reported.peer_id,
                            reported.addresses.clone(),
                            reported.host_address,
                            now,
                        );
                    }
                }
            }
            group_opcode::MEMBER => {
                if let Ok(member) = Member::decode(body) {
                    group.group.note_heard(member.peer_id, Vec::new(), None, now);
                }
            }
            group_opcode::BEGIN | group_opcode::BEGIN_NEAREST => {
                group.group.note_heard(remote_peer_id, Vec::new(), None, now);
                group.group.note_connected(remote_peer_id, Duration::from_millis(50));
            }
            group_opcode::ASK_CLOSE => {
                debug!(peer = ?remote_peer_id, group_id_txt, "peer asked to disconnect from group");
            }
            _ => {}
        }
    }

    async fn handle_media_report_opcode(
        &mut self,
        group_id_txt: &str,
        remote_peer_id: PeerId,
        flow_id: u64,
        opcode: u8,
        body: &[u8],
        now: Instant,
    ) {
        match opcode {
            group_opcode::MEDIA_INFO => {
                let Ok(info) = MediaInfo::decode(body) else { return };
                let Some(group) = self.groups.get_mut(group_id_txt) else {
                    return;
                };
                let gms = group.medias.entry(info.stream_key).or_insert_with(|| {
                    let config = crate::group_media::GroupMediaConfig {
                        window_duration: Duration::from_millis(u64::from(info.config.window_duration_ms.max(1))),
                        availability_update_period: Duration::from_millis(u64::from(
                            info.config.availability_update_period_ms.max(1),
                        )),
                        fetch_period: Duration::from_millis(u64::from(info.config.fetch_period_ms.max(1))),
                        ..crate::group_media::GroupMediaConfig::default()
                    };
                    crate::group_session::GroupMediaSession::new(
                        GroupMedia::new(info.stream_name, info.stream_key, config),
                        false,
                    )
                });
                gms.peers.entry(remote_peer_id).or_default().id_flow = Some(flow_id);
            }
            group_opcode::FRAGMENTS_MAP => {
                let Ok(map) = FragmentsMap::decode(body) else { return };
                if let Some(gms) = self
                    .groups
                    .get_mut(group_id_txt)
                    .and_then(|group| group.media_by_report_flow(&remote_peer_id, flow_id))
                {
                    gms.record_fragments_map(remote_peer_id, map, now);
                }
            }
            group_opcode::PLAY_PUSH => {
                let Ok(push) = PlayPush::decode(body) else { return };
                if let Some(gms) = self
                    .groups
                    .get_mut(group_id_txt)
                    .and_then(|group| group.media_by_report_flow(&remote_peer_id, flow_id))
                {
                    gms.record_play_push(remote_peer_id, push.mode);
                }
            }
            group_opcode::PLAY_PULL => {
                let Ok(pull) = PlayPull::decode(body) else { return };
                let served = self
                    .groups
                    .get_mut(group_id_txt)
                    .and_then(|group| group.media_by_report_flow(&remote_peer_id, flow_id))
                    .and_then(|gms| gms.media.get_served(pull.id).cloned());
                if let Some(fragment) = served {
                    self.send_group_opcode_to_peer(
                        remote_peer_id,
                        GroupWriterKind::Media,
                        fragment.encode(),
                        Reliability::Unreliable,
                    )
                    .await;
                } else if let Some(gms) = self
                    .groups
                    .get_mut(group_id_txt)
                    .and_then(|group| group.media_by_report_flow(&remote_peer_id, flow_id))
                {
                    gms.blacklist_pull(remote_peer_id, pull.id);
                }
            }
            _ => {}
        }
    }

    async fn handle_media_opcode(
        &mut self,
        group_id_txt: &str,
        remote_peer_id: PeerId,
        flow_id: u64,
        raw: Bytes,
        now: Instant,
    ) {
        let Ok(fragment) = GroupFragment::decode(&raw) else {
            return;
        };
        let Some(gms) = self
            .groups
            .get_mut(group_id_txt)
            .and_then(|group| group.media_by_media_flow(&remote_peer_id, flow_id))
        else {
            return;
        };
        let outcome = gms.media.ingest(fragment, now);
        trace!(?outcome, flow_id, peer = ?remote_peer_id, "group fragment ingested");
        let ready = gms.media.take_ready();
        if ready.is_empty() {
            return;
        }
        let stream_key = *gms.media.stream_key();
        let stream_name = gms.media.stream_name().to_string();
        let mut queue = self.group_fragments.lock().await;
        for frag in ready {
            queue.push_back(GroupFragmentDelivery {
                group_id_txt: group_id_txt.to_string(),
                stream_key,
                stream_name: stream_name.clone(),
                payload: frag.bytes,
                media_type: frag.media_type,
                timestamp: frag.timestamp,
            });
        }
    }

    async fn publish_group_fragment(
        &mut self,
        group_id_txt: &str,
        stream_key: [u8; 34],
        media_type: AmfType,
        timestamp: u32,
        payload: &Bytes,
    ) {
        let Some(group) = self.groups.get_mut(group_id_txt) else {
            warn!(group_id_txt, "publish_group_fragment: group not joined");
            return;
        };
        let Some(gms) = group.medias.get_mut(&stream_key) else {
            warn!(group_id_txt, "publish_group_fragment: stream not published");
            return;
        };
        let fragments = gms.media.publish(media_type, timestamp, payload);
        let mut targets: Vec<(PeerId, Vec<u8>)> = Vec::new();
        for fragment in &fragments {
            let bit = 1u8 << (fragment.id % 8);
            let encoded = fragment.encode();
            let interested: Vec<PeerId> = gms
                .peers
                .iter()
                .filter(|(_, pm)| pm.push_in_mode & bit != 0)
                .map(|(peer, _)| *peer)
                .collect();
            if interested.is_empty() {
                targets.extend(gms.peers.keys().map(|peer| (*peer, encoded.clone())));
            } else {
                targets.extend(interested.into_iter().map(|peer| (peer, encoded.clone())));
            }
        }
        for (peer, body) in targets {
            self.send_group_opcode_to_peer(peer, GroupWriterKind::Media, body, Reliability::Unreliable)
                .await;
        }
    }

    async fn send_group_opcode_to_peer(
        &mut self,
        peer: PeerId,
        kind: GroupWriterKind,
        body: Vec<u8>,
        reliability: Reliability,
    ) {
        let Some(&session_id) = self.peer_sessions.get(&peer) else {
            return;
        };
        let Some(AnySession::Peer(p)) = self.sessions.get_mut(&session_id) else {
            return;
        };
        let writer_id = match kind {
            GroupWriterKind::Report => p.report_writer(),
            GroupWriterKind::MediaReport => p.media_report_writer(),
            GroupWriterKind::Media => p.media_writer(),
            GroupWriterKind::Data => p.data_writer(),
        };
        if let Some(writer) = p.session_mut().writer_mut(writer_id) {
            writer.write(Message::new(AmfType::Raw, None, reliability, Bytes::from(body)));
        } else {
            return;
        }
        p.session_mut().flush_writers();
        let address = p.session().address();
        let far_id = p.session().far_id();
        let outbox = p.session_mut().drain_outbox();
        if !outbox.is_empty() {
            let mut chunks = Vec::new();
            for (ty, b) in outbox {
                write_chunk(&mut chunks, ty, &b);
            }
            self.send_chunks(session_id, far_id, address.socket, chunks).await;
        }
    }

    async fn handle_handshake_datagram(&mut self, datagram: &[u8], from: SocketAddr, now: Instant) {
        let decoded = match decode_packet(datagram, &self.handshake_engine) {
            Ok(d) => d,
            Err(err) => {
                trace!(?err, "handshake packet decode failed");
                return;
            }
        };
        let address = Address::new(from, AddressKind::Public);
        let mut pos = 0usize;
        while pos < decoded.body.len() {
            let Ok((ty, body, consumed)) = read_chunk(&decoded.body[pos..]) else {
                break;
            };
            pos += consumed;
            self.dispatch_handshake_chunk(ty, body, address, now).await;
        }
    }

    async fn dispatch_handshake_chunk(&mut self, ty: u8, body: &[u8], address: Address, now: Instant) {
        match ty {
            handshake_chunk_type::HS30 => {
                match self.handshaker.handle_hs30(body, address, now, &mut self.rng, None) {
                    Ok(Some(event)) => self.dispatch_handshaker_event(event, address).await,
                    Ok(None) => {}
                    Err(err) => warn!(?err, "hs30 handling failed"),
                }
            }
            handshake_chunk_type::HS70 => {
                match self.handshaker.handle_hs70(body, address, &mut self.rng, false) {
                    Ok(event) => self.dispatch_handshaker_event(event, address).await,
                    Err(err) => warn!(?err, "hs70 handling failed"),
                }
            }
            handshake_chunk_type::HS38 => match self.handshaker.handle_hs38(body, address) {
                Ok(events) => {
                    for event in events {
                        self.dispatch_handshaker_event(event, address).await;
                    }
                }
                Err(err) => warn!(?err, "hs38 handling failed"),
            },
            handshake_chunk_type::HS78 => match self.handshaker.handle_hs78(body, address) {
                Ok(event) => self.dispatch_handshaker_event(event, address).await,
                Err(err) => warn!(?err, "hs78 handling failed"),
            },
            handshake_chunk_type::HS71 => match self.handshaker.handle_hs71(body) {
                Ok(event) => self.dispatch_handshaker_event(event, address).await,
                Err(err) => warn!(?err, "hs71 handling failed"),
            },
            other => trace!(chunk_type = other, "unhandled handshake chunk"),
        }
    }

    async fn dispatch_handshaker_event(&mut self, event: HandshakerEvent, address: Address) {
        match event {
            HandshakerEvent::Send { address, chunk_type, body } => {
                let mut chunks = Vec::new();
                write_chunk(&mut chunks, chunk_type, &body);
                self.send_handshake_chunks(address, chunks).await;
            }
            HandshakerEvent::SessionEstablished {
                local_session_id,
                far_session_id,
                address,
                keys,
                responder,
                peer_id,
                shared_secret,
                near_nonce,
                far_nonce,
            } => {
                let session = Session::new(local_session_id, far_session_id, address, responder);
                let is_peer = peer_id.is_some() || local_session_id >= crate::session_id::PEER_SESSION_BASE;
                let any = if is_peer {
                    AnySession::Peer(PeerSession::new(session))
                } else {
                    AnySession::Server(ServerSession::new(session))
                };
                self.sessions.insert(local_session_id, any);
                self.engines.insert(local_session_id, SessionEngines::from_keys(&keys, responder));
                self.group_secrets.insert(
                    local_session_id,
                    GroupSecret { shared_secret, near_nonce, far_nonce },
                );
                self.events.lock().await.push_back(InvokerEvent::SessionEstablished {
                    session_id: local_session_id,
                    is_peer,
                    peer_id,
                });
            }
            HandshakerEvent::Redirected { tag, addresses } => {
                debug!(?addresses, %address, "handshake redirected");
                for event in self.handshaker.redirect(tag, &addresses) {
                    Box::pin(self.dispatch_handshaker_event(event, address)).await;
                }
            }
        }
    }

    /// Current send timestamp in 4ms clock ticks, relative to when this
    /// `Invoker` started (§4.10 "Timestamp echo").
    fn current_tick(&self) -> u16 {
        let ms = self.started_at.elapsed().as_millis();
        #[allow(clippy::cast_possible_truncation)]
        let ticks = (ms / 4) as u16;
        ticks
    }

    async fn send_handshake_chunks(&self, address: Address, chunks: Vec<u8>) {
        let header = PacketHeader { marker: marker::HANDSHAKE, timestamp: self.current_tick(), time_echo: None };
        if let Ok(datagram) = encode_packet(0, &header, &chunks, &self.handshake_engine) {
            self.send_datagram(&datagram, address.socket).await;
        }
    }

    async fn send_chunks(&self, session_id: u32, far_id: u32, to: SocketAddr, chunks: Vec<u8>) {
        let Some(engines) = self.engines.get(&session_id) else {
            return;
        };
        let header = PacketHeader { marker: marker::REQUEST, timestamp: self.current_tick(), time_echo: None };
        if let Ok(datagram) = encode_packet(far_id, &header, &chunks, &engines.enc) {
            self.send_datagram(&datagram, to).await;
        }
    }

    async fn send_datagram(&self, datagram: &[u8], to: SocketAddr) {
        if datagram.len() > MAX_PACKET_SIZE {
            warn!(len = datagram.len(), "outgoing datagram exceeds MAX_PACKET_SIZE");
            return;
        }
        let socket = if to.is_ipv6() {
            self.socket_v6.as_ref().unwrap_or(&self.socket_v4)
        } else {
            &self.socket_v4
        };
        if let Err(err) = socket.send_to(datagram, to).await {
            warn!(?err, %to, "send failed");
        }
    }

    async fn manage_all(&mut self, now: Instant) {
        for event in self.handshaker.manage(now) {
            // address is informational only for logging on this path
            let unroutable = Address::new(SocketAddr::from(([0, 0, 0, 0], 0)), AddressKind::Public);
            self.dispatch_handshaker_event(event, unroutable).await;
        }
        let mut closed = Vec::new();
        for (id, session) in &mut self.sessions {
            if let Err(err) = session.manage(now) {
                warn!(?err, session_id = id, "session manage failed, closing");
                closed.push(*id);
                continue;
            }
            if session.session().is_reapable(now) {
                closed.push(*id);
            }
        }
        for id in closed {
            if let Some(AnySession::Peer(peer)) = self.sessions.get(&id) {
                if let (Some(group_id_txt), Some(remote_peer_id)) =
                    (peer.group_id_txt().map(str::to_string), peer.remote_peer_id())
                {
                    self.peer_sessions.remove(&remote_peer_id);
                    if let Some(group) = self.groups.get_mut(&group_id_txt) {
                        group.forget_peer(&remote_peer_id);
                    }
                }
            }
            self.sessions.remove(&id);
            self.engines.remove(&id);
            self.group_secrets.remove(&id);
            self.events
                .lock()
                .await
                .push_back(InvokerEvent::SessionClosed { session_id: id });
        }

        self.manage_groups(now).await;
    }

    /// Drive every joined group's best-list maintenance, connect/disconnect
    /// reconciliation, and per-stream gossip (§4.7, §4.9.3-§4.9.5).
    async fn manage_groups(&mut self, now: Instant) {
        let mut dials: Vec<(PeerId, Address)> = Vec::new();
        let mut disconnects: Vec<PeerId> = Vec::new();
        for group in self.groups.values_mut() {
            group.group.expire(now);
            if group.group.due_for_rebuild(now) {
                group.group.rebuild_best_list(now, &mut self.rng);
            }
            let (to_connect, to_disconnect) = group.group.reconcile(now);
            for peer in to_connect {
                if let Some(addr) = group.group.heard_address(&peer) {
                    dials.push((peer, addr));
                }
            }
            disconnects.extend(to_disconnect);
        }
        for (peer, addr) in dials {
            let event = self.handshaker.dial(Epd::Peer(peer), addr, &mut self.rng);
            self.dispatch_handshaker_event(event, addr).await;
        }
        for peer in disconnects {
            self.send_group_opcode_to_peer(
                peer,
                GroupWriterKind::Report,
                vec![group_opcode::ASK_CLOSE],
                Reliability::Reliable,
            )
            .await;
        }

        let mut map_sends: Vec<(PeerId, Vec<u8>)> = Vec::new();
        let mut pull_sends: Vec<(PeerId, Vec<u8>)> = Vec::new();
        let mut fast_forwarded: Vec<GroupFragmentDelivery> = Vec::new();
        for group in self.groups.values_mut() {
            let group_id_txt = group.group.id_txt().to_string();
            for gms in group.medias.values_mut() {
                gms.media.evict_expired(now);
                let ready = gms.media.take_ready();
                if !ready.is_empty() {
                    let stream_key = *gms.media.stream_key();
                    let stream_name = gms.media.stream_name().to_string();
                    for frag in ready {
                        fast_forwarded.push(GroupFragmentDelivery {
                            group_id_txt: group_id_txt.clone(),
                            stream_key,
                            stream_name: stream_name.clone(),
                            payload: frag.bytes,
                            media_type: frag.media_type,
                            timestamp: frag.timestamp,
                        });
                    }
                }
                if gms.media.map_due(now) {
                    let map = gms.media.build_fragments_map(now, 64);
                    let mut body = vec![group_opcode::FRAGMENTS_MAP];
                    body.extend(map.encode());
                    for peer in gms.peers.keys() {
                        map_sends.push((*peer, body.clone()));
                    }
                }
                if !gms.is_publisher {
                    let fetch_period = gms.media.fetch_period();
                    for (id, peer) in gms.pull_targets(now, fetch_period) {
                        gms.media.note_pull_sent(id, peer, now);
                        let mut body = vec![group_opcode::PLAY_PULL];
                        body.extend(PlayPull { id }.encode());
                        pull_sends.push((peer, body));
                    }
                }
            }
        }
        if !fast_forwarded.is_empty() {
            let mut queue = self.group_fragments.lock().await;
            queue.extend(fast_forwarded);
        }
        for (peer, body) in map_sends {
            self.send_group_opcode_to_peer(peer, GroupWriterKind::MediaReport, body, Reliability::Reliable)
                .await;
        }
        for (peer, body) in pull_sends {
            self.send_group_opcode_to_peer(peer, GroupWriterKind::MediaReport, body, Reliability::Reliable)
                .await;
        }
    }
}

fn current_tick() -> u16 {
    #[allow(clippy::cast_possible_truncation)]
    let ms = Instant::now().elapsed().as_millis() as u64;
    (ms / 4) as u16
}

fn spawn_ingress_reader(socket: Arc<UdpSocket>, tx: mpsc::Sender<(Vec<u8>, SocketAddr)>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, from)) => {
                    if tx.send((buf[..n].to_vec(), from)).await.is_err() {
                        return;
                    }
                }
                Err(err) => {
                    warn!(?err, "udp recv error, stopping ingress reader");
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoker_config_defaults_to_standard_port() {
        let config = InvokerConfig::new(PeerId::from_public_key(b"me"));
        assert_eq!(config.bind_v4.port(), 1935);
        assert!(config.bind_v6.is_none());
    }

    #[tokio::test]
    async fn bind_and_immediate_shutdown() {
        let config = InvokerConfig {
            bind_v4: SocketAddr::from(([127, 0, 0, 1], 0)),
            bind_v6: None,
            local_peer_id: PeerId::from_public_key(b"me"),
            manage_interval: Duration::from_millis(50),
        };
        let (invoker, handle) = Invoker::bind(config).await.unwrap();
        let task = tokio::spawn(invoker.run());
        handle.shutdown().unwrap();
        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
