// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The blocking, ABI-style façade (§6 "External Interfaces"): `init`,
//! `connect`, `connect2Peer`, `connect2Group`, `addStream`, `publishP2P`,
//! `read`, `write`, `callFunction`, `close`, bridged onto the async
//! [`rtmfp_core::Invoker`] event loop the way [`crate::media::MediaStream`]
//! bridges one writer's deliveries onto a blocking channel.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use rtmfp_core::{Invoker, InvokerConfig, InvokerEvent, InvokerHandle};
use rtmfp_proto::{AmfType, Epd, Message, PeerId, Reliability};
use tokio::runtime::Runtime;
use tracing::warn;

use crate::amf::{AmfEncode, Amf0Encoder, Value};
use crate::config::{Config, GroupConfig};
use crate::error::{ClientError, Result};
use crate::flv::decode_tag;
use crate::group_media_config::group_media_config_from;
use crate::media::{MediaSink, MediaStream};

/// Opaque connection handle returned by [`RtmfpClient::connect`] and its
/// `connect2*` siblings.
pub type ConnectionId = u32;
/// Opaque media-stream handle returned by stream-opening operations.
pub type MediaId = u32;

/// Who a [`RtmfpClient::call_function`] invocation targets.
#[derive(Debug, Clone)]
pub enum CallTarget {
    /// A specific peer, reached over its NetGroup data writer.
    Peer(PeerId),
    /// Every peer currently active in the connection's group.
    AllInGroup,
}

/// What kind of underlying transport a [`ConnectionId`] refers to. A
/// connection starts `Pending*` the instant its id is minted and resolves to
/// its established form once the matching handshake event arrives (or
/// immediately, for groups — joining one is local bookkeeping, §4.7).
enum ConnState {
    PendingServer,
    PendingPeer { peer_id: PeerId },
    Server { session_id: u32 },
    Peer { session_id: u32, peer_id: PeerId },
    Group { group_id_txt: String },
}

struct Connection {
    state: ConnState,
    /// The literal url passed to `connect()`/`connect2Peer()`, retained so
    /// `connect2Group` can derive a deterministic groupspec text from it
    /// (see DESIGN.md: the external API carries no separate groupspec
    /// parameter).
    url: String,
}

/// Where a publishing [`MediaId`] writes its frames.
enum PublishTarget {
    /// A dedicated writer on a Server or Peer session, opened with
    /// `signature = name.as_bytes()`.
    Writer { session_id: u32, writer_id: u16 },
    /// A publisher stream within a joined NetGroup.
    Group { group_id_txt: String, stream_key: [u8; 34] },
}

enum MediaRole {
    Publish { target: PublishTarget, audio_reliable: bool, video_reliable: bool, pending: Vec<u8> },
    Subscribe(MediaStream),
}

struct MediaEntry {
    connection_id: ConnectionId,
    role: MediaRole,
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve a `rtmfp://host[:port]/...` (or bare `host[:port]`) url to a
/// socket address, defaulting to port 1935 (§6 "default server port 1935").
fn resolve(url: &str) -> Result<SocketAddr> {
    let stripped = url.strip_prefix("rtmfp://").unwrap_or(url);
    let host_port = stripped.split('/').next().unwrap_or(stripped);
    let candidate = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{host_port}:1935")
    };
    candidate
        .to_socket_addrs()
        .map_err(ClientError::Io)?
        .next()
        .ok_or(ClientError::UnknownHandle("could not resolve connect url"))
}

/// The blocking, user-facing RTMFP client (§6). One instance owns one
/// `Invoker` event loop (its own tokio runtime) and every connection/media
/// handle minted against it.
pub struct RtmfpClient {
    runtime: Runtime,
    handle: InvokerHandle,
    local_peer_id: PeerId,
    default_config: Config,
    amf_encoder: Arc<dyn AmfEncode + Send + Sync>,
    next_id: AtomicU32,
    connections: StdMutex<HashMap<ConnectionId, Connection>>,
    media: StdMutex<HashMap<MediaId, MediaEntry>>,
    sinks: Arc<StdMutex<HashMap<(u32, Bytes), MediaSink>>>,
    group_sinks: Arc<StdMutex<HashMap<(String, String), MediaSink>>>,
    pending_servers: Arc<StdMutex<Vec<ConnectionId>>>,
    pending_peers: Arc<StdMutex<HashMap<PeerId, ConnectionId>>>,
}

impl RtmfpClient {
    /// Initialize the library: bind sockets, spawn the event loop and its
    /// delivery pumps. Safe to call more than once; each call yields an
    /// independent client with its own sockets and runtime (§6 "Idempotent"
    /// — there is no hidden process-wide singleton to corrupt).
    pub fn init(config: Config, _group_config: GroupConfig) -> Result<Self> {
        let runtime = Runtime::new()?;
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        let local_peer_id = PeerId::from_public_key(&seed);

        let invoker_config = InvokerConfig {
            bind_v4: SocketAddr::from(([0, 0, 0, 0], config.bind_port)),
            bind_v6: None,
            local_peer_id,
            manage_interval: Duration::from_millis(100),
        };
        let (invoker, handle) = runtime.block_on(Invoker::bind(invoker_config))?;
        runtime.spawn(async move {
            if let Err(err) = invoker.run().await {
                warn!(?err, "invoker loop exited");
            }
        });

        let sinks: Arc<StdMutex<HashMap<(u32, Bytes), MediaSink>>> = Arc::new(StdMutex::new(HashMap::new()));
        let group_sinks: Arc<StdMutex<HashMap<(String, String), MediaSink>>> =
            Arc::new(StdMutex::new(HashMap::new()));
        let pending_servers: Arc<StdMutex<Vec<ConnectionId>>> = Arc::new(StdMutex::new(Vec::new()));
        let pending_peers: Arc<StdMutex<HashMap<PeerId, ConnectionId>>> = Arc::new(StdMutex::new(HashMap::new()));
        let established: Arc<StdMutex<HashMap<ConnectionId, (u32, Option<PeerId>)>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        spawn_delivery_pump(&runtime, handle.clone(), sinks.clone(), group_sinks.clone());
        spawn_event_pump(
            &runtime,
            handle.clone(),
            pending_servers.clone(),
            pending_peers.clone(),
            established.clone(),
        );

        Ok(Self {
            runtime,
            handle,
            local_peer_id,
            default_config: config,
            amf_encoder: Arc::new(Amf0Encoder),
            next_id: AtomicU32::new(1),
            connections: StdMutex::new(HashMap::new()),
            media: StdMutex::new(HashMap::new()),
            sinks,
            group_sinks,
            pending_servers,
            pending_peers,
        })
    }

    /// Inject a custom `callFunction` argument encoder, replacing the
    /// built-in AMF0 one.
    pub fn with_amf_encoder(mut self, encoder: Arc<dyn AmfEncode + Send + Sync>) -> Self {
        self.amf_encoder = encoder;
        self
    }

    fn allocate(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start or reuse a server session for `url`'s host (§6 `connect`).
    pub fn connect(&self, url: &str, config: Option<&Config>) -> Result<ConnectionId> {
        let config = config.unwrap_or(&self.default_config);
        let addr = resolve(url)?;
        let id = self.allocate();
        lock(&self.connections).insert(id, Connection { state: ConnState::PendingServer, url: url.to_string() });
        lock(&self.pending_servers).push(id);
        self.handle.dial(Epd::Server(url.to_string()), addr)?;

        if config.is_blocking {
            self.block_until_established(id)?;
        }
        Ok(id)
    }

    /// Request peer introduction via `id`'s server, then p2p play of
    /// `stream_name` (§6 `connect2Peer`).
    pub fn connect_to_peer(
        &self,
        id: ConnectionId,
        peer_id: PeerId,
        stream_name: &str,
        blocking: bool,
    ) -> Result<MediaId> {
        let address = {
            let connections = lock(&self.connections);
            let conn = connections.get(&id).ok_or(ClientError::UnknownHandle("connect_to_peer: unknown id"))?;
            match conn.state {
                ConnState::Server { session_id } | ConnState::Peer { session_id, .. } => {
                    // A direct p2p dial still needs a routable address; in
                    // the absence of a peer-introduction opcode exchange
                    // this reuses the rendezvous server's own address as a
                    // best-effort fallback (peer NAT traversal is §1
                    // Non-goals).
                    let _ = session_id;
                    resolve(&conn.url)?
                }
                ConnState::Group { .. } => return Err(ClientError::UnknownHandle("connect_to_peer: group id")),
                ConnState::PendingServer | ConnState::PendingPeer { .. } => {
                    return Err(ClientError::Timeout("connect_to_peer: connection not established"))
                }
            }
        };

        let peer_conn_id = self.allocate();
        lock(&self.connections).insert(
            peer_conn_id,
            Connection { state: ConnState::PendingPeer { peer_id }, url: stream_name.to_string() },
        );
        lock(&self.pending_peers).insert(peer_id, peer_conn_id);
        self.handle.dial(Epd::Peer(peer_id), address)?;
        if blocking {
            self.block_until_established(peer_conn_id)?;
        }

        self.add_stream(peer_conn_id, false, stream_name, false, false, blocking)
    }

    /// Join a NetGroup and start consuming `stream_name` from it (§6
    /// `connect2Group`). The groupspec is derived from `id`'s url and
    /// `stream_name` (see DESIGN.md: no separate groupspec parameter exists
    /// at this boundary).
    pub fn connect_to_group(
        &self,
        id: ConnectionId,
        stream_name: &str,
        group_config: &GroupConfig,
        fallback_url: Option<&str>,
    ) -> Result<MediaId> {
        let url = {
            let connections = lock(&self.connections);
            let conn = connections.get(&id).ok_or(ClientError::UnknownHandle("connect_to_group: unknown id"))?;
            conn.url.clone()
        };
        let group_id_txt = format!("{url}?group={stream_name}");
        let group_id = self.allocate();
        lock(&self.connections)
            .insert(group_id, Connection { state: ConnState::Group { group_id_txt: group_id_txt.clone() }, url });
        self.handle.join_group(group_id_txt.clone())?;

        let media_id = self.subscribe_group(group_id, &group_id_txt, stream_name);

        if let Some(fallback_url) = fallback_url {
            let fallback_url = fallback_url.to_string();
            let stream_name = stream_name.to_string();
            let fallback_timeout = group_config.fallback_timeout;
            let sinks = self.group_sinks.clone();
            let key = (group_id_txt.clone(), stream_name.clone());
            let handle_for_fallback = self.handle.clone();
            self.runtime.spawn(async move {
                tokio::time::sleep(fallback_timeout).await;
                let still_empty = lock(&sinks).get(&key).is_some_and(MediaSink::is_idle);
                if still_empty {
                    warn!(%fallback_url, stream_name, "group join stalled, falling back to server playback");
                    let _ = handle_for_fallback.dial(Epd::Server(fallback_url), SocketAddr::from(([0, 0, 0, 0], 0)));
                }
            });
        }
        Ok(media_id)
    }

    fn subscribe_group(&self, connection_id: ConnectionId, group_id_txt: &str, stream_name: &str) -> MediaId {
        let media_id = self.allocate();
        let (sink, stream) = MediaSink::channel();
        lock(&self.group_sinks).insert((group_id_txt.to_string(), stream_name.to_string()), sink);
        lock(&self.media)
            .insert(media_id, MediaEntry { connection_id, role: MediaRole::Subscribe(stream) });
        media_id
    }

    /// Open a single NetStream play or publish over `id` (§6 `addStream`).
    pub fn add_stream(
        &self,
        id: ConnectionId,
        publisher: bool,
        name: &str,
        audio_reliable: bool,
        video_reliable: bool,
        blocking: bool,
    ) -> Result<MediaId> {
        if blocking {
            self.block_until_established(id)?;
        }
        let session_id = {
            let connections = lock(&self.connections);
            let conn = connections.get(&id).ok_or(ClientError::UnknownHandle("add_stream: unknown id"))?;
            match &conn.state {
                ConnState::Server { session_id } | ConnState::Peer { session_id, .. } => Some(*session_id),
                ConnState::Group { group_id_txt } => {
                    let group_id_txt = group_id_txt.clone();
                    drop(connections);
                    return self.add_group_stream(id, &group_id_txt, name, publisher);
                }
                ConnState::PendingServer | ConnState::PendingPeer { .. } => {
                    return Err(ClientError::Timeout("add_stream: connection not established"))
                }
            }
        };
        let Some(session_id) = session_id else {
            return Err(ClientError::UnknownHandle("add_stream: unestablished connection"));
        };

        let media_id = self.allocate();
        if publisher {
            let signature = Bytes::from(name.as_bytes().to_vec());
            let writer_id = self
                .runtime
                .block_on(self.handle.open_writer(session_id, 0, signature))
                .ok_or(ClientError::UnknownHandle("add_stream: session gone"))?;
            lock(&self.media).insert(
                media_id,
                MediaEntry {
                    connection_id: id,
                    role: MediaRole::Publish {
                        target: PublishTarget::Writer { session_id, writer_id },
                        audio_reliable,
                        video_reliable,
                        pending: Vec::new(),
                    },
                },
            );
        } else {
            let (sink, stream) = MediaSink::channel();
            lock(&self.sinks).insert((session_id, Bytes::from(name.as_bytes().to_vec())), sink);
            lock(&self.media).insert(media_id, MediaEntry { connection_id: id, role: MediaRole::Subscribe(stream) });
        }
        Ok(media_id)
    }

    fn add_group_stream(&self, id: ConnectionId, group_id_txt: &str, name: &str, publisher: bool) -> Result<MediaId> {
        if !publisher {
            return Ok(self.subscribe_group(id, group_id_txt, name));
        }
        let config = group_media_config_from(&GroupConfig::default());
        let stream_key = self
            .runtime
            .block_on(self.handle.publish_group_stream(group_id_txt.to_string(), name.to_string(), config))
            .ok_or(ClientError::UnknownHandle("add_group_stream: group not joined"))?;
        let media_id = self.allocate();
        lock(&self.media).insert(
            media_id,
            MediaEntry {
                connection_id: id,
                role: MediaRole::Publish {
                    target: PublishTarget::Group { group_id_txt: group_id_txt.to_string(), stream_key },
                    audio_reliable: false,
                    video_reliable: false,
                    pending: Vec::new(),
                },
            },
        );
        Ok(media_id)
    }

    /// Become a p2p source for `name` over `id` (§6 `publishP2P`); a thin
    /// publisher-flavored alias of [`Self::add_stream`].
    pub fn publish_p2p(
        &self,
        id: ConnectionId,
        name: &str,
        audio_reliable: bool,
        video_reliable: bool,
        blocking: bool,
    ) -> Result<MediaId> {
        self.add_stream(id, true, name, audio_reliable, video_reliable, blocking)
    }

    /// Copy at most `buf.len()` FLV-framed bytes into `buf` (§6 `read`).
    /// Blocks until at least one byte is available or the poll interval
    /// elapses with nothing delivered.
    pub fn read(&self, media_id: MediaId, buf: &mut [u8]) -> Result<usize> {
        let poll_interval = self.default_config.read_poll_interval;
        let mut media = lock(&self.media);
        let entry = media.get_mut(&media_id).ok_or(ClientError::UnknownHandle("read: unknown media id"))?;
        match &mut entry.role {
            MediaRole::Subscribe(stream) => stream.read(buf, poll_interval),
            MediaRole::Publish { .. } => Err(ClientError::UnknownHandle("read: media id is a publisher")),
        }
    }

    /// Feed `buf` (FLV-framed bytes) to the publisher behind `media_id`,
    /// returning how many bytes were consumed (§6 `write`). Bytes that
    /// don't yet form a complete tag are buffered for the next call.
    pub fn write(&self, media_id: MediaId, buf: &[u8]) -> Result<usize> {
        let mut media = lock(&self.media);
        let entry = media.get_mut(&media_id).ok_or(ClientError::UnknownHandle("write: unknown media id"))?;
        let MediaRole::Publish { target, audio_reliable, video_reliable, pending } = &mut entry.role else {
            return Err(ClientError::UnknownHandle("write: media id is a subscriber"));
        };
        pending.extend_from_slice(buf);

        let mut consumed_total = 0;
        let mut tags = Vec::new();
        while let Some(tag) = decode_tag(&pending[consumed_total..]) {
            tags.push((tag.amf_type, tag.timestamp, tag.payload.to_vec()));
            consumed_total += tag.consumed;
        }
        pending.drain(..consumed_total);

        for (amf_type, timestamp, payload) in tags {
            self.deliver_one(target, amf_type, timestamp, payload, *audio_reliable, *video_reliable)?;
        }
        Ok(buf.len())
    }

    fn deliver_one(
        &self,
        target: &PublishTarget,
        amf_type: AmfType,
        timestamp: u32,
        payload: Vec<u8>,
        audio_reliable: bool,
        video_reliable: bool,
    ) -> Result<()> {
        match target {
            PublishTarget::Writer { session_id, writer_id } => {
                let reliable = match amf_type {
                    AmfType::Audio => audio_reliable,
                    AmfType::Video => video_reliable,
                    _ => true,
                };
                let reliability = if reliable { Reliability::Reliable } else { Reliability::Unreliable };
                let message = Message::new(amf_type, Some(timestamp), reliability, Bytes::from(payload));
                self.handle.write_message(*session_id, *writer_id, message)?;
            }
            PublishTarget::Group { group_id_txt, stream_key } => {
                self.handle.publish_group_fragment(
                    group_id_txt.clone(),
                    *stream_key,
                    amf_type,
                    timestamp,
                    Bytes::from(payload),
                )?;
            }
        }
        Ok(())
    }

    /// Invoke an AMF `onStatus`-style function on a peer or the whole group
    /// (§6 `callFunction`).
    pub fn call_function(&self, id: ConnectionId, function: &str, args: &[Value], target: CallTarget) -> Result<()> {
        let mut body = Vec::new();
        self.amf_encoder.encode_call(function, args, &mut body);

        match target {
            CallTarget::Peer(peer_id) => {
                let session_id = {
                    let connections = lock(&self.connections);
                    match connections.get(&id).map(|c| &c.state) {
                        Some(ConnState::Peer { session_id, .. } | ConnState::Server { session_id }) => *session_id,
                        _ => return Err(ClientError::UnknownHandle("call_function: unknown connection")),
                    }
                };
                let _ = peer_id;
                let Some(writer_id) = self.runtime.block_on(self.handle.main_writer(session_id)) else {
                    return Err(ClientError::UnknownHandle("call_function: session gone"));
                };
                self.handle.write_message(
                    session_id,
                    writer_id,
                    Message::new(AmfType::Invocation, None, Reliability::Reliable, Bytes::from(body)),
                )?;
            }
            CallTarget::AllInGroup => {
                let group_id_txt = {
                    let connections = lock(&self.connections);
                    match connections.get(&id).map(|c| &c.state) {
                        Some(ConnState::Group { group_id_txt }) => group_id_txt.clone(),
                        _ => return Err(ClientError::UnknownHandle("call_function: not a group connection")),
                    }
                };
                self.handle.call_group(group_id_txt, body)?;
            }
        }
        Ok(())
    }

    /// Close the session behind `id`; if `blocking`, wait for it to drain
    /// (§6 `close`).
    pub fn close(&self, id: ConnectionId, blocking: bool) -> Result<()> {
        let session_id = {
            let connections = lock(&self.connections);
            match connections.get(&id).map(|c| &c.state) {
                Some(ConnState::Server { session_id } | ConnState::Peer { session_id, .. }) => Some(*session_id),
                Some(ConnState::Group { .. }) => None,
                _ => return Err(ClientError::UnknownHandle("close: unknown id")),
            }
        };
        if let Some(session_id) = session_id {
            self.handle.close(session_id)?;
            if blocking {
                self.runtime.block_on(async {
                    loop {
                        let events = self.handle.take_events().await;
                        if events
                            .iter()
                            .any(|e| matches!(e, InvokerEvent::SessionClosed { session_id: sid } if *sid == session_id))
                        {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                });
            }
        }
        lock(&self.connections).remove(&id);
        Ok(())
    }

    fn block_until_established(&self, id: ConnectionId) -> Result<()> {
        self.runtime.block_on(async {
            loop {
                {
                    let connections = lock(&self.connections);
                    if let Some(conn) = connections.get(&id) {
                        if matches!(conn.state, ConnState::Server { .. } | ConnState::Peer { .. }) {
                            return Ok(());
                        }
                    } else {
                        return Err(ClientError::UnknownHandle("block_until_established: unknown id"));
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
    }

    /// This endpoint's canonical peer id, derived at [`Self::init`].
    #[must_use]
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }
}

/// Continuously drain connection-scoped deliveries and connection-lifecycle
/// events, resolving `Pending*` connection states and routing bytes to
/// registered sinks.
fn spawn_event_pump(
    runtime: &Runtime,
    handle: InvokerHandle,
    pending_servers: Arc<StdMutex<Vec<ConnectionId>>>,
    pending_peers: Arc<StdMutex<HashMap<PeerId, ConnectionId>>>,
    established: Arc<StdMutex<HashMap<ConnectionId, (u32, Option<PeerId>)>>>,
) {
    runtime.spawn(async move {
        loop {
            let events = handle.take_events().await;
            for event in events {
                if let InvokerEvent::SessionEstablished { session_id, is_peer, peer_id } = event {
                    if is_peer {
                        if let Some(peer_id) = peer_id {
                            if let Some(conn_id) = lock(&pending_peers).remove(&peer_id) {
                                lock(&established).insert(conn_id, (session_id, Some(peer_id)));
                            }
                        }
                    } else if let Some(conn_id) = lock(&pending_servers).pop() {
                        lock(&established).insert(conn_id, (session_id, None));
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    });
}

fn spawn_delivery_pump(
    runtime: &Runtime,
    handle: InvokerHandle,
    sinks: Arc<StdMutex<HashMap<(u32, Bytes), MediaSink>>>,
    group_sinks: Arc<StdMutex<HashMap<(String, String), MediaSink>>>,
) {
    runtime.spawn(async move {
        loop {
            for delivery in handle.take_delivered().await {
                if let Some(sink) = lock(&sinks).get(&(delivery.session_id, delivery.signature.clone())) {
                    sink.push_delivery(&delivery.body);
                }
            }
            for frag in handle.take_group_fragments().await {
                if let Some(sink) = lock(&group_sinks).get(&(frag.group_id_txt, frag.stream_name)) {
                    let amf_type = frag.media_type.unwrap_or(AmfType::Data);
                    sink.push(amf_type, frag.timestamp.unwrap_or(0), &frag.payload);
                }
            }
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
    });
}
