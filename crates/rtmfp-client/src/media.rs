// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Blocking `read()`/`write()` port over a FLV-framed elementary stream
//! (§6), bridging the async `Invoker` event loop into a synchronous API the
//! way `echo_session_client::tool::ChannelSession` bridges WARP frames over
//! `std::sync::mpsc`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

use rtmfp_proto::{AmfType, Message};

use crate::error::{ClientError, Result};
use crate::flv::{encode_tag, FLV_HEADER};

/// The consuming half of one media stream: FLV-framed bytes in, raw bytes
/// out via blocking [`MediaStream::read`] (§6 `read`).
pub struct MediaStream {
    rx: Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    header_sent: bool,
}

impl MediaStream {
    pub(crate) fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self { rx, pending: VecDeque::new(), header_sent: false }
    }

    /// Copy at most `buf.len()` bytes into `buf`, blocking until at least
    /// one byte is available, the session fails, or `poll_interval`
    /// elapses with nothing delivered (returns 0 on that last case, letting
    /// the caller decide whether to keep polling — §5 "readAsync blocks
    /// ... up to a small interval").
    pub fn read(&mut self, buf: &mut [u8], poll_interval: Duration) -> Result<usize> {
        if !self.header_sent {
            self.pending.extend(FLV_HEADER);
            self.header_sent = true;
        }
        if self.pending.is_empty() {
            match self.rx.recv_timeout(poll_interval) {
                Ok(tag) => self.pending.extend(tag),
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ClientError::LoopShutdown);
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        for slot in buf.iter_mut().take(n) {
            *slot = self.pending.pop_front().unwrap_or(0);
        }
        Ok(n)
    }
}

/// The producing half: frames delivered application messages as FLV tags
/// and forwards them to the paired [`MediaStream`].
#[derive(Clone)]
pub struct MediaSink {
    tx: Sender<Vec<u8>>,
    delivered: Arc<AtomicBool>,
}

impl MediaSink {
    /// Build a connected sink/stream pair.
    #[must_use]
    pub fn channel() -> (Self, MediaStream) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { tx, delivered: Arc::new(AtomicBool::new(false)) }, MediaStream::new(rx))
    }

    /// Whether this sink has delivered at least one frame yet, for
    /// `connect2Group`'s fallback-url monitor (§6 "if the group never
    /// produces data").
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.delivered.load(Ordering::Relaxed)
    }

    /// Frame and forward one delivered message. Silently drops messages
    /// with no FLV tag representation (invocations, raw control bytes)
    /// and messages whose consumer has gone away.
    pub fn push(&self, amf_type: AmfType, timestamp: u32, payload: &[u8]) {
        let mut tag = Vec::with_capacity(11 + payload.len() + 4);
        if encode_tag(amf_type, timestamp, payload, &mut tag) {
            self.delivered.store(true, Ordering::Relaxed);
            let _ = self.tx.send(tag);
        }
    }

    /// Decode a delivered writer message's tag/timestamp prefix (as framed
    /// by `Message::encode_prefix` on the sending side) and forward it.
    pub fn push_delivery(&self, body: &[u8]) {
        let Ok((amf_type, timestamp, consumed)) = Message::decode_prefix(body) else {
            return;
        };
        self.push(amf_type, timestamp.unwrap_or(0), &body[consumed..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_read_carries_the_flv_header() {
        let (sink, mut stream) = MediaSink::channel();
        sink.push(AmfType::Video, 0, b"x");
        let mut buf = [0u8; 13];
        let n = stream.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(n, 13);
        assert_eq!(buf, FLV_HEADER);
    }

    #[test]
    fn read_times_out_with_zero_when_nothing_arrives() {
        let (_sink, mut stream) = MediaSink::channel();
        stream.header_sent = true;
        let mut buf = [0u8; 4];
        let n = stream.read(&mut buf, Duration::from_millis(5)).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn push_delivery_decodes_the_wire_prefix() {
        let (sink, mut stream) = MediaSink::channel();
        let mut body = Vec::new();
        rtmfp_proto::Message::new(AmfType::Audio, Some(42), rtmfp_proto::Reliability::Reliable, &b"pcm"[..])
            .encode_prefix(&mut body);
        body.extend_from_slice(b"pcm");
        sink.push_delivery(&body);
        let mut buf = [0u8; 13];
        stream.read(&mut buf, Duration::from_millis(10)).unwrap();
        let mut tag = [0u8; 20];
        let n = stream.read(&mut tag, Duration::from_millis(10)).unwrap();
        assert_eq!(tag[0], 0x08);
        assert_eq!(&tag[11..11 + 3], b"pcm");
        assert_eq!(n, 11 + 3 + 4);
    }

    #[test]
    fn disconnected_sender_surfaces_as_loop_shutdown() {
        let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
        drop(tx);
        let mut stream = MediaStream::new(rx);
        stream.header_sent = true;
        let mut buf = [0u8; 4];
        let err = stream.read(&mut buf, Duration::from_millis(5)).unwrap_err();
        assert!(matches!(err, ClientError::LoopShutdown));
    }
}
