//! Reliable side-channel ("trust queue") piggy-backed on CTRL/DATA.
//!
//! Each direction keeps a FIFO of framed messages. Only the head is in
//! flight: it rides on an outgoing packet whenever the retransmit
//! countdown is zero and is popped once the peer echoes our send
//! counter back. The receiver accepts a body only when its advertised
//! counter is exactly one past the last one it accepted, which makes
//! delivery exactly-once and in order over a lossy, reordering link.
//!
//! ## Frame format
//!
//! ```text
//! identifier: [u8; 4]
//! length:     u8
//! payload:    [u8] (length bytes)
//! ```

use std::collections::VecDeque;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CortexError;
use crate::seq::Seq;

// ── Constants ────────────────────────────────────────────────────

/// Largest payload one frame can carry.
pub const MAX_TRUST_PAYLOAD: usize = 251;

/// Identifier plus length byte.
pub const TRUST_FRAME_HEADER: usize = 5;

/// Largest encoded frame.
pub const MAX_TRUST_FRAME: usize = TRUST_FRAME_HEADER + MAX_TRUST_PAYLOAD;

/// Server-side retransmit interval in ticks.
pub const SERVER_RETRANSMIT_TICKS: u32 = 8;

/// Client-side retransmit interval in ticks.
pub const CLIENT_RETRANSMIT_TICKS: u32 = 10;

/// Sub-channel of the drive plugin: operator chat, emoticons and commands.
pub const DRIVE_CHANNEL: ChannelId = ChannelId::new(*b"KIWI");

// ── ChannelId ────────────────────────────────────────────────────

/// Four-byte sub-channel identifier (for example `KIWI`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId([u8; 4]);

impl ChannelId {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

// ── TrustMessage ─────────────────────────────────────────────────

/// A message delivered by the side-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustMessage {
    pub channel: ChannelId,
    pub payload: Bytes,
}

impl TrustMessage {
    /// Payload interpreted as text, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Encode one frame. Rejects payloads that do not fit the length byte.
pub fn encode_frame(channel: ChannelId, payload: &[u8]) -> Result<Bytes, CortexError> {
    if payload.len() > MAX_TRUST_PAYLOAD {
        return Err(CortexError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_TRUST_PAYLOAD,
        });
    }
    let mut buf = BytesMut::with_capacity(TRUST_FRAME_HEADER + payload.len());
    buf.put_slice(channel.as_bytes());
    buf.put_u8(payload.len() as u8);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Split an accepted body into its frames. A truncated trailing frame
/// ends the walk.
pub fn split_frames(body: &[u8]) -> Vec<TrustMessage> {
    let mut messages = Vec::new();
    let mut rest = body;
    while rest.len() >= TRUST_FRAME_HEADER {
        let channel = ChannelId::new([rest[0], rest[1], rest[2], rest[3]]);
        let len = rest[4] as usize;
        let Some(payload) = rest.get(TRUST_FRAME_HEADER..TRUST_FRAME_HEADER + len) else {
            tracing::trace!(%channel, len, "truncated trust frame");
            break;
        };
        messages.push(TrustMessage {
            channel,
            payload: Bytes::copy_from_slice(payload),
        });
        rest = &rest[TRUST_FRAME_HEADER + len..];
    }
    messages
}

/// Inbound acceptance check. Advances `expected` and returns the
/// messages when `advertised` is the next sequence and the body is
/// non-empty; otherwise the body is a duplicate or out of order.
pub fn accept_inbound(expected: &mut Seq, advertised: Seq, body: &[u8]) -> Option<Vec<TrustMessage>> {
    if body.is_empty() || expected.succ() != advertised {
        return None;
    }
    expected.advance();
    Some(split_frames(body))
}

// ── TrustQueue ───────────────────────────────────────────────────

/// Outgoing FIFO of one direction of the side-channel.
#[derive(Debug)]
pub struct TrustQueue {
    pending: VecDeque<Bytes>,
    countdown: u32,
    retransmit_ticks: u32,
}

impl TrustQueue {
    pub fn new(retransmit_ticks: u32) -> Self {
        Self {
            pending: VecDeque::new(),
            countdown: 0,
            retransmit_ticks,
        }
    }

    /// Append a message. Never blocks.
    pub fn push(&mut self, channel: ChannelId, payload: &[u8]) -> Result<(), CortexError> {
        let frame = encode_frame(channel, payload)?;
        self.pending.push_back(frame);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything (active session changed).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.countdown = 0;
    }

    /// Send path: append the head frame to `packet` when the
    /// retransmit countdown has run out. Returns whether a frame rode
    /// along.
    pub fn attach(&mut self, packet: &mut Vec<u8>) -> bool {
        if self.countdown == 0 {
            if let Some(head) = self.pending.front() {
                packet.extend_from_slice(head);
                self.countdown = self.retransmit_ticks;
                return true;
            }
            false
        } else {
            self.countdown -= 1;
            false
        }
    }

    /// ACK path: the peer echoed `echoed` as the last sequence it
    /// accepted from us. Pops the head when it matches our counter.
    pub fn acknowledge(&mut self, echoed: Seq, send_seq: &mut Seq) -> bool {
        if echoed != *send_seq || self.pending.is_empty() {
            return false;
        }
        self.pending.pop_front();
        send_seq.advance();
        self.countdown = 0;
        true
    }
}
