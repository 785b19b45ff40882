//! Client session state machine.
//!
//! ```text
//!  Connecting ──HELO reply──► Queued ──video──► Streaming
//!      │  └──────────────video──────────────────▲   │
//!      ▼                                             ▼
//!  Error / VersionMismatch             Lost / Full (also from any
//!                                      non-terminal state)
//! ```
//!
//! Terminal states ignore all traffic until [`ClientSession::reconnect`].
//! [`ClientLink`] wraps the session, its trust queue and the received
//! video/message buffers for sharing between the receive task and the
//! tick loop.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use bytes::Bytes;
use tracing::{debug, info, trace};

use crate::control::ControlSample;
use crate::error::CortexError;
use crate::lock;
use crate::seq::Seq;
use crate::trust::{CLIENT_RETRANSMIT_TICKS, ChannelId, TrustMessage, TrustQueue, accept_inbound};
use crate::video_queue::AccessUnitQueue;
use crate::wire::{CtrlHeader, Datagram, HeloReply, PROTOCOL_VERSION, TAG_LEN, Tag, decode_time, signal};

// ── ClientState ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Saying HELO until the server answers.
    #[default]
    Connecting,
    /// Admitted, waiting for our turn.
    Queued,
    /// Receiving video and driving.
    Streaming,
    /// The server never answered.
    Error,
    /// The server had no free slot.
    Full,
    /// The server forgot us, or video stopped.
    Lost,
    /// The server speaks another protocol revision.
    VersionMismatch,
}

impl ClientState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Error | Self::Full | Self::Lost | Self::VersionMismatch
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Queued => write!(f, "Queued"),
            Self::Streaming => write!(f, "Streaming"),
            Self::Error => write!(f, "Error"),
            Self::Full => write!(f, "Full"),
            Self::Lost => write!(f, "Lost"),
            Self::VersionMismatch => write!(f, "VersionMismatch"),
        }
    }
}

// ── ClientLimits ─────────────────────────────────────────────────

/// Immutable client parameters, in client ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientLimits {
    /// Protocol revision we speak.
    pub version: u8,
    /// Unanswered HELO/TIME probes before giving up.
    pub max_retry: u32,
    /// Ticks between probes.
    pub probe_interval: u32,
    /// CTRL sends without video before the link is declared lost.
    pub video_timeout: u32,
    /// Trust-frame retransmit interval.
    pub trust_retransmit: u32,
}

impl Default for ClientLimits {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            max_retry: 5,
            probe_interval: 100,
            video_timeout: 125,
            trust_retransmit: CLIENT_RETRANSMIT_TICKS,
        }
    }
}

/// Result of handing one datagram to the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Received<'a> {
    Nothing,
    /// An access unit to decode.
    Video(&'a [u8]),
    /// Reliable messages from the server.
    Messages(Vec<TrustMessage>),
}

// ── ClientSession ────────────────────────────────────────────────

#[derive(Debug)]
pub struct ClientSession {
    state: ClientState,
    limits: ClientLimits,
    retry: u32,
    probe_countdown: u32,
    queue_time: u32,
    turn_timer: u32,
    /// Last server message sequence accepted.
    trust_srv: Seq,
    /// Sequence of our in-flight message.
    trust_cli: Seq,
}

impl ClientSession {
    pub fn new(limits: ClientLimits) -> Self {
        Self {
            state: ClientState::Connecting,
            limits,
            retry: 0,
            probe_countdown: 0,
            queue_time: 0,
            turn_timer: 0,
            trust_srv: Seq::BEFORE_FIRST,
            trust_cli: Seq::new(0),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Server ticks until our turn (valid while queued).
    pub fn queue_time(&self) -> u32 {
        self.queue_time
    }

    /// Server ticks left in our turn (valid while streaming).
    pub fn turn_timer(&self) -> u32 {
        self.turn_timer
    }

    /// Start over from `Connecting` with fresh counters.
    pub fn reconnect(&mut self) {
        *self = Self::new(self.limits);
    }

    fn enter(&mut self, next: ClientState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "client state change");
            self.state = next;
        }
    }

    /// Apply one received datagram.
    pub fn receive<'a>(&mut self, datagram: Datagram<'a>, trust: &mut TrustQueue) -> Received<'a> {
        if self.state.is_terminal() {
            trace!(state = %self.state, tag = %datagram.tag(), "ignoring datagram in terminal state");
            return Received::Nothing;
        }
        match datagram {
            Datagram::Video(bytes) => {
                self.enter(ClientState::Streaming);
                self.retry = 0;
                Received::Video(bytes)
            }
            Datagram::Data { header, trust: body } => {
                trust.acknowledge(header.trust_cli, &mut self.trust_cli);
                self.turn_timer = header.timer;
                if self.state == ClientState::Streaming {
                    self.retry = 0;
                }
                match accept_inbound(&mut self.trust_srv, header.trust_srv, body) {
                    Some(messages) => Received::Messages(messages),
                    None => Received::Nothing,
                }
            }
            Datagram::Helo(body) if self.state == ClientState::Connecting => {
                let Some(reply) = HeloReply::decode(body) else {
                    return Received::Nothing;
                };
                match reply.check_version(self.limits.version) {
                    Ok(()) => {
                        self.queue_time = reply.queue_time;
                        self.retry = 0;
                        self.enter(ClientState::Queued);
                    }
                    Err(e) => {
                        info!("{e}");
                        self.enter(ClientState::VersionMismatch);
                    }
                }
                Received::Nothing
            }
            Datagram::Time(body) if self.state == ClientState::Queued => {
                if let Some(queue_time) = decode_time(body) {
                    self.queue_time = queue_time;
                    self.retry = 0;
                }
                Received::Nothing
            }
            Datagram::Lost | Datagram::Quit => {
                self.enter(ClientState::Lost);
                Received::Nothing
            }
            Datagram::Full => {
                self.enter(ClientState::Full);
                Received::Nothing
            }
            other => {
                trace!(state = %self.state, tag = %other.tag(), "ignoring datagram");
                Received::Nothing
            }
        }
    }

    /// Advance one tick. Returns the packet to send, if any.
    pub fn tick(&mut self, sample: ControlSample, trust: &mut TrustQueue) -> Option<Vec<u8>> {
        match self.state {
            ClientState::Streaming => {
                let header = CtrlHeader {
                    trust_srv: self.trust_srv,
                    trust_cli: self.trust_cli,
                    sample,
                };
                let mut packet = header.to_packet();
                trust.attach(&mut packet);
                self.retry += 1;
                if self.retry >= self.limits.video_timeout {
                    info!("no video for {} ticks", self.retry);
                    self.enter(ClientState::Lost);
                }
                Some(packet)
            }
            ClientState::Connecting | ClientState::Queued => {
                if self.probe_countdown > 0 {
                    self.probe_countdown -= 1;
                    return None;
                }
                self.probe_countdown = self.limits.probe_interval.saturating_sub(1);
                if self.retry >= self.limits.max_retry {
                    info!(state = %self.state, "server not answering");
                    self.enter(ClientState::Error);
                    return None;
                }
                self.retry += 1;
                let tag = if self.state == ClientState::Connecting {
                    Tag::Helo
                } else {
                    Tag::Time
                };
                Some(signal(tag).to_vec())
            }
            _ => None,
        }
    }
}

// ── ClientLink ───────────────────────────────────────────────────

/// Snapshot for the status display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientStatus {
    pub state: ClientState,
    pub queue_time: u32,
    pub turn_timer: u32,
}

/// Client protocol state shared by the receive task and the tick loop.
#[derive(Debug)]
pub struct ClientLink {
    session: Mutex<ClientSession>,
    trust: Mutex<TrustQueue>,
    video: AccessUnitQueue,
    inbox: Mutex<VecDeque<TrustMessage>>,
    reported: Mutex<ClientState>,
}

impl ClientLink {
    pub fn new(limits: ClientLimits, video_depth: usize) -> Self {
        Self {
            session: Mutex::new(ClientSession::new(limits)),
            trust: Mutex::new(TrustQueue::new(limits.trust_retransmit)),
            video: AccessUnitQueue::new(video_depth),
            inbox: Mutex::new(VecDeque::new()),
            reported: Mutex::new(ClientState::Connecting),
        }
    }

    /// Receive path.
    pub fn on_datagram(&self, data: &[u8]) {
        let Some(datagram) = Datagram::parse(data) else {
            trace!(len = data.len(), "dropping unrecognised datagram");
            return;
        };
        let received = {
            let mut session = lock(&self.session);
            let mut trust = lock(&self.trust);
            session.receive(datagram, &mut trust)
        };
        match received {
            Received::Video(bytes) => {
                if self.video.push(Bytes::copy_from_slice(bytes)) {
                    trace!("access-unit buffer full, dropped oldest");
                }
            }
            Received::Messages(messages) => lock(&self.inbox).extend(messages),
            Received::Nothing => {}
        }
    }

    /// Tick path. Returns the packet to send, if any.
    pub fn tick(&self, sample: ControlSample) -> Option<Vec<u8>> {
        let mut session = lock(&self.session);
        let mut trust = lock(&self.trust);
        session.tick(sample, &mut trust)
    }

    /// `(from, to)` when the state changed since the last call.
    pub fn poll_transition(&self) -> Option<(ClientState, ClientState)> {
        let current = lock(&self.session).state();
        let mut reported = lock(&self.reported);
        if *reported == current {
            return None;
        }
        let from = std::mem::replace(&mut *reported, current);
        Some((from, current))
    }

    pub fn state(&self) -> ClientState {
        lock(&self.session).state()
    }

    pub fn status(&self) -> ClientStatus {
        let session = lock(&self.session);
        ClientStatus {
            state: session.state(),
            queue_time: session.queue_time(),
            turn_timer: session.turn_timer(),
        }
    }

    /// Queue a reliable message for the server.
    pub fn send_reliable(&self, channel: ChannelId, payload: &[u8]) -> Result<(), CortexError> {
        lock(&self.trust).push(channel, payload)
    }

    pub fn next_access_unit(&self) -> Option<Bytes> {
        self.video.pop()
    }

    pub fn drain_messages(&self) -> Vec<TrustMessage> {
        lock(&self.inbox).drain(..).collect()
    }

    /// Leave a terminal state and start over.
    pub fn reconnect(&self) {
        let mut session = lock(&self.session);
        session.reconnect();
        lock(&self.trust).clear();
        self.video.clear();
        lock(&self.inbox).clear();
    }

    /// Datagram announcing a clean exit.
    pub fn quit_packet() -> [u8; TAG_LEN] {
        signal(Tag::Quit)
    }
}
