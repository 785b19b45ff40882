//! Server-side session table and drive-turn queue.
//!
//! Sessions live in a fixed array of slots. Live slots are threaded
//! into an insertion-ordered queue through `prev`/`next` indices; the
//! head of that queue is the only session whose control input is
//! applied and the only one that receives video.
//!
//! ```text
//!  HELO ──► add ──► tail ··· head ──► timer/timeout hits 0 ──► evicted
//!                              │
//!                              └──► QUIT / timeout ──► removed
//! ```
//!
//! Capacity 0 selects direct mode: a single slot with no turn timer,
//! claimed by whoever says HELO last.

use std::fmt;
use std::net::SocketAddr;

use crate::control::{ControlSample, Differencer};
use crate::error::CortexError;
use crate::seq::Seq;
use crate::wire::DataHeader;

/// Index of a slot in the table.
pub type SlotId = usize;

// ── SessionLimits ────────────────────────────────────────────────

/// Immutable table parameters, in server ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Number of slots. 0 selects direct mode.
    pub capacity: usize,
    /// Ticks without any packet before a session is dropped.
    pub connection_timeout: u32,
    /// Length of one drive turn.
    pub control_timeout: u32,
    /// Ticks a held key survives without a fresh CTRL.
    pub glitch_timeout: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            capacity: 10,
            connection_timeout: 100,
            control_timeout: 7_500,
            glitch_timeout: 2,
        }
    }
}

impl SessionLimits {
    pub fn is_direct(&self) -> bool {
        self.capacity == 0
    }

    fn slot_count(&self) -> usize {
        self.capacity.max(1)
    }
}

// ── Events ───────────────────────────────────────────────────────

/// Why a session left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// No packet within the connection timeout.
    PingTimeout,
    /// The drive turn ran out.
    TimeUp,
    /// The client said QUIT.
    Quit,
    /// Another client claimed the direct-mode slot.
    Replaced,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PingTimeout => write!(f, "ping timeout"),
            Self::TimeUp => write!(f, "time up"),
            Self::Quit => write!(f, "quit"),
            Self::Replaced => write!(f, "replaced"),
        }
    }
}

/// Something the owner of the table has to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Joined {
        slot: SlotId,
        remote: SocketAddr,
    },
    Left {
        slot: SlotId,
        remote: SocketAddr,
        reason: DisconnectReason,
    },
    /// The active session changed. `previous` was disconnected from the
    /// controls and `current` (if any) now drives.
    HeadChanged {
        previous: Option<SlotId>,
        current: Option<SlotId>,
    },
}

// ── Session ──────────────────────────────────────────────────────

/// One connected client.
#[derive(Debug, Clone)]
pub struct Session {
    pub remote: SocketAddr,
    /// Ticks until the session is considered dead.
    pub timeout: u32,
    /// Remaining drive turn; counts down only while at the head.
    pub timer: u32,
    /// Ticks of key grace left.
    pub glitch: u32,
    /// Last client message sequence accepted.
    pub trust_cli: Seq,
    /// Sequence of our in-flight message to this client.
    pub trust_srv: Seq,
    pub control: Differencer,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

impl Session {
    fn new(remote: SocketAddr, limits: &SessionLimits) -> Self {
        Self {
            remote,
            timeout: limits.connection_timeout,
            timer: if limits.is_direct() {
                0
            } else {
                limits.control_timeout
            },
            glitch: 0,
            trust_cli: Seq::BEFORE_FIRST,
            trust_srv: Seq::new(0),
            control: Differencer::new(),
            prev: None,
            next: None,
        }
    }
}

/// Control state of the head, copied out for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveControl {
    pub slot: SlotId,
    pub remote: SocketAddr,
    /// Absolute sample (key level).
    pub ctrl: ControlSample,
    /// Delta since the previous tick (key edges).
    pub diff: ControlSample,
    /// Header for this tick's DATA packet.
    pub header: DataHeader,
}

// ── SessionTable ─────────────────────────────────────────────────

/// Bounded session table with a FIFO drive queue.
#[derive(Debug)]
pub struct SessionTable {
    slots: Vec<Option<Session>>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    limits: SessionLimits,
    intra_refresh: bool,
    events: Vec<SessionEvent>,
}

impl SessionTable {
    pub fn new(limits: SessionLimits) -> Self {
        Self {
            slots: (0..limits.slot_count()).map(|_| None).collect(),
            head: None,
            tail: None,
            limits,
            intra_refresh: false,
            events: Vec::new(),
        }
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// Live session bound to `remote`.
    pub fn find(&self, remote: SocketAddr) -> Option<SlotId> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.remote == remote))
    }

    pub fn get(&self, slot: SlotId) -> Option<&Session> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: SlotId) -> Option<&mut Session> {
        self.slots.get_mut(slot)?.as_mut()
    }

    pub fn head(&self) -> Option<SlotId> {
        self.head
    }

    pub fn is_head(&self, slot: SlotId) -> bool {
        self.head == Some(slot)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Slots in queue order, head first.
    pub fn queue(&self) -> Vec<SlotId> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            order.push(slot);
            cursor = self.get(slot).and_then(|s| s.next);
        }
        order
    }

    /// Ticks `slot` has to wait: the remaining turns of everyone ahead.
    pub fn queue_time(&self, slot: SlotId) -> u32 {
        let mut total: u32 = 0;
        let mut cursor = self.head;
        while let Some(current) = cursor {
            if current == slot {
                break;
            }
            let Some(session) = self.get(current) else {
                break;
            };
            total = total.saturating_add(session.timer);
            cursor = session.next;
        }
        total
    }

    /// Admit `remote` at the tail of the queue.
    pub fn add(&mut self, remote: SocketAddr) -> Result<SlotId, CortexError> {
        if self.limits.is_direct() {
            return Ok(self.claim_direct(remote));
        }
        let slot = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(CortexError::QueueFull {
                capacity: self.limits.capacity,
            })?;
        self.slots[slot] = Some(Session::new(remote, &self.limits));
        self.link_tail(slot);
        self.events.push(SessionEvent::Joined { slot, remote });
        if self.head == Some(slot) {
            self.head_changed(None);
        }
        Ok(slot)
    }

    fn claim_direct(&mut self, remote: SocketAddr) -> SlotId {
        let previous = self.slots[0].take().map(|old| {
            self.events.push(SessionEvent::Left {
                slot: 0,
                remote: old.remote,
                reason: DisconnectReason::Replaced,
            });
            0
        });
        self.slots[0] = Some(Session::new(remote, &self.limits));
        self.head = Some(0);
        self.tail = Some(0);
        self.events.push(SessionEvent::Joined { slot: 0, remote });
        self.head_changed(previous);
        0
    }

    /// Take `slot` out of the table.
    pub fn remove(&mut self, slot: SlotId, reason: DisconnectReason) -> Option<Session> {
        let was_head = self.is_head(slot);
        self.unlink(slot);
        let session = self.slots.get_mut(slot)?.take()?;
        self.events.push(SessionEvent::Left {
            slot,
            remote: session.remote,
            reason,
        });
        if was_head {
            self.head_changed(Some(slot));
        }
        Some(session)
    }

    /// Any accepted packet keeps the session alive.
    pub fn touch(&mut self, slot: SlotId) {
        let timeout = self.limits.connection_timeout;
        if let Some(session) = self.get_mut(slot) {
            session.timeout = timeout;
        }
    }

    /// A known client said HELO again: it started over, so its counters
    /// and control history start over too. Its place in the queue is
    /// kept. Returns whether it is the head.
    pub fn rejoin(&mut self, slot: SlotId) -> bool {
        let limits = self.limits;
        let is_head = self.is_head(slot);
        let Some(session) = self.get_mut(slot) else {
            return false;
        };
        session.timeout = limits.connection_timeout;
        session.glitch = 0;
        session.trust_cli = Seq::BEFORE_FIRST;
        session.trust_srv = Seq::new(0);
        session.control = Differencer::new();
        if is_head {
            self.intra_refresh = true;
        }
        is_head
    }

    /// A CTRL arrived: refresh liveness, re-arm key grace, store the sample.
    pub fn record_control(&mut self, slot: SlotId, sample: ControlSample) {
        let limits = self.limits;
        if let Some(session) = self.get_mut(slot) {
            session.timeout = limits.connection_timeout;
            session.glitch = limits.glitch_timeout;
            session.control.observe(sample);
        }
    }

    /// Per-tick countdowns and evictions.
    pub fn tick(&mut self) {
        let head = self.head;
        let direct = self.limits.is_direct();
        let mut expired = Vec::new();
        let mut head_expired = None;

        for (slot, entry) in self.slots.iter_mut().enumerate() {
            let Some(session) = entry else {
                continue;
            };
            session.timeout = session.timeout.saturating_sub(1);
            if Some(slot) == head {
                session.glitch = session.glitch.saturating_sub(1);
                if !direct {
                    session.timer = session.timer.saturating_sub(1);
                }
                if session.timeout == 0 {
                    head_expired = Some((slot, DisconnectReason::PingTimeout));
                } else if !direct && session.timer == 0 {
                    head_expired = Some((slot, DisconnectReason::TimeUp));
                }
            } else if session.timeout == 0 {
                expired.push(slot);
            }
        }

        for slot in expired {
            self.remove(slot, DisconnectReason::PingTimeout);
        }
        if let Some((slot, reason)) = head_expired {
            self.remove(slot, reason);
        }
    }

    /// Advance the head's differencer and copy out what this tick needs.
    /// A head whose key grace ran out has its keys released first.
    pub fn step_head(&mut self) -> Option<ActiveControl> {
        let slot = self.head?;
        let session = self.get_mut(slot)?;
        if session.glitch == 0 {
            session.control.release_keys();
        }
        let diff = session.control.step();
        Some(ActiveControl {
            slot,
            remote: session.remote,
            ctrl: session.control.current(),
            diff,
            header: DataHeader {
                trust_srv: session.trust_srv,
                trust_cli: session.trust_cli,
                timer: session.timer,
            },
        })
    }

    /// Whether a keyframe was requested since the last call.
    pub fn take_intra_refresh(&mut self) -> bool {
        std::mem::take(&mut self.intra_refresh)
    }

    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Addresses of every live session.
    pub fn remotes(&self) -> Vec<SocketAddr> {
        self.slots.iter().flatten().map(|s| s.remote).collect()
    }

    // ── Queue links ──────────────────────────────────────────────

    fn head_changed(&mut self, previous: Option<SlotId>) {
        if self.head.is_some() {
            self.intra_refresh = true;
        }
        self.events.push(SessionEvent::HeadChanged {
            previous,
            current: self.head,
        });
    }

    fn link_tail(&mut self, slot: SlotId) {
        let tail = self.tail;
        if let Some(session) = self.get_mut(slot) {
            session.prev = tail;
            session.next = None;
        }
        match tail {
            Some(t) => {
                if let Some(last) = self.get_mut(t) {
                    last.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    fn unlink(&mut self, slot: SlotId) {
        let Some((prev, next)) = self.get(slot).map(|s| (s.prev, s.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(before) = self.get_mut(p) {
                    before.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(after) = self.get_mut(n) {
                    after.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(session) = self.get_mut(slot) {
            session.prev = None;
            session.next = None;
        }
    }
}
