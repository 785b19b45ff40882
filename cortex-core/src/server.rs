//! Protocol core of the server: packet handling and per-tick output.
//!
//! `ServerCore` owns the session table and the outgoing trust queue,
//! each behind its own mutex. The receive task calls
//! [`ServerCore::handle_datagram`]; the tick task calls
//! [`ServerCore::step_head`], [`ServerCore::data_packet`] and
//! [`ServerCore::tick`]. Locks are always taken table first, trust
//! second, and never held across socket I/O.

use std::net::SocketAddr;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::error::CortexError;
use crate::lock;
use crate::session::{ActiveControl, DisconnectReason, SessionEvent, SessionLimits, SessionTable, SlotId};
use crate::trust::{ChannelId, TrustMessage, TrustQueue, accept_inbound};
use crate::wire::{Datagram, DataHeader, HeloReply, PROTOCOL_VERSION, Tag, signal, time_reply};

/// What the receive task has to do after one datagram.
#[derive(Debug, Default)]
pub struct Inbound {
    /// Datagram to send back to the sender.
    pub reply: Option<Vec<u8>>,
    /// Reliable messages delivered by the head.
    pub messages: Vec<TrustMessage>,
    pub events: Vec<SessionEvent>,
}

/// Shared protocol state of the server.
#[derive(Debug)]
pub struct ServerCore {
    sessions: Mutex<SessionTable>,
    trust: Mutex<TrustQueue>,
}

impl ServerCore {
    pub fn new(limits: SessionLimits, trust_retransmit_ticks: u32) -> Self {
        Self {
            sessions: Mutex::new(SessionTable::new(limits)),
            trust: Mutex::new(TrustQueue::new(trust_retransmit_ticks)),
        }
    }

    /// Dispatch one received datagram.
    pub fn handle_datagram(&self, remote: SocketAddr, data: &[u8]) -> Inbound {
        let mut inbound = Inbound::default();
        let Some(datagram) = Datagram::parse(data) else {
            trace!(%remote, len = data.len(), "dropping unrecognised datagram");
            return inbound;
        };

        let mut table = lock(&self.sessions);
        match table.find(remote) {
            Some(slot) => self.handle_known(&mut table, slot, datagram, &mut inbound),
            None => Self::handle_unknown(&mut table, remote, datagram, &mut inbound),
        }
        inbound.events = table.drain_events();
        self.clear_on_head_change(&inbound.events);
        inbound
    }

    fn handle_known(
        &self,
        table: &mut SessionTable,
        slot: SlotId,
        datagram: Datagram<'_>,
        inbound: &mut Inbound,
    ) {
        match datagram {
            Datagram::Helo(_) => {
                if table.rejoin(slot) {
                    lock(&self.trust).clear();
                }
                debug!(slot, "known client restarted its session");
                let reply = HeloReply {
                    version: PROTOCOL_VERSION,
                    queue_time: table.queue_time(slot),
                };
                inbound.reply = Some(reply.to_packet().to_vec());
            }
            Datagram::Time(_) => {
                table.touch(slot);
                inbound.reply = Some(time_reply(table.queue_time(slot)).to_vec());
            }
            Datagram::Quit => {
                table.remove(slot, DisconnectReason::Quit);
            }
            Datagram::Ctrl { header, trust } => {
                table.record_control(slot, header.sample);
                if !table.is_head(slot) {
                    return;
                }
                let Some(session) = table.get_mut(slot) else {
                    return;
                };
                lock(&self.trust).acknowledge(header.trust_srv, &mut session.trust_srv);
                if let Some(messages) = accept_inbound(&mut session.trust_cli, header.trust_cli, trust) {
                    inbound.messages = messages;
                }
            }
            other => trace!(slot, tag = %other.tag(), "ignoring datagram from client"),
        }
    }

    fn handle_unknown(
        table: &mut SessionTable,
        remote: SocketAddr,
        datagram: Datagram<'_>,
        inbound: &mut Inbound,
    ) {
        match datagram {
            Datagram::Helo(_) => match table.add(remote) {
                Ok(slot) => {
                    let reply = HeloReply {
                        version: PROTOCOL_VERSION,
                        queue_time: table.queue_time(slot),
                    };
                    inbound.reply = Some(reply.to_packet().to_vec());
                }
                Err(e) => {
                    debug!(%remote, "refusing client: {e}");
                    inbound.reply = Some(signal(Tag::Full).to_vec());
                }
            },
            Datagram::Quit => {}
            _ => inbound.reply = Some(signal(Tag::Lost).to_vec()),
        }
    }

    fn clear_on_head_change(&self, events: &[SessionEvent]) {
        if events
            .iter()
            .any(|e| matches!(e, SessionEvent::HeadChanged { .. }))
        {
            lock(&self.trust).clear();
        }
    }

    /// Session-table countdowns. Returns what changed.
    pub fn tick(&self) -> Vec<SessionEvent> {
        let mut table = lock(&self.sessions);
        table.tick();
        let events = table.drain_events();
        self.clear_on_head_change(&events);
        events
    }

    /// Differencer step for the head, if there is one.
    pub fn step_head(&self) -> Option<ActiveControl> {
        lock(&self.sessions).step_head()
    }

    /// Build this tick's DATA packet, with a trust frame when one is due.
    pub fn data_packet(&self, header: &DataHeader) -> Vec<u8> {
        let mut packet = header.to_packet();
        lock(&self.trust).attach(&mut packet);
        packet
    }

    /// Queue a reliable message for the active client.
    pub fn send_reliable(&self, channel: ChannelId, payload: &[u8]) -> Result<(), CortexError> {
        lock(&self.trust).push(channel, payload)
    }

    pub fn pending_reliable(&self) -> usize {
        lock(&self.trust).len()
    }

    pub fn take_intra_refresh(&self) -> bool {
        lock(&self.sessions).take_intra_refresh()
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn queue(&self) -> Vec<SlotId> {
        lock(&self.sessions).queue()
    }

    /// Addresses of every live session (for the shutdown QUIT).
    pub fn remotes(&self) -> Vec<SocketAddr> {
        lock(&self.sessions).remotes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSample, KeyMask};
    use crate::seq::Seq;
    use crate::wire::CtrlHeader;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 2], port))
    }

    fn ctrl(trust_srv: u8, trust_cli: u8, sample: ControlSample, body: &[u8]) -> Vec<u8> {
        let mut packet = CtrlHeader {
            trust_srv: Seq::new(trust_srv),
            trust_cli: Seq::new(trust_cli),
            sample,
        }
        .to_packet();
        packet.extend_from_slice(body);
        packet
    }

    #[test]
    fn helo_from_unknown_admits_and_replies() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        let inbound = core.handle_datagram(addr(1), b"HELO");
        assert_eq!(inbound.reply.as_deref(), Some(&b"HELO\x02\x00\x00\x00\x00"[..]));
        assert_eq!(core.session_count(), 1);
        assert!(core.take_intra_refresh());

        // Second client waits one full turn.
        let inbound = core.handle_datagram(addr(2), b"HELO");
        let reply = inbound.reply.unwrap();
        assert_eq!(&reply[5..9], &7_500u32.to_le_bytes());
    }

    #[test]
    fn full_table_answers_full() {
        let limits = SessionLimits {
            capacity: 1,
            ..SessionLimits::default()
        };
        let core = ServerCore::new(limits, 8);
        core.handle_datagram(addr(1), b"HELO");
        let inbound = core.handle_datagram(addr(2), b"HELO");
        assert_eq!(inbound.reply.as_deref(), Some(&b"FULL"[..]));
        assert_eq!(core.session_count(), 1);
    }

    #[test]
    fn unknown_sender_gets_lost() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        let packet = ctrl(0xFF, 0, ControlSample::default(), b"");
        let inbound = core.handle_datagram(addr(9), &packet);
        assert_eq!(inbound.reply.as_deref(), Some(&b"LOST"[..]));
        assert!(core.handle_datagram(addr(9), b"QUIT").reply.is_none());
        assert!(core.handle_datagram(addr(9), b"xx").reply.is_none());
    }

    #[test]
    fn time_reports_queue_position() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        core.handle_datagram(addr(1), b"HELO");
        core.handle_datagram(addr(2), b"HELO");
        core.tick();
        let inbound = core.handle_datagram(addr(2), b"TIME");
        assert_eq!(inbound.reply.unwrap(), time_reply(7_499).to_vec());
    }

    #[test]
    fn head_trust_roundtrip() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        core.handle_datagram(addr(1), b"HELO");

        // Client message with sequence 0 is delivered once.
        let packet = ctrl(0xFF, 0, ControlSample::default(), b"KIWI\x05HELLO");
        let inbound = core.handle_datagram(addr(1), &packet);
        assert_eq!(inbound.messages.len(), 1);
        assert_eq!(inbound.messages[0].text(), "HELLO");
        assert!(core.handle_datagram(addr(1), &packet).messages.is_empty());

        // Server reply rides on the next DATA and echoes the client.
        core.send_reliable(ChannelId::new(*b"KIWI"), b"OK").unwrap();
        let step = core.step_head().unwrap();
        assert_eq!(step.header.trust_cli, Seq::new(0));
        let data = core.data_packet(&step.header);
        assert_eq!(&data[10..], b"KIWI\x02OK");

        // Client acknowledges sequence 0.
        core.handle_datagram(addr(1), &ctrl(0, 1, ControlSample::default(), b""));
        assert_eq!(core.pending_reliable(), 0);
        assert_eq!(core.step_head().unwrap().header.trust_srv, Seq::new(1));
    }

    #[test]
    fn queued_client_cannot_drive() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        core.handle_datagram(addr(1), b"HELO");
        core.handle_datagram(addr(2), b"HELO");
        let packet = ctrl(0xFF, 0, ControlSample::new(5, 5, KeyMask::UP), b"KIWI\x01x");
        assert!(core.handle_datagram(addr(2), &packet).messages.is_empty());
        let step = core.step_head().unwrap();
        assert_eq!(step.remote, addr(1));
        assert!(step.ctrl.kb.is_empty());
    }

    #[test]
    fn head_change_clears_trust() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        core.handle_datagram(addr(1), b"HELO");
        core.handle_datagram(addr(2), b"HELO");
        core.send_reliable(ChannelId::new(*b"KIWI"), b"for the first client").unwrap();
        let inbound = core.handle_datagram(addr(1), b"QUIT");
        assert!(inbound.events.contains(&SessionEvent::HeadChanged {
            previous: Some(0),
            current: Some(1)
        }));
        assert_eq!(core.pending_reliable(), 0);
        assert!(core.take_intra_refresh());
    }
}
