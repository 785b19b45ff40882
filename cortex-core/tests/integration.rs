//! Integration tests: a server core and client links talking over real
//! UDP sockets on localhost, and the reliable side-channel over a
//! simulated lossy, duplicating, reordering network.

use std::net::SocketAddr;
use std::time::Duration;

use cortex_core::{
    ChannelId, ClientLimits, ClientLink, ClientState, ControlSample, KeyMask, ServerCore,
    SessionLimits,
};
use tokio::net::UdpSocket;

const KIWI: ChannelId = ChannelId::new(*b"KIWI");
const FRAME: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x00];

// ── Helpers ──────────────────────────────────────────────────────

async fn bind() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

async fn recv(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = vec![0u8; 65_536];
    let (len, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("timeout")
        .unwrap();
    buf.truncate(len);
    (buf, from)
}

/// Server side of one exchange: receive, dispatch, answer.
async fn serve_one(core: &ServerCore, socket: &UdpSocket) -> cortex_core::Inbound {
    let (data, from) = recv(socket).await;
    let inbound = core.handle_datagram(from, &data);
    if let Some(reply) = &inbound.reply {
        socket.send_to(reply, from).await.unwrap();
    }
    inbound
}

// ── Session lifecycle over UDP ───────────────────────────────────

#[tokio::test]
async fn test_helo_queue_stream_quit() {
    let (server_sock, server_addr) = bind().await;
    let (client_sock, client_addr) = bind().await;
    let core = ServerCore::new(SessionLimits::default(), 8);
    let link = ClientLink::new(ClientLimits::default(), 16);

    // HELO → HELO + version 2 + queue time 0.
    let helo = link.tick(ControlSample::default()).expect("first tick probes");
    assert_eq!(helo, b"HELO");
    client_sock.send_to(&helo, server_addr).await.unwrap();
    let inbound = serve_one(&core, &server_sock).await;
    assert_eq!(inbound.reply.as_deref(), Some(&b"HELO\x02\x00\x00\x00\x00"[..]));

    let (reply, _) = recv(&client_sock).await;
    link.on_datagram(&reply);
    assert_eq!(link.state(), ClientState::Queued);
    assert_eq!(link.status().queue_time, 0);

    // One server tick: video and DATA to the head.
    let active = core.step_head().expect("client is head");
    assert_eq!(active.remote, client_addr);
    assert!(core.take_intra_refresh());
    server_sock.send_to(FRAME, active.remote).await.unwrap();
    let data = core.data_packet(&active.header);
    server_sock.send_to(&data, active.remote).await.unwrap();

    for _ in 0..2 {
        let (packet, _) = recv(&client_sock).await;
        link.on_datagram(&packet);
    }
    assert_eq!(link.state(), ClientState::Streaming);
    assert_eq!(link.next_access_unit().as_deref(), Some(FRAME));
    assert_eq!(link.status().turn_timer, 7_500);

    // Reliable text from the operator reaches the server once.
    link.send_reliable(KIWI, b"HELLO ROBOT").unwrap();
    let ctrl = link
        .tick(ControlSample::new(3, -1, KeyMask::UP))
        .expect("streaming sends CTRL");
    client_sock.send_to(&ctrl, server_addr).await.unwrap();
    let inbound = serve_one(&core, &server_sock).await;
    assert_eq!(inbound.messages.len(), 1);
    assert_eq!(inbound.messages[0].channel, KIWI);
    assert_eq!(inbound.messages[0].text(), "HELLO ROBOT");
    assert_eq!(core.step_head().unwrap().ctrl.kb, KeyMask::UP);

    // Clean exit.
    client_sock
        .send_to(&ClientLink::quit_packet(), server_addr)
        .await
        .unwrap();
    serve_one(&core, &server_sock).await;
    assert_eq!(core.session_count(), 0);
    assert!(core.step_head().is_none());
}

#[tokio::test]
async fn test_second_client_waits_its_turn() {
    let (server_sock, server_addr) = bind().await;
    let core = ServerCore::new(SessionLimits::default(), 8);

    let mut links = Vec::new();
    for _ in 0..2 {
        let (sock, _) = bind().await;
        let link = ClientLink::new(ClientLimits::default(), 16);
        let helo = link.tick(ControlSample::default()).unwrap();
        sock.send_to(&helo, server_addr).await.unwrap();
        serve_one(&core, &server_sock).await;
        let (reply, _) = recv(&sock).await;
        link.on_datagram(&reply);
        links.push((sock, link));
    }
    assert_eq!(links[0].1.status().queue_time, 0);
    assert_eq!(links[1].1.status().queue_time, 7_500);
    assert!(links.iter().all(|(_, l)| l.state() == ClientState::Queued));

    // Only the head gets video.
    let active = core.step_head().unwrap();
    assert_eq!(active.remote, links[0].0.local_addr().unwrap());
}

#[tokio::test]
async fn test_full_server_refuses() {
    let (server_sock, server_addr) = bind().await;
    let limits = SessionLimits {
        capacity: 1,
        ..SessionLimits::default()
    };
    let core = ServerCore::new(limits, 8);

    let (first, _) = bind().await;
    first.send_to(b"HELO", server_addr).await.unwrap();
    serve_one(&core, &server_sock).await;

    let (second, _) = bind().await;
    let link = ClientLink::new(ClientLimits::default(), 16);
    second.send_to(b"HELO", server_addr).await.unwrap();
    serve_one(&core, &server_sock).await;
    let (reply, _) = recv(&second).await;
    link.on_datagram(&reply);
    assert_eq!(link.state(), ClientState::Full);
    assert_eq!(core.session_count(), 1);
}

// ── Exactly-once over a hostile network ──────────────────────────

/// Deterministic drop/duplicate/reorder/delay channel.
struct LossyWire {
    rng: u64,
    lossy: bool,
    in_flight: Vec<Vec<u8>>,
}

impl LossyWire {
    fn new(seed: u64) -> Self {
        Self {
            rng: seed,
            lossy: false,
            in_flight: Vec::new(),
        }
    }

    fn roll(&mut self) -> u64 {
        self.rng = self
            .rng
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.rng >> 33) % 100
    }

    fn send(&mut self, packet: Vec<u8>) {
        if self.lossy {
            let r = self.roll();
            if r < 30 {
                return;
            }
            if r < 40 {
                self.in_flight.push(packet.clone());
            }
        }
        self.in_flight.push(packet);
    }

    /// Packets arriving this tick, shuffled; some are held back a tick.
    fn deliver(&mut self) -> Vec<Vec<u8>> {
        let mut arriving = Vec::new();
        let mut held = Vec::new();
        for packet in std::mem::take(&mut self.in_flight) {
            if self.lossy && self.roll() < 20 {
                held.push(packet);
            } else {
                arriving.push(packet);
            }
        }
        if self.lossy {
            for i in (1..arriving.len()).rev() {
                let j = (self.roll() as usize) % (i + 1);
                arriving.swap(i, j);
            }
        }
        self.in_flight = held;
        arriving
    }
}

#[test]
fn test_trust_exactly_once_under_loss() {
    let client_addr: SocketAddr = "10.1.1.1:5000".parse().unwrap();
    let core = ServerCore::new(SessionLimits::default(), 8);
    let link = ClientLink::new(ClientLimits::default(), 256);
    let mut up = LossyWire::new(7);
    let mut down = LossyWire::new(11);

    let outgoing_client: Vec<String> = (0..20).map(|i| format!("C{i:02}")).collect();
    let outgoing_server: Vec<String> = (0..20).map(|i| format!("S{i:02}")).collect();
    for text in &outgoing_client {
        link.send_reliable(KIWI, text.as_bytes()).unwrap();
    }

    let mut at_server = Vec::new();
    let mut at_client = Vec::new();
    let mut server_queued = false;

    for _ in 0..3_000 {
        // Client tick.
        if let Some(packet) = link.tick(ControlSample::default()) {
            up.send(packet);
        }

        // Server receive path.
        for packet in up.deliver() {
            let inbound = core.handle_datagram(client_addr, &packet);
            at_server.extend(inbound.messages.iter().map(|m| m.text()));
            if let Some(reply) = inbound.reply {
                down.send(reply);
            }
        }

        // Server tick.
        if let Some(active) = core.step_head() {
            if !server_queued {
                for text in &outgoing_server {
                    core.send_reliable(KIWI, text.as_bytes()).unwrap();
                }
                server_queued = true;
            }
            down.send(FRAME.to_vec());
            down.send(core.data_packet(&active.header));
        }
        core.tick();

        // Client receive path.
        for packet in down.deliver() {
            link.on_datagram(&packet);
        }
        while link.next_access_unit().is_some() {}
        at_client.extend(link.drain_messages().iter().map(|m| m.text()));

        // The handshake runs clean; the stream does not.
        if link.state() == ClientState::Streaming {
            up.lossy = true;
            down.lossy = true;
        }
    }

    assert_eq!(link.state(), ClientState::Streaming);
    assert_eq!(at_server, outgoing_client);
    assert_eq!(at_client, outgoing_server);
}

// ── Reconnect on the same address ────────────────────────────────

/// One clean round trip: client tick, server receive, server tick.
fn exchange(core: &ServerCore, link: &ClientLink, remote: SocketAddr, at_server: &mut Vec<String>) {
    if let Some(packet) = link.tick(ControlSample::default()) {
        let inbound = core.handle_datagram(remote, &packet);
        at_server.extend(inbound.messages.iter().map(|m| m.text()));
        if let Some(reply) = inbound.reply {
            link.on_datagram(&reply);
        }
    }
    if let Some(active) = core.step_head() {
        link.on_datagram(FRAME);
        link.on_datagram(&core.data_packet(&active.header));
    }
    core.tick();
    while link.next_access_unit().is_some() {}
}

#[test]
fn test_reconnect_from_same_address_restarts_trust() {
    let remote: SocketAddr = "10.1.1.2:5000".parse().unwrap();
    let core = ServerCore::new(SessionLimits::default(), 8);
    let link = ClientLink::new(ClientLimits::default(), 16);
    let mut at_server = Vec::new();

    link.send_reliable(KIWI, b"FIRST").unwrap();
    for _ in 0..50 {
        exchange(&core, &link, remote, &mut at_server);
    }
    assert_eq!(link.state(), ClientState::Streaming);
    assert_eq!(at_server, ["FIRST"]);

    // The operator restarts while the server still knows the address.
    link.reconnect();
    assert_eq!(link.state(), ClientState::Connecting);
    for _ in 0..5 {
        exchange(&core, &link, remote, &mut at_server);
    }
    assert_eq!(link.state(), ClientState::Streaming);
    assert_eq!(core.session_count(), 1);

    link.send_reliable(KIWI, b"SECOND").unwrap();
    core.send_reliable(KIWI, b"WELCOME BACK").unwrap();
    let mut at_client = Vec::new();
    for _ in 0..200 {
        exchange(&core, &link, remote, &mut at_server);
        at_client.extend(link.drain_messages().iter().map(|m| m.text()));
    }
    assert_eq!(at_server, ["FIRST", "SECOND"]);
    assert_eq!(at_client, ["WELCOME BACK"]);
}
