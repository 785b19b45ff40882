//! Server service: the UDP receive task and the fixed-rate tick loop.
//!
//! Startup opens every collaborator the loop needs (socket, capture
//! devices, encoder, speech, plugins) and maps failures to an
//! [`ExitStatus`] category. The loop then runs once per frame until the
//! stop handle is cleared.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use cortex_core::wire::{MAX_DATAGRAM, VIDEO_CHUNK, signal};
use cortex_core::{
    CortexError, ExitStatus, Fatal, PixelFormat, ServerCore, SessionEvent, SpeechQueue, Tag, Ticker,
    TrustMessage, VideoEncoder,
};

use crate::capture::Compositor;
use crate::config::ServerConfig;
use crate::drive::DrivePlugin;
use crate::encoder::CommandEncoder;
use crate::plugin::PluginSet;

// ── StreamStats ──────────────────────────────────────────────────

/// Video statistics, logged at shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub ticks: u64,
    /// Video datagrams sent.
    pub access_units: u64,
    pub bytes: u64,
    pub largest: usize,
}

impl StreamStats {
    fn record(&mut self, datagram: &[u8]) {
        self.access_units += 1;
        self.bytes += datagram.len() as u64;
        self.largest = self.largest.max(datagram.len());
    }
}

/// Pack NAL units into video datagrams of at most `limit` bytes. A unit
/// larger than `limit` travels alone.
pub fn pack_units(units: &[Bytes], limit: usize) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    for unit in units {
        if !current.is_empty() && current.len() + unit.len() > limit {
            out.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(unit);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

// ── Recorder ─────────────────────────────────────────────────────

/// Appends the encoded stream to a file.
struct Recorder {
    out: BufWriter<File>,
}

impl Recorder {
    fn open(path: &Path) -> Result<Self, CortexError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "recording stream");
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    fn write(&mut self, units: &[Bytes]) {
        for unit in units {
            if let Err(e) = self.out.write_all(unit) {
                warn!("recording failed: {e}");
                return;
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        let _ = self.out.flush();
    }
}

// ── CortexServer ─────────────────────────────────────────────────

/// What the receive task hands the tick loop.
enum Notice {
    Message(TrustMessage),
    Session(SessionEvent),
}

/// The top-level server service.
pub struct CortexServer {
    config: ServerConfig,
    running: Arc<AtomicBool>,
}

impl CortexServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle that stops the tick loop when set to `false`.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the configured port and serve until stopped.
    pub async fn run(&self) -> Result<StreamStats, Fatal> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.network.port));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| Fatal::new(ExitStatus::Bind, e))?;
        info!("listening on {addr}");
        self.serve(socket).await
    }

    /// Serve on an already bound socket until stopped.
    pub async fn serve(&self, socket: UdpSocket) -> Result<StreamStats, Fatal> {
        self.running.store(true, Ordering::SeqCst);
        let config = &self.config;

        let mut devices = Compositor::from_config(config).map_err(|e| Fatal::new(ExitStatus::Capture, e))?;
        if devices.is_empty() {
            return Err(Fatal::new(ExitStatus::NoSource, CortexError::Capture("no capture devices configured".into())));
        }
        let mut encoder = CommandEncoder::spawn(
            config.encoder_command(PixelFormat::Bgr8.ffmpeg_name()),
            config.encoder.restart_on_refresh,
        )
        .map_err(|e| Fatal::new(ExitStatus::Encoder, e))?;
        let mut recorder = match config.stream.record.as_str() {
            "" => None,
            path => Some(Recorder::open(Path::new(path)).map_err(|e| Fatal::new(ExitStatus::Encoder, e))?),
        };
        let speech = SpeechQueue::spawn(config.speech.command.clone())
            .map_err(|e| Fatal::new(ExitStatus::Audio, e))?;

        let core = Arc::new(ServerCore::new(config.session_limits(), config.timeouts.trust));
        let mut plugins = PluginSet::new();
        plugins.push(Box::new(DrivePlugin::new(&config.drive)));
        plugins.init(&core, &speech, &mut devices);

        let socket = Arc::new(socket);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&core), tx));

        info!(
            fps = config.stream.fps,
            w = config.stream.width,
            h = config.stream.height,
            slots = config.queue.capacity,
            "cortex server running"
        );

        let mut stats = StreamStats::default();
        let mut ticker = Ticker::new(config.stream.fps);
        let mut outcome = Ok(());

        while self.running.load(Ordering::SeqCst) {
            while let Ok(notice) = rx.try_recv() {
                match notice {
                    Notice::Message(message) => {
                        plugins.route(&message, &core, &speech, &mut devices);
                    }
                    Notice::Session(event) => on_session_event(&event, &mut plugins),
                }
            }

            let frame = match devices.compose(|n, frame| plugins.capture(n, frame)) {
                Ok(frame) => frame,
                Err(e) => {
                    outcome = Err(Fatal::new(ExitStatus::Capture, e));
                    break;
                }
            };
            if core.take_intra_refresh() {
                encoder.request_intra_refresh();
            }
            let units = match encoder.encode(frame) {
                Ok(units) => units,
                Err(e) => {
                    outcome = Err(Fatal::new(ExitStatus::Encoder, e));
                    break;
                }
            };
            if let Some(recorder) = recorder.as_mut() {
                recorder.write(&units);
            }

            match core.step_head() {
                Some(active) => {
                    plugins.tick(&active.ctrl, &active.diff);
                    for datagram in pack_units(&units, VIDEO_CHUNK) {
                        match socket.send_to(&datagram, active.remote).await {
                            Ok(_) => stats.record(&datagram),
                            Err(e) => debug!(remote = %active.remote, "video send failed: {e}"),
                        }
                    }
                    let data = core.data_packet(&active.header);
                    if let Err(e) = socket.send_to(&data, active.remote).await {
                        debug!(remote = %active.remote, "DATA send failed: {e}");
                    }
                }
                None => plugins.still(),
            }

            for event in core.tick() {
                on_session_event(&event, &mut plugins);
            }
            stats.ticks += 1;
            ticker.wait().await;
        }

        let quit = signal(Tag::Quit);
        for remote in core.remotes() {
            if let Err(e) = socket.send_to(&quit, remote).await {
                debug!(%remote, "QUIT send failed: {e}");
            }
        }
        plugins.close();
        receiver.abort();
        self.running.store(false, Ordering::SeqCst);

        info!(
            ticks = stats.ticks,
            access_units = stats.access_units,
            bytes = stats.bytes,
            largest = stats.largest,
            overruns = ticker.overruns(),
            "cortex server stopped"
        );
        outcome.map(|()| stats)
    }
}

fn on_session_event(event: &SessionEvent, plugins: &mut PluginSet) {
    match event {
        SessionEvent::Joined { slot, remote } => info!(slot, %remote, "client connected"),
        SessionEvent::Left { slot, remote, reason } => {
            info!(slot, %remote, %reason, "client disconnected")
        }
        SessionEvent::HeadChanged { previous, current } => {
            debug!(?previous, ?current, "active client changed");
            if previous.is_some() {
                plugins.connected(false);
            }
            if current.is_some() {
                plugins.connected(true);
            }
        }
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, core: Arc<ServerCore>, tx: mpsc::UnboundedSender<Notice>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(e) => {
                trace!("recv error: {e}");
                continue;
            }
        };
        let inbound = core.handle_datagram(from, &buf[..len]);
        if let Some(reply) = &inbound.reply {
            if let Err(e) = socket.send_to(reply, from).await {
                debug!(remote = %from, "reply failed: {e}");
            }
        }
        let notices = inbound
            .events
            .into_iter()
            .map(Notice::Session)
            .chain(inbound.messages.into_iter().map(Notice::Message));
        for notice in notices {
            if tx.send(notice).is_err() {
                return;
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_creates_with_defaults() {
        let svc = CortexServer::new(ServerConfig::default());
        assert!(!svc.is_running());
    }

    #[test]
    fn stop_handle_works() {
        let svc = CortexServer::new(ServerConfig::default());
        let handle = svc.stop_handle();
        handle.store(true, Ordering::SeqCst);
        assert!(svc.is_running());
        svc.stop();
        assert!(!svc.is_running());
    }

    #[test]
    fn units_are_packed_up_to_the_limit() {
        let units: Vec<Bytes> = [6usize, 6, 6, 20]
            .iter()
            .map(|&n| Bytes::from(vec![1u8; n]))
            .collect();
        let packed = pack_units(&units, 12);
        let sizes: Vec<usize> = packed.iter().map(|d| d.len()).collect();
        assert_eq!(sizes, vec![12, 6, 20]);
        assert!(pack_units(&[], 12).is_empty());
    }

    #[test]
    fn stats_track_largest() {
        let mut s = StreamStats::default();
        s.record(&[0; 10]);
        s.record(&[0; 4]);
        assert_eq!((s.access_units, s.bytes, s.largest), (2, 14, 10));
    }

    #[tokio::test]
    async fn no_devices_is_fatal() {
        let mut config = ServerConfig::default();
        config.devices.clear();
        let svc = CortexServer::new(config);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let err = svc.serve(socket).await.unwrap_err();
        assert_eq!(err.status, ExitStatus::NoSource);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serves_a_client_and_says_quit_on_stop() {
        use std::time::Duration;

        let mut config = ServerConfig::default();
        config.stream.width = 16;
        config.stream.height = 16;
        config.devices[0].width = 16;
        config.devices[0].height = 16;
        config.encoder.command = vec!["cat".into()];
        config.speech.command.clear();

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = socket.local_addr().unwrap();
        let svc = Arc::new(CortexServer::new(config));
        let stop = svc.stop_handle();
        let task = tokio::spawn({
            let svc = Arc::clone(&svc);
            async move { svc.serve(socket).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"HELO", server_addr).await.unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut seen = Vec::new();
        let wait = Duration::from_secs(5);
        while !seen.contains(&Tag::Data) {
            let (len, _) = tokio::time::timeout(wait, client.recv_from(&mut buf))
                .await
                .expect("timeout")
                .unwrap();
            seen.extend(Tag::identify(&buf[..len]));
        }
        assert_eq!(seen[0], Tag::Helo);

        stop.store(false, Ordering::SeqCst);
        loop {
            let (len, _) = tokio::time::timeout(wait, client.recv_from(&mut buf))
                .await
                .expect("timeout")
                .unwrap();
            if Tag::identify(&buf[..len]) == Some(Tag::Quit) {
                break;
            }
        }
        let stats = task.await.unwrap().unwrap();
        assert!(stats.ticks > 0);
    }
}
