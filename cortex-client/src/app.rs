//! Client application: the receive task, the terminal input thread and
//! the fixed-rate tick loop.
//!
//! Each tick, in order: react to a state change, send CTRL (or a
//! HELO/TIME probe), decode at most one access unit, show received
//! messages, redraw the console, then apply queued keyboard and mouse
//! events.

use std::io::{self, Stdout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crossterm::event::{
    self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyEvent, KeyEventKind,
    KeyModifiers, KeyboardEnhancementFlags, MouseEventKind, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use ratatui::{Terminal, backend::CrosstermBackend};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use cortex_core::wire::MAX_DATAGRAM;
use cortex_core::{
    ClientLink, ClientState, ClientStatus, ControlSample, CortexError, DRIVE_CHANNEL, ExitStatus,
    Fatal, Speech, SpeechQueue, TextConsole, Ticker, TrustMessage, VideoDecoder,
};

use crate::config::{ClientConfig, InputConfig};
use crate::console::{COLUMNS, ConsoleGrid, ROWS, StatusScreen};
use crate::input::{ControlInput, Prompt};
use crate::player::PlayerSink;

/// Events forwarded from the terminal input thread.
#[derive(Debug, Clone)]
pub enum UiEvent {
    Key(KeyEvent),
    /// Pointer moved to a terminal cell.
    Pointer(u16, u16),
}

/// What the loop must do after an operator action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    None,
    Quit,
    Reconnect,
    /// Send the prompt text to the robot and speak it locally.
    Say(String),
}

// ── Operator ─────────────────────────────────────────────────────

/// Operator-facing state: drive input, prompt and status screen.
#[derive(Debug)]
pub struct Operator {
    input: ControlInput,
    prompt: Prompt,
    screen: StatusScreen,
}

impl Operator {
    pub fn new(config: &InputConfig) -> Self {
        Self {
            input: ControlInput::new(config.layout, config.key_hold_ticks, config.mouse_scale),
            prompt: Prompt::default(),
            screen: StatusScreen::new(),
        }
    }

    pub fn input(&self) -> &ControlInput {
        &self.input
    }

    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    pub fn screen(&self) -> &StatusScreen {
        &self.screen
    }

    pub fn on_transition(&mut self, from: ClientState, to: ClientState) {
        info!(%from, %to, "link state");
        if to == ClientState::Streaming {
            self.input.release_all();
        } else if from == ClientState::Streaming {
            self.prompt.cancel();
        }
    }

    /// Messages from the robot are shown on the console.
    pub fn on_message(&mut self, message: &TrustMessage) {
        if message.channel == DRIVE_CHANNEL {
            self.screen.message(message.text());
        } else {
            debug!(channel = %message.channel, "message on unknown channel");
        }
    }

    pub fn on_pointer(&mut self, column: u16, row: u16) {
        self.input.pointer(column, row);
    }

    pub fn on_key(&mut self, key: KeyEvent, state: ClientState) -> Command {
        if key.kind == KeyEventKind::Release {
            if let KeyCode::Char(c) = key.code {
                self.input.key_up(c);
            }
            return Command::None;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return Command::Quit;
        }

        if self.prompt.is_open() {
            match key.code {
                KeyCode::Esc => self.prompt.cancel(),
                KeyCode::Enter => {
                    if let Some(text) = self.prompt.submit() {
                        return Command::Say(text);
                    }
                }
                KeyCode::Backspace => self.prompt.backspace(),
                KeyCode::Char(c) => {
                    self.prompt.push(c);
                }
                _ => {}
            }
            return Command::None;
        }

        let KeyCode::Char(c) = key.code else {
            return match key.code {
                KeyCode::Esc => Command::Quit,
                _ => Command::None,
            };
        };
        match c.to_ascii_lowercase() {
            'l' if key.kind == KeyEventKind::Press => {
                let layout = self.input.cycle_layout();
                self.screen.layout_switched(layout);
            }
            'h' if key.kind == KeyEventKind::Press => {
                self.screen.toggle_help();
            }
            't' if state == ClientState::Streaming => {
                self.input.release_all();
                self.prompt.open();
            }
            'r' if state.is_terminal() => return Command::Reconnect,
            _ => {
                self.input.key_down(c);
            }
        }
        Command::None
    }

    /// Control sample for this tick. Drive keys are idle while typing.
    pub fn sample(&mut self) -> ControlSample {
        if self.prompt.is_open() {
            self.input.release_all();
        }
        self.input.sample()
    }

    pub fn draw(&mut self, console: &mut dyn TextConsole, status: ClientStatus) {
        self.screen.tick();
        self.screen.draw(console, status, self.prompt.text());
    }
}

// ── ClientApp ────────────────────────────────────────────────────

/// The operator client.
pub struct ClientApp {
    config: ClientConfig,
    running: Arc<AtomicBool>,
}

impl ClientApp {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Handle for stopping the loop from another task.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Connect the UDP socket to the configured server.
    pub async fn connect(&self) -> Result<UdpSocket, Fatal> {
        let address = self.config.server_address();
        let server = tokio::net::lookup_host(&address)
            .await
            .map_err(|e| Fatal::new(ExitStatus::Network, e))?
            .next()
            .ok_or_else(|| {
                Fatal::new(
                    ExitStatus::Network,
                    io::Error::new(io::ErrorKind::NotFound, format!("{address} did not resolve")),
                )
            })?;
        let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Fatal::new(ExitStatus::Socket, e))?;
        socket
            .connect(server)
            .await
            .map_err(|e| Fatal::new(ExitStatus::Socket, e))?;
        info!(%server, "contacting server");
        Ok(socket)
    }

    /// Run until the operator quits or the stop handle is cleared.
    pub async fn run(&self) -> Result<(), Fatal> {
        let socket = Arc::new(self.connect().await?);
        let config = &self.config;

        let mut player = PlayerSink::spawn(&config.video.player, &config.video.record)
            .map_err(|e| Fatal::new(ExitStatus::Picture, e))?;
        let speech = SpeechQueue::spawn(config.speech.command.clone())
            .map_err(|e| Fatal::new(ExitStatus::Audio, e))?;

        let link = Arc::new(ClientLink::new(config.limits(), config.video.buffer));
        let receiver = tokio::spawn(receive_loop(Arc::clone(&socket), Arc::clone(&link)));

        let mut screen = Screen::enter().map_err(|e| Fatal::new(ExitStatus::Picture, e))?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let input_running = Arc::clone(&self.running);
        let input = tokio::task::spawn_blocking(move || input_loop(tx, input_running));

        let mut operator = Operator::new(&config.input);
        let mut grid = ConsoleGrid::new(COLUMNS, ROWS);
        let mut ticker = Ticker::new(config.timing.rate_hz);
        let mut outcome = Ok(());

        while self.running.load(Ordering::SeqCst) {
            if let Some((from, to)) = link.poll_transition() {
                operator.on_transition(from, to);
            }

            if let Some(packet) = link.tick(operator.sample()) {
                if let Err(e) = socket.send(&packet).await {
                    trace!("send error: {e}");
                }
            }

            if let Some(unit) = link.next_access_unit() {
                if let Err(e) = player.decode(&unit) {
                    debug!("access unit dropped: {e}");
                }
            }

            for message in link.drain_messages() {
                operator.on_message(&message);
            }

            operator.draw(&mut grid, link.status());
            if let Err(e) = screen.terminal.draw(|f| f.render_widget(&grid, f.area())) {
                outcome = Err(Fatal::new(ExitStatus::Picture, e));
                break;
            }

            while let Ok(event) = rx.try_recv() {
                let command = match event {
                    UiEvent::Key(key) => operator.on_key(key, link.state()),
                    UiEvent::Pointer(column, row) => {
                        operator.on_pointer(column, row);
                        Command::None
                    }
                };
                match command {
                    Command::None => {}
                    Command::Quit => self.stop(),
                    Command::Reconnect => {
                        info!("reconnecting");
                        link.reconnect();
                    }
                    Command::Say(text) => match link.send_reliable(DRIVE_CHANNEL, text.as_bytes()) {
                        Ok(()) => speech.speak(&text),
                        Err(e) => warn!("cannot send prompt text: {e}"),
                    },
                }
            }

            ticker.wait().await;
        }

        if let Err(e) = socket.send(&ClientLink::quit_packet()).await {
            debug!("cannot send QUIT: {e}");
        }
        self.stop();
        receiver.abort();
        drop(screen);
        let _ = input.await;
        info!(
            units = player.units(),
            overruns = ticker.overruns(),
            "client stopped"
        );
        outcome
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, link: Arc<ClientLink>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        match socket.recv(&mut buf).await {
            Ok(len) => link.on_datagram(&buf[..len]),
            Err(e) => trace!("recv error: {e}"),
        }
    }
}

/// Blocking crossterm reader; exits when the app stops or the loop
/// hangs up.
fn input_loop(tx: mpsc::UnboundedSender<UiEvent>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        if !event::poll(Duration::from_millis(10)).unwrap_or(false) {
            continue;
        }
        let event = match event::read() {
            Ok(Event::Key(key)) => UiEvent::Key(key),
            Ok(Event::Mouse(mouse)) => match mouse.kind {
                MouseEventKind::Moved | MouseEventKind::Drag(_) => UiEvent::Pointer(mouse.column, mouse.row),
                _ => continue,
            },
            Ok(_) => continue,
            Err(e) => {
                debug!("terminal read error: {e}");
                continue;
            }
        };
        if tx.send(event).is_err() {
            break;
        }
    }
}

// ── Terminal ─────────────────────────────────────────────────────

/// Raw-mode alternate screen, restored on drop.
struct Screen {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    enhanced: bool,
}

impl Screen {
    fn enter() -> Result<Self, CortexError> {
        terminal::enable_raw_mode()?;
        match Self::setup() {
            Ok(screen) => Ok(screen),
            Err(e) => {
                restore(false);
                Err(e.into())
            }
        }
    }

    fn setup() -> io::Result<Self> {
        let mut stdout = io::stdout();
        crossterm::execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
        // Key release events, where the terminal supports them.
        let enhanced = terminal::supports_keyboard_enhancement().unwrap_or(false);
        if enhanced {
            crossterm::execute!(
                stdout,
                PushKeyboardEnhancementFlags(KeyboardEnhancementFlags::REPORT_EVENT_TYPES)
            )?;
        }
        info!(release_events = enhanced, "terminal ready");
        let mut terminal = Terminal::new(CrosstermBackend::new(stdout))?;
        terminal.clear()?;
        terminal.hide_cursor()?;
        Ok(Self { terminal, enhanced })
    }
}

impl Drop for Screen {
    fn drop(&mut self) {
        let _ = self.terminal.show_cursor();
        restore(self.enhanced);
    }
}

fn restore(enhanced: bool) {
    let mut stdout = io::stdout();
    if enhanced {
        let _ = crossterm::execute!(stdout, PopKeyboardEnhancementFlags);
    }
    let _ = crossterm::execute!(stdout, DisableMouseCapture, LeaveAlternateScreen);
    let _ = terminal::disable_raw_mode();
}
