//! Text console: a fixed character grid the status screen is drawn on,
//! rendered to the terminal with ratatui.

use ratatui::{
    buffer::Buffer,
    layout::Rect,
    style::{Color, Modifier, Style},
    widgets::Widget,
};

use cortex_core::{ClientState, ClientStatus, TextConsole, TextStyle};

use crate::input::Layout;

pub const COLUMNS: u16 = 40;
pub const ROWS: u16 = 30;

/// Server ticks per second, the unit of queue and turn times.
pub const SERVER_TICKS_PER_SECOND: u32 = 25;

/// Client ticks a console message stays up.
pub const MESSAGE_TICKS: u32 = 125;

const HELP: [&str; 6] = [
    "CONTROLS: WASD + MOUSE",
    "L: TOGGLE QWERTY, DVORAK, AZERTY",
    "H: SHOW/HIDE HELP",
    "T: OPEN SPEECH/COMMAND PROMPT",
    "R: RECONNECT AFTER AN ERROR",
    "ESCAPE: QUIT",
];

// ── Time formats ─────────────────────────────────────────────────

/// Queue wait as `HH:MM:SS`.
pub fn format_queue_time(ticks: u32) -> String {
    let secs = ticks / SERVER_TICKS_PER_SECOND;
    format!("{:02}:{:02}:{:02}", (secs / 3600) % 100, (secs / 60) % 60, secs % 60)
}

/// Remaining turn as `TIME LEFT: MM:SS`.
pub fn format_turn_time(ticks: u32) -> String {
    let secs = ticks / SERVER_TICKS_PER_SECOND;
    format!("TIME LEFT: {:02}:{:02}", (secs / 60) % 60, secs % 60)
}

/// Banner for a state other than Streaming, and whether it is an alert.
pub fn state_banner(state: ClientState) -> (&'static str, TextStyle) {
    match state {
        ClientState::Connecting => ("CONTACTING ROBOT...", TextStyle::Normal),
        ClientState::Queued => ("QUEUED FOR CONTROL", TextStyle::Normal),
        ClientState::Streaming => ("IN CONTROL - PRESS H FOR HELP", TextStyle::Normal),
        ClientState::Error => ("CONNECTION ERROR", TextStyle::Alert),
        ClientState::Full => ("QUEUE IS FULL, SORRY", TextStyle::Alert),
        ClientState::Lost => ("CONNECTION IS LOST", TextStyle::Alert),
        ClientState::VersionMismatch => ("WRONG CLIENT VERSION", TextStyle::Alert),
    }
}

// ── ConsoleGrid ──────────────────────────────────────────────────

/// Character grid implementing [`TextConsole`].
#[derive(Debug, Clone)]
pub struct ConsoleGrid {
    width: u16,
    height: u16,
    cells: Vec<(char, TextStyle)>,
}

impl ConsoleGrid {
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            cells: vec![(' ', TextStyle::Normal); width as usize * height as usize],
        }
    }

    pub fn clear_all(&mut self) {
        self.cells.fill((' ', TextStyle::Normal));
    }

    /// Row `y` as text, trailing blanks removed.
    pub fn line(&self, y: u16) -> String {
        if y >= self.height {
            return String::new();
        }
        let start = y as usize * self.width as usize;
        let row: String = self.cells[start..start + self.width as usize]
            .iter()
            .map(|(c, _)| *c)
            .collect();
        row.trim_end().to_string()
    }

    pub fn style_at(&self, x: u16, y: u16) -> Option<TextStyle> {
        (x < self.width && y < self.height).then(|| self.cells[y as usize * self.width as usize + x as usize].1)
    }

    fn set(&mut self, x: u16, y: u16, c: char, style: TextStyle) {
        if x < self.width && y < self.height {
            self.cells[y as usize * self.width as usize + x as usize] = (c, style);
        }
    }
}

impl TextConsole for ConsoleGrid {
    fn write(&mut self, x: u16, y: u16, text: &str, style: TextStyle) {
        for (n, c) in text.chars().enumerate() {
            let Ok(n) = u16::try_from(n) else { break };
            self.set(x.saturating_add(n), y, c, style);
        }
    }

    fn clear(&mut self, x: u16, y: u16, count: u16) {
        for n in 0..count {
            self.set(x.saturating_add(n), y, ' ', TextStyle::Normal);
        }
    }
}

fn cell_style(style: TextStyle) -> Style {
    match style {
        TextStyle::Normal => Style::default().fg(Color::Green),
        TextStyle::Alert => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    }
}

impl Widget for &ConsoleGrid {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let mut utf8 = [0u8; 4];
        for y in 0..self.height.min(area.height) {
            for x in 0..self.width.min(area.width) {
                let (c, style) = self.cells[y as usize * self.width as usize + x as usize];
                buf.set_string(area.x + x, area.y + y, c.encode_utf8(&mut utf8), cell_style(style));
            }
        }
    }
}

// ── StatusScreen ─────────────────────────────────────────────────

/// Everything the operator sees besides the video.
#[derive(Debug, Clone, Default)]
pub struct StatusScreen {
    help: bool,
    message: Option<(String, u32)>,
}

impl StatusScreen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle_help(&mut self) -> bool {
        self.help = !self.help;
        self.help
    }

    pub fn help_visible(&self) -> bool {
        self.help
    }

    /// Show a one-line message for a while.
    pub fn message(&mut self, text: impl Into<String>) {
        self.message = Some((text.into(), MESSAGE_TICKS));
    }

    pub fn current_message(&self) -> Option<&str> {
        self.message.as_ref().map(|(t, _)| t.as_str())
    }

    pub fn layout_switched(&mut self, layout: Layout) {
        self.message(format!("SWITCHED TO {layout}"));
    }

    /// Age the message by one tick.
    pub fn tick(&mut self) {
        if let Some((_, ticks)) = self.message.as_mut() {
            *ticks = ticks.saturating_sub(1);
            if *ticks == 0 {
                self.message = None;
            }
        }
    }

    /// Redraw the whole screen.
    pub fn draw(&self, console: &mut dyn TextConsole, status: ClientStatus, prompt: Option<&str>) {
        for y in 0..ROWS {
            console.clear(0, y, COLUMNS);
        }

        let (banner, style) = state_banner(status.state);
        if status.state == ClientState::Streaming {
            console.write(1, 1, banner, style);
            console.write(1, 2, &format_turn_time(status.turn_timer), TextStyle::Normal);
        } else {
            console.write(centre(banner), 24, banner, style);
            if status.state == ClientState::Queued {
                let wait = format_queue_time(status.queue_time);
                console.write(centre(&wait), 25, &wait, TextStyle::Normal);
            }
            let hint = "PRESS H FOR HELP";
            console.write(centre(hint), 26, hint, TextStyle::Normal);
        }

        if self.help {
            for (n, line) in HELP.iter().enumerate() {
                console.write(4, 11 + n as u16, line, TextStyle::Normal);
            }
        }
        if let Some((text, _)) = &self.message {
            console.write(1, 27, text, TextStyle::Alert);
        }
        if let Some(text) = prompt {
            console.write(1, 28, ">", TextStyle::Normal);
            console.write(2, 28, text, TextStyle::Normal);
        }
    }
}

fn centre(text: &str) -> u16 {
    COLUMNS.saturating_sub(text.len() as u16) / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(state: ClientState, queue_time: u32, turn_timer: u32) -> ClientStatus {
        ClientStatus {
            state,
            queue_time,
            turn_timer,
        }
    }

    #[test]
    fn time_formats() {
        assert_eq!(format_queue_time(0), "00:00:00");
        assert_eq!(format_queue_time(7_500), "00:05:00");
        assert_eq!(format_queue_time(25 * 3_661), "01:01:01");
        assert_eq!(format_turn_time(7_500), "TIME LEFT: 05:00");
        assert_eq!(format_turn_time(24), "TIME LEFT: 00:00");
        assert_eq!(format_turn_time(25 * 59), "TIME LEFT: 00:59");
    }

    #[test]
    fn grid_write_and_clear() {
        let mut grid = ConsoleGrid::new(10, 2);
        grid.write(2, 0, "HELLO WORLD", TextStyle::Alert);
        assert_eq!(grid.line(0), "  HELLO WO");
        assert_eq!(grid.style_at(2, 0), Some(TextStyle::Alert));
        grid.clear(2, 0, 3);
        assert_eq!(grid.line(0), "     LO WO");
        grid.write(0, 5, "OFF", TextStyle::Normal);
        assert_eq!(grid.line(1), "");
    }

    #[test]
    fn queued_screen_shows_wait() {
        let mut grid = ConsoleGrid::new(COLUMNS, ROWS);
        let screen = StatusScreen::new();
        screen.draw(&mut grid, status(ClientState::Queued, 7_500, 0), None);
        assert_eq!(grid.line(24).trim(), "QUEUED FOR CONTROL");
        assert_eq!(grid.line(25).trim(), "00:05:00");
    }

    #[test]
    fn streaming_screen_with_prompt_and_help() {
        let mut grid = ConsoleGrid::new(COLUMNS, ROWS);
        let mut screen = StatusScreen::new();
        screen.toggle_help();
        screen.layout_switched(Layout::Azerty);
        screen.draw(&mut grid, status(ClientState::Streaming, 0, 250), Some("HI"));
        assert_eq!(grid.line(1), " IN CONTROL - PRESS H FOR HELP");
        assert_eq!(grid.line(2), " TIME LEFT: 00:10");
        assert_eq!(grid.line(11).trim(), "CONTROLS: WASD + MOUSE");
        assert_eq!(grid.line(27), " SWITCHED TO AZERTY");
        assert_eq!(grid.line(28), " >HI");
    }

    #[test]
    fn errors_are_alerts_and_messages_expire() {
        let mut grid = ConsoleGrid::new(COLUMNS, ROWS);
        let mut screen = StatusScreen::new();
        screen.draw(&mut grid, status(ClientState::Full, 0, 0), None);
        let x = centre("QUEUE IS FULL, SORRY");
        assert_eq!(grid.style_at(x, 24), Some(TextStyle::Alert));

        screen.message("UNKNOWN COMMAND: /DANCE");
        for _ in 0..MESSAGE_TICKS {
            screen.tick();
        }
        assert_eq!(screen.current_message(), None);
    }

    #[test]
    fn grid_renders_into_a_buffer() {
        let mut grid = ConsoleGrid::new(4, 1);
        grid.write(0, 0, "OK", TextStyle::Normal);
        let area = Rect::new(0, 0, 4, 1);
        let mut buf = Buffer::empty(area);
        (&grid).render(area, &mut buf);
        assert_eq!(buf[(0, 0)].symbol(), "O");
        assert_eq!(buf[(1, 0)].symbol(), "K");
    }
}
