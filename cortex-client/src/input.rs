//! Local input → control sample conversion.
//!
//! Drive keys follow the selected [`Layout`]. Terminals that report
//! key release (kitty keyboard protocol) give exact key levels; on the
//! others a press holds the key for a fixed number of ticks and
//! auto-repeat keeps it down.

use std::fmt;

use serde::{Deserialize, Serialize};

use cortex_core::{ControlSample, KeyMask};

/// Longest prompt text.
pub const MAX_PROMPT: usize = 37;

// ── Layout ───────────────────────────────────────────────────────

/// Keyboard layout for the drive keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    /// WASD.
    #[default]
    Qwerty,
    /// ,AOE.
    Dvorak,
    /// ZQSD.
    Azerty,
}

impl Layout {
    /// Keys for left, right, up and down.
    pub const fn keys(self) -> [char; 4] {
        match self {
            Self::Qwerty => ['a', 'd', 'w', 's'],
            Self::Dvorak => ['a', 'e', ',', 'o'],
            Self::Azerty => ['q', 'd', 'z', 's'],
        }
    }

    pub const fn next(self) -> Self {
        match self {
            Self::Qwerty => Self::Dvorak,
            Self::Dvorak => Self::Azerty,
            Self::Azerty => Self::Qwerty,
        }
    }

    /// Drive direction bound to `key`, if any.
    pub fn direction(self, key: char) -> Option<KeyMask> {
        const DIRECTIONS: [KeyMask; 4] = [KeyMask::LEFT, KeyMask::RIGHT, KeyMask::UP, KeyMask::DOWN];
        let key = key.to_ascii_lowercase();
        self.keys()
            .iter()
            .position(|&k| k == key)
            .map(|n| DIRECTIONS[n])
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Qwerty => write!(f, "QWERTY"),
            Self::Dvorak => write!(f, "DVORAK"),
            Self::Azerty => write!(f, "AZERTY"),
        }
    }
}

// ── ControlInput ─────────────────────────────────────────────────

/// Accumulates keyboard and mouse input into control samples.
#[derive(Debug, Clone)]
pub struct ControlInput {
    layout: Layout,
    hold_ticks: u32,
    mouse_scale: i32,
    /// Ticks each direction stays held, indexed by mask bit.
    held: [u32; 4],
    /// A release event has been seen, so key levels are exact.
    exact: bool,
    mx: i32,
    my: i32,
    last_pointer: Option<(u16, u16)>,
}

impl ControlInput {
    pub fn new(layout: Layout, hold_ticks: u32, mouse_scale: i32) -> Self {
        Self {
            layout,
            hold_ticks: hold_ticks.max(1),
            mouse_scale,
            held: [0; 4],
            exact: false,
            mx: 0,
            my: 0,
            last_pointer: None,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Switch to the next layout and return it.
    pub fn cycle_layout(&mut self) -> Layout {
        self.layout = self.layout.next();
        self.release_all();
        self.layout
    }

    /// A key went down (or repeated). Returns whether it is a drive key.
    pub fn key_down(&mut self, key: char) -> bool {
        let Some(dir) = self.layout.direction(key) else {
            return false;
        };
        self.held[bit(dir)] = if self.exact { u32::MAX } else { self.hold_ticks };
        true
    }

    /// A key went up. Only terminals with release reporting call this.
    pub fn key_up(&mut self, key: char) -> bool {
        let Some(dir) = self.layout.direction(key) else {
            return false;
        };
        if !self.exact {
            self.exact = true;
            for h in &mut self.held {
                if *h > 0 {
                    *h = u32::MAX;
                }
            }
        }
        self.held[bit(dir)] = 0;
        true
    }

    /// Pointer moved to a terminal cell.
    pub fn pointer(&mut self, column: u16, row: u16) {
        if let Some((c, r)) = self.last_pointer {
            self.mx = self.mx.wrapping_add((column as i32 - c as i32) * self.mouse_scale);
            self.my = self.my.wrapping_add((row as i32 - r as i32) * self.mouse_scale);
        }
        self.last_pointer = Some((column, row));
    }

    pub fn keys(&self) -> KeyMask {
        let mut mask = KeyMask::empty();
        for (n, &h) in self.held.iter().enumerate() {
            if h > 0 {
                mask |= KeyMask::from_bits_truncate(1 << n);
            }
        }
        mask
    }

    /// Sample for this tick, then age held keys.
    pub fn sample(&mut self) -> ControlSample {
        let sample = ControlSample::new(self.mx, self.my, self.keys());
        if !self.exact {
            for h in &mut self.held {
                *h = h.saturating_sub(1);
            }
        }
        sample
    }

    pub fn release_all(&mut self) {
        self.held = [0; 4];
    }
}

fn bit(dir: KeyMask) -> usize {
    dir.bits().trailing_zeros() as usize
}

// ── Prompt ───────────────────────────────────────────────────────

/// Single-line text prompt for operator speech and commands.
#[derive(Debug, Clone, Default)]
pub struct Prompt {
    text: Option<String>,
}

impl Prompt {
    pub fn open(&mut self) {
        self.text = Some(String::new());
    }

    pub fn cancel(&mut self) {
        self.text = None;
    }

    pub fn is_open(&self) -> bool {
        self.text.is_some()
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Append a character. Letters are upper-cased; anything outside
    /// printable ASCII is refused.
    pub fn push(&mut self, c: char) -> bool {
        let Some(text) = self.text.as_mut() else {
            return false;
        };
        if !(c.is_ascii_graphic() || c == ' ') || text.len() >= MAX_PROMPT {
            return false;
        }
        text.push(c.to_ascii_uppercase());
        true
    }

    pub fn backspace(&mut self) {
        if let Some(text) = self.text.as_mut() {
            text.pop();
        }
    }

    /// Close the prompt. Returns the text unless it was empty.
    pub fn submit(&mut self) -> Option<String> {
        self.text.take().filter(|t| !t.is_empty())
    }
}
