//! Mod-256 sequence counters for the reliable side-channel.

use std::fmt;
use std::num::Wrapping;

/// An 8-bit sequence number that wraps from `0xFF` to `0x00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Seq(Wrapping<u8>);

impl Seq {
    /// Last-accepted marker used before any message was received.
    pub const BEFORE_FIRST: Seq = Seq(Wrapping(0xFF));

    pub const fn new(value: u8) -> Self {
        Self(Wrapping(value))
    }

    pub const fn value(self) -> u8 {
        self.0.0
    }

    /// The sequence number that follows this one.
    pub fn succ(self) -> Self {
        Self(self.0 + Wrapping(1))
    }

    pub fn advance(&mut self) {
        *self = self.succ();
    }
}

impl From<u8> for Seq {
    fn from(value: u8) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.value())
    }
}
