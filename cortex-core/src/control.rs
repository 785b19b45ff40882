//! Operator control samples and the per-tick differencer.
//!
//! The client sends absolute accumulations of mouse motion and the
//! current held-key level every tick. The server turns consecutive
//! samples into deltas (and key edges) before handing them to plugins.

use bitflags::bitflags;

bitflags! {
    /// Direction keys held by the operator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyMask: u8 {
        const LEFT  = 0b0000_0001;
        const RIGHT = 0b0000_0010;
        const UP    = 0b0000_0100;
        const DOWN  = 0b0000_1000;
    }
}

/// One absolute control sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlSample {
    pub mx: i32,
    pub my: i32,
    pub kb: KeyMask,
}

impl ControlSample {
    pub const fn new(mx: i32, my: i32, kb: KeyMask) -> Self {
        Self { mx, my, kb }
    }

    /// Motion since `previous`; keys become the XOR edge mask.
    pub fn delta(&self, previous: &ControlSample) -> ControlSample {
        ControlSample {
            mx: self.mx.wrapping_sub(previous.mx),
            my: self.my.wrapping_sub(previous.my),
            kb: self.kb ^ previous.kb,
        }
    }
}

// ── Differencer ──────────────────────────────────────────────────

/// Turns the latest received sample into a per-tick delta.
#[derive(Debug, Clone, Default)]
pub struct Differencer {
    got_first: bool,
    ctrl: ControlSample,
    last: ControlSample,
}

impl Differencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly received sample. The first one also seeds the
    /// baseline so the operator's accumulated offset is not replayed.
    pub fn observe(&mut self, sample: ControlSample) {
        self.ctrl = sample;
        if !self.got_first {
            self.last = sample;
            self.got_first = true;
        }
    }

    /// Release every held key (control grace period expired).
    pub fn release_keys(&mut self) {
        self.ctrl.kb = KeyMask::empty();
    }

    /// Advance one tick: compute `ctrl - last` and move the baseline.
    pub fn step(&mut self) -> ControlSample {
        let diff = self.ctrl.delta(&self.last);
        self.last = self.ctrl;
        diff
    }

    /// Latest absolute sample (key level signal).
    pub fn current(&self) -> ControlSample {
        self.ctrl
    }
}
