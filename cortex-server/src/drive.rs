//! The `KIWI` drive plugin: turns the operator's keys and mouse into
//! strafe, move, turn and camera pitch for a holonomic chassis, and
//! shows an emoticon on its LED display.
//!
//! Keys accelerate a drive axis by [`MOV_ACC`] per tick and release
//! brakes it by [`MOV_BRK`]. Mouse X feeds a rotation integrator that
//! the turn rate works off, so a flick turns the robot by a fixed
//! amount instead of spinning it. Mouse Y moves the camera directly.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use cortex_core::{ChannelId, ControlSample, DRIVE_CHANNEL, KeyMask, MAX_TRUST_PAYLOAD};

use crate::config::DriveConfig;
use crate::plugin::{Plugin, PluginHost};
use crate::serial::SerialLink;

pub const MOV_ACC: i8 = 2;
pub const MOV_BRK: i8 = 5;

pub const ROT_DZN: i64 = 3;
pub const ROT_ACC: i8 = 6;
pub const ROT_DMP: i64 = 6;
pub const ROT_SEN: f64 = 0.5;
pub const ROT_MAX: i64 = 1000;

/// Highest camera pitch. The serial link sends `pitch * 0.3`.
pub const PITCH_MAX: i64 = 850;
/// Level camera.
pub const PITCH_REST: u32 = 550;

/// Capture device toggled by `/MIRROR`.
const MIRROR_DEVICE: usize = 1;

const UNKNOWN_COMMAND: &str = "UNKNOWN COMMAND: ";

// ── Emoticon ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Emoticon {
    #[default]
    Idle = 0,
    Connected = 1,
    Happy = 2,
    Angry = 3,
}

impl Emoticon {
    /// 8×8 three-colour bitmap, one byte per row and colour plane.
    pub const fn bitmap(self) -> &'static [u8; 24] {
        &EMOTICONS[self as usize]
    }
}

#[rustfmt::skip]
const EMOTICONS: [[u8; 24]; 4] = [
    [
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00011000, 0b00000000,
        0b00000000, 0b00011000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
    ],
    [
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00111100, 0b00111100, 0b00111100,
        0b00100100, 0b00100100, 0b00100100,
        0b00100100, 0b00100100, 0b00100100,
        0b00111100, 0b00111100, 0b00111100,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
    ],
    [
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b11100111, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b10000001, 0b00000000,
        0b00000000, 0b01000010, 0b00000000,
        0b00000000, 0b00111100, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
    ],
    [
        0b00000000, 0b00000000, 0b00000000,
        0b01000010, 0b00000000, 0b00000000,
        0b00100100, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
        0b00111100, 0b00000000, 0b00000000,
        0b01000010, 0b00000000, 0b00000000,
        0b00000000, 0b00000000, 0b00000000,
    ],
];

// ── DriveOutput ──────────────────────────────────────────────────

/// What the chassis should be doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveOutput {
    /// Strafe, negative is left.
    pub x: i8,
    /// Move, negative is forward.
    pub y: i8,
    /// Turn rate.
    pub r: i8,
    /// Camera pitch in `0..=PITCH_MAX`.
    pub pitch: u32,
    pub emoticon: Emoticon,
}

impl Default for DriveOutput {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            r: 0,
            pitch: PITCH_REST,
            emoticon: Emoticon::Idle,
        }
    }
}

// ── DriveModel ───────────────────────────────────────────────────

/// Motion state of the drive plugin.
#[derive(Debug, Clone)]
pub struct DriveModel {
    out: DriveOutput,
    integrate_r: i64,
    connected: bool,
    emoticon_timeout: u32,
    emoticon_ticks: u32,
}

impl DriveModel {
    pub fn new(emoticon_ticks: u32) -> Self {
        Self {
            out: DriveOutput::default(),
            integrate_r: 0,
            connected: false,
            emoticon_timeout: 0,
            emoticon_ticks,
        }
    }

    pub fn output(&self) -> DriveOutput {
        self.out
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
        self.out.emoticon = if connected {
            Emoticon::Connected
        } else {
            Emoticon::Idle
        };
    }

    /// Halt all motion and level the camera.
    pub fn still(&mut self) {
        self.out.x = 0;
        self.out.y = 0;
        self.out.r = 0;
        self.out.pitch = PITCH_REST;
        self.integrate_r = 0;
    }

    /// Advance one tick. Does nothing while no client is connected.
    pub fn tick(&mut self, ctrl: &ControlSample, diff: &ControlSample) {
        if !self.connected {
            return;
        }

        if self.emoticon_timeout > 0 {
            self.emoticon_timeout -= 1;
            if self.emoticon_timeout == 0 {
                self.out.emoticon = Emoticon::Connected;
            }
        }

        self.out.x = axis(self.out.x, ctrl.kb.contains(KeyMask::LEFT), ctrl.kb.contains(KeyMask::RIGHT));
        self.out.y = axis(self.out.y, ctrl.kb.contains(KeyMask::UP), ctrl.kb.contains(KeyMask::DOWN));

        // Rotation follows the integrated mouse motion it has not yet
        // turned off.
        let r = self.out.r as i64;
        self.integrate_r = (self.integrate_r as f64 - r as f64 * ROT_SEN) as i64;
        self.integrate_r += diff.mx as i64;
        self.integrate_r = self.integrate_r.clamp(-ROT_MAX, ROT_MAX);
        self.out.r = if self.integrate_r > ROT_DZN {
            let r = if r < (127 - ROT_ACC) as i64 { r + ROT_ACC as i64 } else { 127 };
            r.min(self.integrate_r / ROT_DMP + ROT_DZN) as i8
        } else if self.integrate_r < -ROT_DZN {
            let r = if r > -(127 - ROT_ACC) as i64 { r - ROT_ACC as i64 } else { -127 };
            r.max(self.integrate_r / ROT_DMP - ROT_DZN) as i8
        } else {
            0
        };

        self.out.pitch = (self.out.pitch as i64 + diff.my as i64).clamp(0, PITCH_MAX) as u32;
    }

    /// Handle operator chat. Returns the text to speak with emoticon
    /// markers blanked out.
    pub fn chat(&mut self, text: &str) -> String {
        let mut bytes = text.as_bytes().to_vec();
        for n in 0..bytes.len().saturating_sub(1) {
            if bytes[n] != b':' {
                continue;
            }
            match bytes[n + 1] {
                b')' => self.out.emoticon = Emoticon::Happy,
                b'(' => self.out.emoticon = Emoticon::Angry,
                _ => {}
            }
            if self.out.emoticon as u8 > Emoticon::Connected as u8 {
                self.emoticon_timeout = self.emoticon_ticks;
            }
            bytes[n] = b' ';
            bytes[n + 1] = b' ';
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// One drive axis: `neg`/`pos` held accelerate, release brakes to 0.
fn axis(value: i8, neg: bool, pos: bool) -> i8 {
    let mut v = value;
    if neg {
        v = if v > -(127 - MOV_ACC) { v - MOV_ACC } else { -127 };
    } else if v < 0 {
        v = if v < -MOV_BRK { v + MOV_BRK } else { 0 };
    }
    if pos {
        v = if v < 127 - MOV_ACC { v + MOV_ACC } else { 127 };
    } else if v > 0 {
        v = if v > MOV_BRK { v - MOV_BRK } else { 0 };
    }
    v
}

// ── DrivePlugin ──────────────────────────────────────────────────

pub struct DrivePlugin {
    model: DriveModel,
    device: Option<PathBuf>,
    rate_hz: u32,
    shared: Arc<Mutex<DriveOutput>>,
    link: Option<SerialLink>,
}

impl DrivePlugin {
    pub fn new(config: &DriveConfig) -> Self {
        let device = (!config.device.is_empty()).then(|| PathBuf::from(&config.device));
        Self {
            model: DriveModel::new(config.emoticon_timeout),
            device,
            rate_hz: config.rate_hz,
            shared: Arc::new(Mutex::new(DriveOutput::default())),
            link: None,
        }
    }

    pub fn model(&self) -> &DriveModel {
        &self.model
    }

    /// Latest output as seen by the serial link.
    pub fn shared(&self) -> Arc<Mutex<DriveOutput>> {
        Arc::clone(&self.shared)
    }

    fn publish(&self) {
        *self.shared.lock().unwrap_or_else(PoisonError::into_inner) = self.model.output();
    }
}

impl Plugin for DrivePlugin {
    fn channel(&self) -> ChannelId {
        DRIVE_CHANNEL
    }

    fn init(&mut self, _host: &mut PluginHost<'_>) {
        self.publish();
        match &self.device {
            Some(device) => {
                self.link = Some(SerialLink::spawn(device.clone(), self.rate_hz, self.shared()));
            }
            None => warn!("drive.device not set, serial link disabled"),
        }
    }

    fn close(&mut self) {
        if let Some(link) = self.link.take() {
            link.stop();
        }
    }

    fn still(&mut self) {
        self.model.still();
        self.publish();
    }

    fn connected(&mut self, active: bool) {
        self.model.set_connected(active);
        self.publish();
    }

    fn tick(&mut self, ctrl: &ControlSample, diff: &ControlSample) {
        self.model.tick(ctrl, diff);
        self.publish();
    }

    fn recv(&mut self, payload: &[u8], host: &mut PluginHost<'_>) {
        let text = String::from_utf8_lossy(payload);
        if text.starts_with('/') {
            info!(command = %text, "operator command");
            if text == "/MIRROR" {
                match host.toggle_device(MIRROR_DEVICE) {
                    Some(on) => debug!(device = MIRROR_DEVICE, on, "mirror toggled"),
                    None => debug!(device = MIRROR_DEVICE, "no mirror device"),
                }
            } else {
                let mut reply = format!("{UNKNOWN_COMMAND}{text}").into_bytes();
                reply.truncate(MAX_TRUST_PAYLOAD);
                host.send(&reply);
            }
        } else {
            info!(text = %text, "operator says");
            let spoken = self.model.chat(&text);
            self.publish();
            host.speak(&spoken);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Compositor, TestPattern};
    use cortex_core::{ServerCore, SessionLimits, Speech};

    fn connected() -> DriveModel {
        let mut m = DriveModel::new(100);
        m.set_connected(true);
        m
    }

    fn keys(kb: KeyMask) -> ControlSample {
        ControlSample::new(0, 0, kb)
    }

    fn mouse(mx: i32, my: i32) -> ControlSample {
        ControlSample::new(mx, my, KeyMask::empty())
    }

    #[test]
    fn keys_accelerate_and_clamp() {
        let mut m = connected();
        let none = ControlSample::default();
        m.tick(&keys(KeyMask::LEFT | KeyMask::UP), &none);
        assert_eq!((m.output().x, m.output().y), (-2, -2));
        for _ in 0..100 {
            m.tick(&keys(KeyMask::RIGHT | KeyMask::DOWN), &none);
        }
        assert_eq!((m.output().x, m.output().y), (127, 127));
    }

    #[test]
    fn release_brakes_to_zero() {
        let mut m = connected();
        let none = ControlSample::default();
        for _ in 0..6 {
            m.tick(&keys(KeyMask::RIGHT), &none);
        }
        assert_eq!(m.output().x, 12);
        m.tick(&ControlSample::default(), &none);
        assert_eq!(m.output().x, 7);
        m.tick(&ControlSample::default(), &none);
        assert_eq!(m.output().x, 2);
        m.tick(&ControlSample::default(), &none);
        assert_eq!(m.output().x, 0);
    }

    #[test]
    fn rotation_dead_zone_and_damping() {
        let mut m = connected();
        let none = ControlSample::default();
        m.tick(&none, &mouse(3, 0));
        assert_eq!(m.output().r, 0);

        let mut m = connected();
        // integrate 60: accelerate to 6, capped at 60 / 6 + 3 = 13.
        m.tick(&none, &mouse(60, 0));
        assert_eq!(m.output().r, 6);
        // integrate 60 - 3 = 57: 12, under 57 / 6 + 3 = 12.
        m.tick(&none, &mouse(0, 0));
        assert_eq!(m.output().r, 12);
        // integrate 57 - 6 = 51: capped at 51 / 6 + 3 = 11.
        m.tick(&none, &mouse(0, 0));
        assert_eq!(m.output().r, 11);

        let mut m = connected();
        m.tick(&none, &mouse(-5_000, 0));
        assert_eq!(m.output().r, -6);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut m = connected();
        let none = ControlSample::default();
        m.tick(&none, &mouse(0, 10_000));
        assert_eq!(m.output().pitch, PITCH_MAX as u32);
        m.tick(&none, &mouse(0, -10_000));
        assert_eq!(m.output().pitch, 0);
        m.tick(&none, &mouse(0, 40));
        assert_eq!(m.output().pitch, 40);
    }

    #[test]
    fn disconnected_model_ignores_input() {
        let mut m = DriveModel::new(100);
        m.tick(&keys(KeyMask::LEFT), &mouse(100, 100));
        assert_eq!(m.output(), DriveOutput::default());
    }

    #[test]
    fn still_halts_and_levels_camera() {
        let mut m = connected();
        m.tick(&keys(KeyMask::UP), &mouse(100, 7));
        m.still();
        let out = m.output();
        assert_eq!((out.x, out.y, out.r, out.pitch), (0, 0, 0, PITCH_REST));
        m.tick(&ControlSample::default(), &ControlSample::default());
        assert_eq!(m.output().r, 0);
    }

    #[test]
    fn emoticons_from_chat_time_out() {
        let mut m = DriveModel::new(2);
        m.set_connected(true);
        assert_eq!(m.output().emoticon, Emoticon::Connected);

        assert_eq!(m.chat("HI :)"), "HI   ");
        assert_eq!(m.output().emoticon, Emoticon::Happy);
        assert_eq!(m.chat(":( NO"), "   NO");
        assert_eq!(m.output().emoticon, Emoticon::Angry);

        let none = ControlSample::default();
        m.tick(&none, &none);
        assert_eq!(m.output().emoticon, Emoticon::Angry);
        m.tick(&none, &none);
        assert_eq!(m.output().emoticon, Emoticon::Connected);

        m.set_connected(false);
        assert_eq!(m.output().emoticon, Emoticon::Idle);
    }

    #[test]
    fn emoticon_bitmaps() {
        assert_eq!(Emoticon::Idle.bitmap()[10], 0b00011000);
        assert_eq!(Emoticon::Connected.bitmap()[6..9], [0b00111100u8; 3]);
        assert_eq!(Emoticon::Happy.bitmap()[4], 0b11100111);
        assert_eq!(Emoticon::Angry.bitmap()[18], 0b01000010);
    }

    #[derive(Default)]
    struct Spoken(Mutex<Vec<String>>);

    impl Speech for Spoken {
        fn speak(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    #[test]
    fn commands_and_chat() {
        let core = ServerCore::new(SessionLimits::default(), 8);
        let speech = Spoken::default();
        let mut devices = Compositor::new(4, 4);
        devices.add(Box::new(TestPattern::new(4, 4)), None, None, true);
        devices.add(Box::new(TestPattern::new(4, 4)), None, None, false);

        let mut plugin = DrivePlugin::new(&DriveConfig::default());
        let mut host = PluginHost::new(&core, &speech, &mut devices, DRIVE_CHANNEL);

        plugin.recv(b"/MIRROR", &mut host);
        assert_eq!(core.pending_reliable(), 0);

        plugin.recv(b"/DANCE", &mut host);
        assert_eq!(core.pending_reliable(), 1);

        plugin.recv(b"HELLO :)", &mut host);
        assert_eq!(speech.0.lock().unwrap().as_slice(), ["HELLO   "]);
        assert_eq!(plugin.shared().lock().unwrap().emoticon, Emoticon::Happy);

        drop(host);
        assert_eq!(devices.is_enabled(1), Some(true));
    }
}
