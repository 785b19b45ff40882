//! Server plugins: sub-channels of the reliable side-channel that turn
//! control input into actuation.
//!
//! Every plugin owns one [`ChannelId`]. Reliable messages from the
//! active client carrying that id are routed to its `recv` hook, and
//! its replies travel back on the same id.

use tracing::{debug, trace, warn};

use cortex_core::{ChannelId, ControlSample, RawFrame, ServerCore, Speech, TrustMessage};

use crate::capture::Compositor;

/// Services a plugin may use from its hooks.
pub struct PluginHost<'a> {
    core: &'a ServerCore,
    speech: &'a dyn Speech,
    devices: &'a mut Compositor,
    channel: ChannelId,
}

impl<'a> PluginHost<'a> {
    pub fn new(core: &'a ServerCore, speech: &'a dyn Speech, devices: &'a mut Compositor, channel: ChannelId) -> Self {
        Self {
            core,
            speech,
            devices,
            channel,
        }
    }

    /// Reliable message to the active client on this plugin's channel.
    pub fn send(&self, payload: &[u8]) {
        if let Err(e) = self.core.send_reliable(self.channel, payload) {
            warn!(channel = %self.channel, "dropping reply: {e}");
        }
    }

    pub fn speak(&self, text: &str) {
        self.speech.speak(text);
    }

    /// Flip a capture device on or off.
    pub fn toggle_device(&mut self, device: usize) -> Option<bool> {
        self.devices.toggle(device)
    }
}

/// Hooks called from the tick loop. All default to doing nothing.
pub trait Plugin: Send {
    /// Sub-channel identifier; must match the client side.
    fn channel(&self) -> ChannelId;

    /// Called once before the first tick.
    fn init(&mut self, _host: &mut PluginHost<'_>) {}

    /// Called at shutdown.
    fn close(&mut self) {}

    /// No active client this tick: stop moving.
    fn still(&mut self) {}

    /// An active client took or gave up the controls.
    fn connected(&mut self, _active: bool) {}

    /// A raw capture from `device`, before compositing.
    fn capture(&mut self, _device: usize, _frame: &RawFrame) {}

    /// Control input of the active client for this tick.
    fn tick(&mut self, _ctrl: &ControlSample, _diff: &ControlSample) {}

    /// A reliable message from the active client.
    fn recv(&mut self, _payload: &[u8], _host: &mut PluginHost<'_>) {}
}

/// The loaded plugins, in load order.
#[derive(Default)]
pub struct PluginSet {
    plugins: Vec<Box<dyn Plugin>>,
}

impl PluginSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, plugin: Box<dyn Plugin>) {
        debug!(channel = %plugin.channel(), "plugin loaded");
        self.plugins.push(plugin);
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn init(&mut self, core: &ServerCore, speech: &dyn Speech, devices: &mut Compositor) {
        for plugin in &mut self.plugins {
            let mut host = PluginHost::new(core, speech, devices, plugin.channel());
            plugin.init(&mut host);
        }
    }

    pub fn close(&mut self) {
        self.plugins.iter_mut().for_each(|p| p.close());
    }

    pub fn still(&mut self) {
        self.plugins.iter_mut().for_each(|p| p.still());
    }

    pub fn connected(&mut self, active: bool) {
        self.plugins.iter_mut().for_each(|p| p.connected(active));
    }

    pub fn capture(&mut self, device: usize, frame: &RawFrame) {
        self.plugins.iter_mut().for_each(|p| p.capture(device, frame));
    }

    pub fn tick(&mut self, ctrl: &ControlSample, diff: &ControlSample) {
        self.plugins.iter_mut().for_each(|p| p.tick(ctrl, diff));
    }

    /// Route a message to the plugin owning its channel. Returns
    /// whether one did.
    pub fn route(&mut self, message: &TrustMessage, core: &ServerCore, speech: &dyn Speech, devices: &mut Compositor) -> bool {
        let Some(plugin) = self
            .plugins
            .iter_mut()
            .find(|p| p.channel() == message.channel)
        else {
            trace!(channel = %message.channel, "no plugin for channel, dropping");
            return false;
        };
        let mut host = PluginHost::new(core, speech, devices, message.channel);
        plugin.recv(&message.payload, &mut host);
        true
    }
}
