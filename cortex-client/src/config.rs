//! Operator client configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use cortex_core::wire::DEFAULT_PORT;
use cortex_core::ClientLimits;

use crate::input::Layout;

/// Top-level configuration for the operator client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Keyboard and mouse.
    pub input: InputConfig,
    /// Video playback.
    pub video: VideoConfig,
    /// Local speech of prompt text.
    pub speech: SpeechConfig,
    /// Protocol timing, in client ticks.
    pub timing: TimingConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Server host name or address.
    pub server: String,
    /// Server UDP port.
    pub port: u16,
}

/// Input settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Starting keyboard layout.
    pub layout: Layout,
    /// Ticks a drive key stays down after a press, for terminals that
    /// never report key release.
    pub key_hold_ticks: u32,
    /// Mouse units per terminal cell moved.
    pub mouse_scale: i32,
}

/// Video settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    /// Player reading an H.264 elementary stream on stdin. Empty
    /// discards the video.
    pub player: Vec<String>,
    /// Append the received stream to this file. Empty disables.
    pub record: String,
    /// Access units buffered before the oldest is dropped.
    pub buffer: usize,
}

/// Speech settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// TTS command; the text is appended as the last argument.
    pub command: Vec<String>,
}

/// Protocol timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Client ticks per second.
    pub rate_hz: u32,
    /// Unanswered HELO/TIME probes before giving up.
    pub max_retry: u32,
    /// Ticks between probes.
    pub probe_interval: u32,
    /// Ticks without video while streaming before the link is lost.
    pub video_timeout: u32,
    /// Reliable-message retransmit interval.
    pub trust: u32,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level.
    pub level: String,
    /// Log file; the terminal is busy with the console.
    pub file: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            input: InputConfig::default(),
            video: VideoConfig::default(),
            speech: SpeechConfig::default(),
            timing: TimingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            layout: Layout::Qwerty,
            key_hold_ticks: 12,
            mouse_scale: 8,
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        let player = [
            "ffplay", "-loglevel", "error", "-fflags", "nobuffer", "-flags", "low_delay",
            "-framedrop", "-f", "h264", "-window_title", "cortex", "-",
        ];
        Self {
            player: player.iter().map(|s| s.to_string()).collect(),
            record: String::new(),
            buffer: 64,
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            command: vec!["espeak".into()],
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        let limits = ClientLimits::default();
        Self {
            rate_hz: 50,
            max_retry: limits.max_retry,
            probe_interval: limits.probe_interval,
            video_timeout: limits.video_timeout,
            trust: limits.trust_retransmit,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: "cortex-client.log".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ClientConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write default config to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Protocol parameters for the session.
    pub fn limits(&self) -> ClientLimits {
        ClientLimits {
            max_retry: self.timing.max_retry,
            probe_interval: self.timing.probe_interval,
            video_timeout: self.timing.video_timeout,
            trust_retransmit: self.timing.trust,
            ..ClientLimits::default()
        }
    }

    /// `host:port` of the server.
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.network.server, self.network.port)
    }
}

// ── Tests ────────────────────────────────────────────────────────
