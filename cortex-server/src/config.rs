//! Configuration for the Cortex server.

use std::path::Path;

use serde::{Deserialize, Serialize};

use cortex_core::{CortexError, SessionLimits};
use cortex_core::wire::DEFAULT_PORT;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Network settings.
    pub network: NetworkConfig,
    /// Outgoing video stream.
    pub stream: StreamConfig,
    /// Drive queue.
    pub queue: QueueConfig,
    /// Liveness and retransmit intervals, in ticks.
    pub timeouts: TimeoutConfig,
    /// External H.264 encoder.
    pub encoder: EncoderConfig,
    /// Drive plugin and its serial link.
    pub drive: DriveConfig,
    /// Text-to-speech.
    pub speech: SpeechConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
    /// Capture devices composited into the stream, in z-order.
    pub devices: Vec<DeviceConfig>,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP port to bind.
    pub port: u16,
}

/// Video stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    /// Server tick rate; one frame per tick.
    pub fps: u32,
    /// Append the H.264 stream to this file. Empty disables recording.
    pub record: String,
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Session slots. 0 selects direct mode (latest HELO drives, no turns).
    pub capacity: usize,
}

/// Timeouts, all in server ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Silence before a client is dropped.
    pub connection: u32,
    /// Length of one drive turn.
    pub control: u32,
    /// Reliable-message retransmit interval.
    pub trust: u32,
    /// Held-key grace without fresh control input.
    pub glitch: u32,
}

/// External encoder configuration.
///
/// `{width}`, `{height}`, `{fps}` and `{pix_fmt}` in the arguments are
/// replaced with the stream parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub command: Vec<String>,
    /// Restart the encoder when a keyframe is needed (new active client).
    pub restart_on_refresh: bool,
}

/// Drive plugin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Serial device of the chassis controller. Empty disables the link.
    pub device: String,
    /// Ticks an emoticon stays on the display.
    pub emoticon_timeout: u32,
    /// Serial frames per second.
    pub rate_hz: u32,
}

/// Speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeechConfig {
    /// TTS command; the text is appended as the last argument.
    pub command: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

/// Source of a capture device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Built-in moving test pattern.
    Pattern,
    /// Raw BGR frames read from a command's stdout.
    Command,
}

/// Rectangle in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// One capture device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub source: SourceKind,
    /// Command line for `source = "command"`.
    pub command: Vec<String>,
    /// Capture size.
    pub width: u32,
    pub height: u32,
    /// Region of the capture to use. Defaults to the whole capture.
    pub src: Option<Rect>,
    /// Placement in the stream. Defaults to the whole stream.
    pub dst: Option<Rect>,
    pub enabled: bool,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            stream: StreamConfig::default(),
            queue: QueueConfig::default(),
            timeouts: TimeoutConfig::default(),
            encoder: EncoderConfig::default(),
            drive: DriveConfig::default(),
            speech: SpeechConfig::default(),
            logging: LoggingConfig::default(),
            devices: vec![DeviceConfig::default()],
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 25,
            record: String::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 10 }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        let limits = SessionLimits::default();
        Self {
            connection: limits.connection_timeout,
            control: limits.control_timeout,
            trust: cortex_core::trust::SERVER_RETRANSMIT_TICKS,
            glitch: limits.glitch_timeout,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        let args = [
            "ffmpeg", "-loglevel", "error",
            "-f", "rawvideo", "-pix_fmt", "{pix_fmt}", "-s", "{width}x{height}", "-r", "{fps}",
            "-i", "-",
            "-c:v", "libx264", "-preset", "ultrafast", "-tune", "zerolatency",
            "-g", "{fps}", "-bsf:v", "h264_mp4toannexb",
            "-f", "h264", "-",
        ];
        Self {
            command: args.iter().map(|s| s.to_string()).collect(),
            restart_on_refresh: false,
        }
    }
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            emoticon_timeout: 100,
            rate_hz: 50,
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

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            source: SourceKind::Pattern,
            command: Vec::new(),
            width: 320,
            height: 240,
            src: None,
            dst: None,
            enabled: true,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
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

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Check values the server cannot run with.
    pub fn validate(&self) -> Result<(), CortexError> {
        if self.stream.width == 0 || self.stream.height == 0 {
            return Err(CortexError::Config("stream size must be non-zero".into()));
        }
        if self.stream.width % 2 != 0 || self.stream.height % 2 != 0 {
            return Err(CortexError::Config("stream size must be even".into()));
        }
        if self.stream.fps == 0 {
            return Err(CortexError::Config("stream.fps must be at least 1".into()));
        }
        if self.timeouts.connection == 0 || self.timeouts.control == 0 {
            return Err(CortexError::Config("timeouts must be at least 1 tick".into()));
        }
        if self.encoder.command.is_empty() {
            return Err(CortexError::Config("encoder.command is empty".into()));
        }
        for (n, device) in self.devices.iter().enumerate() {
            if device.width == 0 || device.height == 0 {
                return Err(CortexError::Config(format!("device {n}: capture size must be non-zero")));
            }
            if device.source == SourceKind::Command && device.command.is_empty() {
                return Err(CortexError::Config(format!("device {n}: command source without a command")));
            }
        }
        Ok(())
    }

    /// Session-table parameters.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            capacity: self.queue.capacity,
            connection_timeout: self.timeouts.connection,
            control_timeout: self.timeouts.control,
            glitch_timeout: self.timeouts.glitch,
        }
    }

    /// Encoder command line with the stream parameters filled in.
    pub fn encoder_command(&self, pix_fmt: &str) -> Vec<String> {
        self.encoder
            .command
            .iter()
            .map(|arg| {
                arg.replace("{width}", &self.stream.width.to_string())
                    .replace("{height}", &self.stream.height.to_string())
                    .replace("{fps}", &self.stream.fps.to_string())
                    .replace("{pix_fmt}", pix_fmt)
            })
            .collect()
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("port"));
        assert!(text.contains("[[devices]]"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ServerConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ServerConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 6979);
        assert_eq!(parsed.stream.fps, 25);
        assert_eq!(parsed.timeouts.control, 7_500);
        assert_eq!(parsed.devices.len(), 1);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: ServerConfig = toml::from_str(
            "[queue]\ncapacity = 0\n\n[[devices]]\nsource = \"command\"\ncommand = [\"cat\"]\ndst = { x = 0, y = 0, w = 160, h = 120 }\n",
        )
        .unwrap();
        assert!(parsed.session_limits().is_direct());
        assert_eq!(parsed.timeouts.glitch, 2);
        assert_eq!(parsed.devices[0].source, SourceKind::Command);
        assert_eq!(parsed.devices[0].width, 320);
        assert_eq!(parsed.devices[0].dst.map(|r| r.w), Some(160));
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut cfg = ServerConfig::default();
        cfg.stream.fps = 0;
        assert!(matches!(cfg.validate(), Err(CortexError::Config(_))));

        let mut cfg = ServerConfig::default();
        cfg.devices[0].source = SourceKind::Command;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("device 0"));
    }

    #[test]
    fn encoder_placeholders() {
        let cfg = ServerConfig::default();
        let cmd = cfg.encoder_command("bgr24");
        assert!(cmd.contains(&"320x240".to_string()));
        assert!(cmd.contains(&"bgr24".to_string()));
        assert_eq!(cmd[0], "ffmpeg");
    }
}
