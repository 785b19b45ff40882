//! Domain-specific error types for the Cortex link.
//!
//! All fallible core operations return `Result<T, CortexError>`.
//! Malformed datagrams never surface here: the dispatcher drops them.

use thiserror::Error;

/// The canonical error type for the Cortex link.
#[derive(Debug, Error)]
pub enum CortexError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// The server speaks a different protocol revision.
    #[error("protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u8, remote: u8 },

    // ── Payload Errors ───────────────────────────────────────────
    /// A reliable message is larger than one trust frame can carry.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Every session slot is taken.
    #[error("session table full ({capacity} slots)")]
    QueueFull { capacity: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The socket or pipe layer reported an error.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    // ── Collaborator Errors ──────────────────────────────────────
    /// A frame source could not deliver a frame.
    #[error("capture error: {0}")]
    Capture(String),

    /// The video encoder failed or exited.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// The video decoder or player rejected an access unit.
    #[error("decoder error: {0}")]
    Decoder(String),

    /// The speech task could not be started.
    #[error("speech error: {0}")]
    Speech(String),

    // ── Application Errors ───────────────────────────────────────
    /// A configuration value is unusable.
    #[error("configuration error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CortexError::PayloadTooLarge {
            size: 300,
            max: 251,
        };
        assert!(e.to_string().contains("300"));
        assert!(e.to_string().contains("251"));

        let e = CortexError::VersionMismatch {
            local: 2,
            remote: 1,
        };
        assert!(e.to_string().contains("mismatch"));
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "port taken");
        let e: CortexError = io_err.into();
        assert!(matches!(e, CortexError::Io(_)));
    }
}
