//! Process exit categories shared by both binaries.

use std::fmt;
use std::process::ExitCode;

use crate::error::CortexError;

/// Distinct non-zero status per fatal startup category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitStatus {
    Ok = 0,
    Network = 1,
    Socket = 2,
    Bind = 3,
    Capture = 4,
    Encoder = 5,
    Picture = 6,
    Audio = 7,
    NoSource = 8,
    Config = 9,
}

impl ExitStatus {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

impl From<ExitStatus> for ExitCode {
    fn from(status: ExitStatus) -> Self {
        ExitCode::from(status.code())
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::Network => "network",
            Self::Socket => "socket",
            Self::Bind => "bind",
            Self::Capture => "capture",
            Self::Encoder => "encoder",
            Self::Picture => "picture",
            Self::Audio => "audio",
            Self::NoSource => "no capture source",
            Self::Config => "configuration",
        };
        write!(f, "{name}")
    }
}

/// An error that ends a binary, with the exit category it maps to.
#[derive(Debug, thiserror::Error)]
#[error("{status} failure: {source}")]
pub struct Fatal {
    pub status: ExitStatus,
    #[source]
    pub source: CortexError,
}

impl Fatal {
    pub fn new(status: ExitStatus, source: impl Into<CortexError>) -> Self {
        Self {
            status,
            source: source.into(),
        }
    }
}
