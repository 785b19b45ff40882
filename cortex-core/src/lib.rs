//! # cortex-core
//!
//! Protocol library for the Cortex tele-operation link.
//!
//! This crate contains:
//! - **Wire**: `Datagram`, `CtrlHeader`, `DataHeader`, tag dispatch
//! - **Trust**: `TrustQueue`, the reliable side-channel riding on CTRL/DATA
//! - **Session**: `SessionTable`, the bounded FIFO drive queue of the server
//! - **Server**: `ServerCore`, packet handling and per-tick output
//! - **Client**: `ClientSession` state machine and the shared `ClientLink`
//! - **Control**: `ControlSample` and the per-tick `Differencer`
//! - **Ticker**: fixed-rate pacing with overrun reset
//! - **Media**: collaborator traits, `RawFrame`, Annex-B splitting, `AccessUnitQueue`
//! - **Speech**: `SpeechQueue` backed by an external TTS command
//! - **Error**: `CortexError` and process `ExitStatus` categories

pub mod annexb;
pub mod client;
pub mod control;
pub mod error;
pub mod exit;
pub mod media;
pub mod seq;
pub mod server;
pub mod session;
pub mod speech;
pub mod ticker;
pub mod trust;
pub mod video_queue;
pub mod wire;

use std::sync::{Mutex, MutexGuard, PoisonError};

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use annexb::NalSplitter;
pub use client::{ClientLimits, ClientLink, ClientSession, ClientState, ClientStatus};
pub use control::{ControlSample, Differencer, KeyMask};
pub use error::CortexError;
pub use exit::{ExitStatus, Fatal};
pub use media::{FrameSource, PixelFormat, RawFrame, Speech, TextConsole, TextStyle, VideoDecoder, VideoEncoder};
pub use seq::Seq;
pub use server::{Inbound, ServerCore};
pub use session::{ActiveControl, DisconnectReason, SessionEvent, SessionLimits, SessionTable, SlotId};
pub use speech::SpeechQueue;
pub use ticker::{Pace, Ticker};
pub use trust::{ChannelId, DRIVE_CHANNEL, MAX_TRUST_PAYLOAD, TrustMessage, TrustQueue};
pub use video_queue::AccessUnitQueue;
pub use wire::{CtrlHeader, DEFAULT_PORT, DataHeader, Datagram, PROTOCOL_VERSION, Tag};

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
