//! Serial link to the chassis controller.
//!
//! A background task writes the latest [`DriveOutput`] as a drive
//! frame about 50 times a second, plus a display frame whenever the
//! emoticon changes. The port's line settings (115200 8N1) are expected
//! to be configured outside the server, for example with `stty`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use cortex_core::Ticker;

use crate::drive::{DriveOutput, Emoticon};

const SYNC: u8 = 0xFF;
const CMD_DRIVE: u8 = 0x00;
const CMD_DISPLAY: u8 = 0x33;
/// Motor step size, 1:2^6.
const STEP_SIZE: u8 = 6;

/// Wait before reopening a failed port.
pub const REOPEN_DELAY: Duration = Duration::from_secs(5);

pub const DRIVE_FRAME_LEN: usize = 7;
pub const DISPLAY_FRAME_LEN: usize = 27;

/// `FF 00 x y r p 06`. Axes are inverted for the controller.
pub fn drive_frame(out: &DriveOutput) -> [u8; DRIVE_FRAME_LEN] {
    [
        SYNC,
        CMD_DRIVE,
        out.x.wrapping_neg() as u8,
        out.y.wrapping_neg() as u8,
        out.r as u8,
        (out.pitch * 3 / 10).min(255) as u8,
        STEP_SIZE,
    ]
}

/// `FF 33 17` followed by the 24-byte bitmap.
pub fn display_frame(emoticon: Emoticon) -> [u8; DISPLAY_FRAME_LEN] {
    let mut frame = [0u8; DISPLAY_FRAME_LEN];
    frame[..3].copy_from_slice(&[SYNC, CMD_DISPLAY, 23]);
    frame[3..].copy_from_slice(emoticon.bitmap());
    frame
}

// ── SerialLink ───────────────────────────────────────────────────

/// Handle to the running serial task.
pub struct SerialLink {
    task: JoinHandle<()>,
}

impl SerialLink {
    /// Start writing `shared` to `device` at `rate_hz`. Must be called
    /// inside a Tokio runtime.
    pub fn spawn(device: PathBuf, rate_hz: u32, shared: Arc<Mutex<DriveOutput>>) -> Self {
        let task = tokio::spawn(run(device, rate_hz, shared));
        Self { task }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

async fn open(device: &Path) -> Option<File> {
    match OpenOptions::new().write(true).open(device).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(device = %device.display(), "unable to open serial port: {e}");
            None
        }
    }
}

async fn run(device: PathBuf, rate_hz: u32, shared: Arc<Mutex<DriveOutput>>) {
    let Some(file) = open(&device).await else {
        warn!("serial link disabled");
        return;
    };
    info!(device = %device.display(), "serial link up");

    let mut port = Some(file);
    let mut shown: Option<Emoticon> = None;
    let mut ticker = Ticker::new(rate_hz);
    loop {
        let Some(file) = port.as_mut() else {
            warn!("serial port problem, reopening");
            tokio::time::sleep(REOPEN_DELAY).await;
            port = open(&device).await;
            shown = None;
            continue;
        };

        let out = *shared.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ok = file.write_all(&drive_frame(&out)).await.is_ok();
        if ok && shown != Some(out.emoticon) {
            ok = file.write_all(&display_frame(out.emoticon)).await.is_ok();
            if ok {
                debug!(emoticon = ?out.emoticon, "display updated");
                shown = Some(out.emoticon);
            }
        }
        if ok {
            ok = file.flush().await.is_ok();
        }
        if !ok {
            port = None;
            continue;
        }
        ticker.wait().await;
    }
}
