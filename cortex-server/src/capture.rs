//! Frame sources and the stream compositor.
//!
//! Every enabled capture device is fetched once per tick and scaled
//! into its destination rectangle of the stream canvas, in the order
//! the devices are configured (later devices draw on top).

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use cortex_core::{CortexError, FrameSource, PixelFormat, RawFrame};

use crate::config::{DeviceConfig, Rect, ServerConfig, SourceKind};

// ── TestPattern ──────────────────────────────────────────────────

/// Scrolling colour bars.
pub struct TestPattern {
    frame: RawFrame,
    phase: u32,
}

impl TestPattern {
    const BARS: [[u8; 3]; 8] = [
        [255, 255, 255],
        [0, 255, 255],
        [255, 255, 0],
        [0, 255, 0],
        [255, 0, 255],
        [0, 0, 255],
        [255, 0, 0],
        [0, 0, 0],
    ];

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frame: RawFrame::new(width, height, PixelFormat::Bgr8),
            phase: 0,
        }
    }
}

impl FrameSource for TestPattern {
    fn dimensions(&self) -> (u32, u32) {
        (self.frame.width, self.frame.height)
    }

    fn fetch(&mut self) -> Result<&RawFrame, CortexError> {
        let width = self.frame.width;
        let bar_width = (width / Self::BARS.len() as u32).max(1);
        for y in 0..self.frame.height {
            let row = self.frame.row_mut(y);
            for x in 0..width {
                let bar = ((x + self.phase) / bar_width) as usize % Self::BARS.len();
                let at = x as usize * 3;
                row[at..at + 3].copy_from_slice(&Self::BARS[bar]);
            }
        }
        self.phase = self.phase.wrapping_add(1);
        Ok(&self.frame)
    }
}

// ── PipeSource ───────────────────────────────────────────────────

/// Raw BGR frames read from a child process (for example an `ffmpeg`
/// reading a V4L2 camera). The latest complete frame wins.
pub struct PipeSource {
    child: Child,
    frame: RawFrame,
    latest: Arc<Mutex<Option<Vec<u8>>>>,
    alive: Arc<AtomicBool>,
}

impl PipeSource {
    pub fn spawn(command: &[String], width: u32, height: u32) -> Result<Self, CortexError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CortexError::Config("empty capture command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| CortexError::Capture(format!("{program}: {e}")))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CortexError::Capture("capture stdout unavailable".into()))?;

        let frame = RawFrame::new(width, height, PixelFormat::Bgr8);
        let frame_len = frame.byte_len();
        let latest = Arc::new(Mutex::new(None));
        let alive = Arc::new(AtomicBool::new(true));

        let slot = Arc::clone(&latest);
        let flag = Arc::clone(&alive);
        let name = program.clone();
        std::thread::Builder::new()
            .name("cortex-capture".into())
            .spawn(move || {
                let mut buf = vec![0u8; frame_len];
                while stdout.read_exact(&mut buf).is_ok() {
                    let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                    *guard = Some(buf.clone());
                }
                info!(source = %name, "capture source closed");
                flag.store(false, Ordering::SeqCst);
            })?;

        Ok(Self {
            child,
            frame,
            latest,
            alive,
        })
    }
}

impl FrameSource for PipeSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.frame.width, self.frame.height)
    }

    fn fetch(&mut self) -> Result<&RawFrame, CortexError> {
        let fresh = self
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match fresh {
            Some(data) => self.frame.data = data,
            None if !self.alive.load(Ordering::SeqCst) => {
                return Err(CortexError::Capture("capture source exited".into()));
            }
            None => {}
        }
        Ok(&self.frame)
    }
}

impl Drop for PipeSource {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            debug!("capture child already gone: {e}");
        }
        let _ = self.child.wait();
    }
}

// ── Compositor ───────────────────────────────────────────────────

struct Device {
    source: Box<dyn FrameSource>,
    src: Rect,
    dst: Rect,
    enabled: bool,
}

/// Composes the enabled devices into the stream canvas.
pub struct Compositor {
    devices: Vec<Device>,
    canvas: RawFrame,
}

impl Compositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            devices: Vec::new(),
            canvas: RawFrame::new(width, height, PixelFormat::Bgr8),
        }
    }

    /// Build sources for every configured device.
    pub fn from_config(config: &ServerConfig) -> Result<Self, CortexError> {
        let mut compositor = Self::new(config.stream.width, config.stream.height);
        for (n, device) in config.devices.iter().enumerate() {
            let source = open_source(device)?;
            info!(device = n, source = ?device.source, w = device.width, h = device.height, "capture device ready");
            compositor.add(source, device.src, device.dst, device.enabled);
        }
        Ok(compositor)
    }

    /// Add a device. Missing rectangles cover the whole capture/stream.
    pub fn add(&mut self, source: Box<dyn FrameSource>, src: Option<Rect>, dst: Option<Rect>, enabled: bool) {
        let (w, h) = source.dimensions();
        let src = src.unwrap_or(Rect { x: 0, y: 0, w, h });
        let dst = dst.unwrap_or(Rect {
            x: 0,
            y: 0,
            w: self.canvas.width,
            h: self.canvas.height,
        });
        self.devices.push(Device {
            source,
            src,
            dst,
            enabled,
        });
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn is_enabled(&self, device: usize) -> Option<bool> {
        self.devices.get(device).map(|d| d.enabled)
    }

    pub fn set_enabled(&mut self, device: usize, enabled: bool) -> bool {
        match self.devices.get_mut(device) {
            Some(d) => {
                d.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Flip a device on or off. Returns the new state.
    pub fn toggle(&mut self, device: usize) -> Option<bool> {
        let d = self.devices.get_mut(device)?;
        d.enabled = !d.enabled;
        Some(d.enabled)
    }

    /// Fetch every enabled device, let `on_capture` see each raw
    /// capture, and draw it into the canvas.
    pub fn compose(&mut self, mut on_capture: impl FnMut(usize, &RawFrame)) -> Result<&RawFrame, CortexError> {
        let Self { devices, canvas } = self;
        canvas.fill(0);
        for (n, device) in devices.iter_mut().enumerate() {
            if !device.enabled {
                continue;
            }
            let frame = device.source.fetch()?;
            on_capture(n, frame);
            blit_scaled(frame, device.src, canvas, device.dst);
        }
        Ok(&*canvas)
    }

    pub fn canvas(&self) -> &RawFrame {
        &self.canvas
    }
}

fn open_source(device: &DeviceConfig) -> Result<Box<dyn FrameSource>, CortexError> {
    Ok(match device.source {
        SourceKind::Pattern => Box::new(TestPattern::new(device.width, device.height)),
        SourceKind::Command => Box::new(PipeSource::spawn(&device.command, device.width, device.height)?),
    })
}

/// Clip `r` to a `w`×`h` area.
fn clip(r: Rect, w: u32, h: u32) -> Option<Rect> {
    if r.x >= w || r.y >= h {
        return None;
    }
    let clipped = Rect {
        x: r.x,
        y: r.y,
        w: r.w.min(w - r.x),
        h: r.h.min(h - r.y),
    };
    (clipped.w > 0 && clipped.h > 0).then_some(clipped)
}

/// Nearest-neighbour scale of `src` in `from` onto `dst` in `to`.
pub fn blit_scaled(from: &RawFrame, src: Rect, to: &mut RawFrame, dst: Rect) {
    let (Some(src), Some(dst)) = (clip(src, from.width, from.height), clip(dst, to.width, to.height)) else {
        warn!("capture rectangle outside the frame, skipping");
        return;
    };
    let bpp = from.format.bytes_per_pixel();
    for dy in 0..dst.h {
        let sy = src.y + (dy as u64 * src.h as u64 / dst.h as u64) as u32;
        let row_in = from.row(sy);
        let row_out = to.row_mut(dst.y + dy);
        for dx in 0..dst.w {
            let sx = src.x + (dx as u64 * src.w as u64 / dst.w as u64) as u32;
            let at_in = sx as usize * bpp;
            let at_out = (dst.x + dx) as usize * bpp;
            row_out[at_out..at_out + bpp].copy_from_slice(&row_in[at_in..at_in + bpp]);
        }
    }
}
