//! Collaborator contracts and the raw frame type.
//!
//! Capture, H.264 coding, speech and text output sit behind these
//! traits. The core never looks inside the bytes it moves: frames go
//! in as raw pixels, access units come out as Annex-B data.

use bytes::Bytes;

use crate::error::CortexError;

// ── PixelFormat ──────────────────────────────────────────────────

/// Pixel layout for raw frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 3 bytes per pixel: Blue, Green, Red (capture default).
    Bgr8,
    /// 3 bytes per pixel: Red, Green, Blue.
    Rgb8,
}

impl PixelFormat {
    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Bgr8 | PixelFormat::Rgb8 => 3,
        }
    }

    /// Name understood by `ffmpeg -pix_fmt`.
    pub const fn ffmpeg_name(self) -> &'static str {
        match self {
            PixelFormat::Bgr8 => "bgr24",
            PixelFormat::Rgb8 => "rgb24",
        }
    }
}

// ── RawFrame ─────────────────────────────────────────────────────

/// An uncompressed frame; `height` rows of `stride` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub stride: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// A black frame with tightly packed rows.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width * format.bytes_per_pixel() as u32;
        Self {
            width,
            height,
            stride,
            format,
            data: vec![0; stride as usize * height as usize],
        }
    }

    /// Total byte size the bitmap occupies.
    pub fn byte_len(&self) -> usize {
        self.stride as usize * self.height as usize
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride as usize;
        &self.data[start..start + self.stride as usize]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride as usize;
        let stride = self.stride as usize;
        &mut self.data[start..start + stride]
    }

    /// Pixel bytes at `(x, y)`, or `None` out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> Option<&[u8]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.format.bytes_per_pixel();
        let offset = y as usize * self.stride as usize + x as usize * bpp;
        self.data.get(offset..offset + bpp)
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }
}

// ── Collaborator traits ──────────────────────────────────────────

/// A camera or other source of raw frames.
pub trait FrameSource: Send {
    /// Frame size this source delivers.
    fn dimensions(&self) -> (u32, u32);

    /// Latest frame.
    fn fetch(&mut self) -> Result<&RawFrame, CortexError>;
}

/// H.264 encoder.
pub trait VideoEncoder: Send {
    /// Ask for a keyframe on the next encode (a new viewer joined).
    fn request_intra_refresh(&mut self);

    /// Encode one frame. Returns the NAL units that became available,
    /// each starting with a 4-byte start code.
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<Bytes>, CortexError>;
}

/// H.264 decoder or player.
pub trait VideoDecoder: Send {
    /// Decode one access unit. Sinks that render elsewhere return `None`.
    fn decode(&mut self, access_unit: &[u8]) -> Result<Option<RawFrame>, CortexError>;
}

/// Text-to-speech.
pub trait Speech: Send + Sync {
    /// Queue `text` for speaking. Never blocks.
    fn speak(&self, text: &str);
}

/// Colour of console text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextStyle {
    #[default]
    Normal,
    Alert,
}

/// Grid of text cells for status lines.
pub trait TextConsole {
    fn write(&mut self, x: u16, y: u16, text: &str, style: TextStyle);
    fn clear(&mut self, x: u16, y: u16, count: u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_geometry() {
        let mut f = RawFrame::new(4, 2, PixelFormat::Bgr8);
        assert_eq!(f.stride, 12);
        assert_eq!(f.byte_len(), 24);
        f.row_mut(1)[3..6].copy_from_slice(&[1, 2, 3]);
        assert_eq!(f.pixel(1, 1), Some(&[1u8, 2, 3][..]));
        assert_eq!(f.pixel(4, 0), None);
    }
}
