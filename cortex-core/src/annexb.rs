//! Annex-B byte-stream splitting.
//!
//! An encoder writing to a pipe produces one continuous stream; this
//! splitter cuts it into NAL units at start codes and normalises every
//! unit to a 4-byte start code so each video datagram is recognisable
//! by its tag.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::wire::START_CODE;

/// Locate the next start code at or after `from`.
/// Returns `(start_of_code, start_of_payload)`.
fn find_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 && buf[i + 2] == 1 {
            let start = if i > 0 && buf[i - 1] == 0 { i - 1 } else { i };
            return Some((start, i + 3));
        }
        i += 1;
    }
    None
}

/// Incremental Annex-B splitter.
#[derive(Debug, Default)]
pub struct NalSplitter {
    buf: BytesMut,
}

impl NalSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.put_slice(data);
    }

    /// Bytes waiting for the next start code.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete NAL unit: one whose successor start code has arrived.
    pub fn next_nal(&mut self) -> Option<Bytes> {
        let Some((_, begin)) = find_start_code(&self.buf, 0) else {
            // Keep a possible partial start code, drop the rest.
            let keep = 3.min(self.buf.len());
            let junk = self.buf.len() - keep;
            self.buf.advance(junk);
            return None;
        };
        let (end, _) = find_start_code(&self.buf, begin)?;
        let nal = Self::normalise(&self.buf[begin..end]);
        self.buf.advance(end);
        Some(nal)
    }

    /// Every complete unit currently buffered.
    pub fn drain(&mut self) -> Vec<Bytes> {
        std::iter::from_fn(|| self.next_nal()).collect()
    }

    /// The trailing unit at end of stream.
    pub fn flush(&mut self) -> Option<Bytes> {
        let (_, begin) = find_start_code(&self.buf, 0)?;
        let nal = (begin < self.buf.len()).then(|| Self::normalise(&self.buf[begin..]));
        self.buf.clear();
        nal
    }

    fn normalise(payload: &[u8]) -> Bytes {
        let mut nal = BytesMut::with_capacity(START_CODE.len() + payload.len());
        nal.put_slice(&START_CODE);
        nal.put_slice(payload);
        nal.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_mixed_start_codes() {
        let mut s = NalSplitter::new();
        s.push(&[0, 0, 0, 1, 0x67, 0xAA, 0, 0, 1, 0x68, 0xBB]);
        s.push(&[0, 0, 0, 1, 0x65, 0xCC]);

        assert_eq!(s.next_nal().as_deref(), Some(&[0, 0, 0, 1, 0x67, 0xAA][..]));
        assert_eq!(s.next_nal().as_deref(), Some(&[0, 0, 0, 1, 0x68, 0xBB][..]));
        assert_eq!(s.next_nal(), None);

        let last = s.flush().unwrap();
        assert_eq!(&last[..], &[0, 0, 0, 1, 0x65, 0xCC]);
    }

    #[test]
    fn start_code_split_across_pushes() {
        let mut s = NalSplitter::new();
        s.push(&[0, 0, 0, 1, 0x41, 1, 2, 0, 0]);
        assert_eq!(s.next_nal(), None);
        s.push(&[0, 1, 0x41]);
        assert_eq!(s.drain().len(), 1);
    }

    #[test]
    fn leading_garbage_is_discarded() {
        let mut s = NalSplitter::new();
        s.push(&[9, 9, 9, 9, 9, 0]);
        assert_eq!(s.next_nal(), None);
        assert!(s.buffered() <= 3);
        s.push(&[0, 0, 1, 0x09, 0x10, 0, 0, 1, 0x67]);
        assert_eq!(s.next_nal().as_deref(), Some(&[0, 0, 0, 1, 0x09, 0x10][..]));
    }
}
