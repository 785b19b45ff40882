//! Datagram framing for the Cortex link.
//!
//! Every datagram starts with a 4-byte tag. Video datagrams are raw
//! H.264 Annex-B data whose start code doubles as the tag; everything
//! else is an ASCII tag followed by a small fixed header.
//!
//! ## Wire format
//!
//! ```text
//! 00 00 00 01  server→client  H.264 bytes (the tag is part of the data)
//! HELO         client: empty
//!              server: version:u8  queue_time:u32
//! TIME         client: empty
//!              server: queue_time:u32
//! CTRL         trust_srv:u8 trust_cli:u8 mx:i32 my:i32 kb:u8   + trust
//! DATA         trust_srv:u8 trust_cli:u8 timer:u32             + trust
//! LOST / FULL / QUIT   empty
//! ```
//!
//! All integers are little-endian.

use crate::control::{ControlSample, KeyMask};
use crate::error::CortexError;
use crate::seq::Seq;

// ── Constants ────────────────────────────────────────────────────

/// Protocol revision carried in the server's HELO reply.
pub const PROTOCOL_VERSION: u8 = 2;

/// Default UDP port of the server.
pub const DEFAULT_PORT: u16 = 6979;

/// Length of every tag.
pub const TAG_LEN: usize = 4;

/// Annex-B start code that marks a video datagram.
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Receive buffer size for both sides.
pub const MAX_DATAGRAM: usize = 65_536;

/// Soft limit used when packing NAL units into one video datagram.
pub const VIDEO_CHUNK: usize = 8_192;

// ── Tag ──────────────────────────────────────────────────────────

/// The kind of a datagram, identified by its first four bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Video,
    Data,
    Helo,
    Time,
    Lost,
    Full,
    Quit,
    Ctrl,
}

impl Tag {
    /// Order in which tags are compared against incoming bytes.
    pub const DISPATCH_ORDER: [Tag; 8] = [
        Tag::Video,
        Tag::Data,
        Tag::Helo,
        Tag::Time,
        Tag::Lost,
        Tag::Full,
        Tag::Quit,
        Tag::Ctrl,
    ];

    pub const fn bytes(self) -> [u8; TAG_LEN] {
        match self {
            Tag::Video => START_CODE,
            Tag::Data => *b"DATA",
            Tag::Helo => *b"HELO",
            Tag::Time => *b"TIME",
            Tag::Lost => *b"LOST",
            Tag::Full => *b"FULL",
            Tag::Quit => *b"QUIT",
            Tag::Ctrl => *b"CTRL",
        }
    }

    /// Identify a datagram by its leading tag.
    pub fn identify(data: &[u8]) -> Option<Tag> {
        let head = data.get(..TAG_LEN)?;
        Self::DISPATCH_ORDER
            .into_iter()
            .find(|tag| head == tag.bytes())
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tag::Video => write!(f, "VIDEO"),
            other => {
                let bytes = other.bytes();
                write!(f, "{}", String::from_utf8_lossy(&bytes))
            }
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

// ── CtrlHeader ───────────────────────────────────────────────────

/// Fixed header of a client→server CTRL datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CtrlHeader {
    /// Last server message sequence the client accepted.
    pub trust_srv: Seq,
    /// Sequence of the client's in-flight message.
    pub trust_cli: Seq,
    pub sample: ControlSample,
}

impl CtrlHeader {
    /// Encoded size on the wire (without the tag).
    pub const SIZE: usize = 11;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.trust_srv.value();
        buf[1] = self.trust_cli.value();
        buf[2..6].copy_from_slice(&self.sample.mx.to_le_bytes());
        buf[6..10].copy_from_slice(&self.sample.my.to_le_bytes());
        buf[10] = self.sample.kb.bits();
        buf
    }

    /// Deserialize from bytes. `None` when the header is truncated.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            trust_srv: Seq::new(data[0]),
            trust_cli: Seq::new(data[1]),
            sample: ControlSample {
                mx: read_u32(data, 2) as i32,
                my: read_u32(data, 6) as i32,
                kb: KeyMask::from_bits_truncate(data[10]),
            },
        })
    }

    /// Tag plus header, ready for a trust frame to be appended.
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(TAG_LEN + Self::SIZE + crate::trust::MAX_TRUST_FRAME);
        packet.extend_from_slice(&Tag::Ctrl.bytes());
        packet.extend_from_slice(&self.encode());
        packet
    }
}

// ── DataHeader ───────────────────────────────────────────────────

/// Fixed header of a server→client DATA datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Sequence of the server's in-flight message.
    pub trust_srv: Seq,
    /// Last client message sequence the server accepted.
    pub trust_cli: Seq,
    /// Remaining drive turn of the receiving session, in server ticks.
    pub timer: u32,
}

impl DataHeader {
    /// Encoded size on the wire (without the tag).
    pub const SIZE: usize = 6;

    /// Serialize to bytes (little-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.trust_srv.value();
        buf[1] = self.trust_cli.value();
        buf[2..6].copy_from_slice(&self.timer.to_le_bytes());
        buf
    }

    /// Deserialize from bytes. `None` when the header is truncated.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            trust_srv: Seq::new(data[0]),
            trust_cli: Seq::new(data[1]),
            timer: read_u32(data, 2),
        })
    }

    /// Tag plus header, ready for a trust frame to be appended.
    pub fn to_packet(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(TAG_LEN + Self::SIZE + crate::trust::MAX_TRUST_FRAME);
        packet.extend_from_slice(&Tag::Data.bytes());
        packet.extend_from_slice(&self.encode());
        packet
    }
}

// ── HeloReply ────────────────────────────────────────────────────

/// Body of the server's answer to a HELO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeloReply {
    pub version: u8,
    pub queue_time: u32,
}

impl HeloReply {
    pub fn to_packet(&self) -> [u8; TAG_LEN + 5] {
        let mut buf = [0u8; TAG_LEN + 5];
        buf[..TAG_LEN].copy_from_slice(&Tag::Helo.bytes());
        buf[TAG_LEN] = self.version;
        buf[TAG_LEN + 1..].copy_from_slice(&self.queue_time.to_le_bytes());
        buf
    }

    /// Parse a reply body. A body carrying only the version byte is
    /// still enough to detect a revision mismatch.
    pub fn decode(body: &[u8]) -> Option<Self> {
        let version = *body.first()?;
        let queue_time = if body.len() >= 5 { read_u32(body, 1) } else { 0 };
        Some(Self {
            version,
            queue_time,
        })
    }

    /// Whether the server speaks revision `local`.
    pub fn check_version(&self, local: u8) -> Result<(), CortexError> {
        if self.version == local {
            Ok(())
        } else {
            Err(CortexError::VersionMismatch {
                local,
                remote: self.version,
            })
        }
    }
}

/// TIME reply carrying the queue time.
pub fn time_reply(queue_time: u32) -> [u8; TAG_LEN + 4] {
    let mut buf = [0u8; TAG_LEN + 4];
    buf[..TAG_LEN].copy_from_slice(&Tag::Time.bytes());
    buf[TAG_LEN..].copy_from_slice(&queue_time.to_le_bytes());
    buf
}

/// Queue time carried by a TIME reply body.
pub fn decode_time(body: &[u8]) -> Option<u32> {
    (body.len() >= 4).then(|| read_u32(body, 0))
}

/// A bare tag with no payload (`HELO`/`TIME` requests, `LOST`, `FULL`, `QUIT`).
pub fn signal(tag: Tag) -> [u8; TAG_LEN] {
    tag.bytes()
}

// ── Datagram ─────────────────────────────────────────────────────

/// A decoded datagram borrowing from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datagram<'a> {
    /// Whole datagram including the start code.
    Video(&'a [u8]),
    Data { header: DataHeader, trust: &'a [u8] },
    Helo(&'a [u8]),
    Time(&'a [u8]),
    Lost,
    Full,
    Quit,
    Ctrl { header: CtrlHeader, trust: &'a [u8] },
}

impl<'a> Datagram<'a> {
    /// Decode a datagram. Short, unknown and truncated datagrams yield `None`.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let tag = Tag::identify(data)?;
        let body = &data[TAG_LEN..];
        let datagram = match tag {
            Tag::Video => Datagram::Video(data),
            Tag::Data => {
                let header = DataHeader::decode(body)?;
                Datagram::Data {
                    header,
                    trust: &body[DataHeader::SIZE..],
                }
            }
            Tag::Helo => Datagram::Helo(body),
            Tag::Time => Datagram::Time(body),
            Tag::Lost => Datagram::Lost,
            Tag::Full => Datagram::Full,
            Tag::Quit => Datagram::Quit,
            Tag::Ctrl => {
                let header = CtrlHeader::decode(body)?;
                Datagram::Ctrl {
                    header,
                    trust: &body[CtrlHeader::SIZE..],
                }
            }
        };
        Some(datagram)
    }

    pub fn tag(&self) -> Tag {
        match self {
            Datagram::Video(_) => Tag::Video,
            Datagram::Data { .. } => Tag::Data,
            Datagram::Helo(_) => Tag::Helo,
            Datagram::Time(_) => Tag::Time,
            Datagram::Lost => Tag::Lost,
            Datagram::Full => Tag::Full,
            Datagram::Quit => Tag::Quit,
            Datagram::Ctrl { .. } => Tag::Ctrl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_unknown_datagrams_are_ignored() {
        assert_eq!(Datagram::parse(b""), None);
        assert_eq!(Datagram::parse(b"HEL"), None);
        assert_eq!(Datagram::parse(b"NOPE"), None);
        assert_eq!(Datagram::parse(&[0, 0, 1, 0x65]), None);
    }

    #[test]
    fn video_keeps_start_code() {
        let bytes = [0, 0, 0, 1, 0x67, 0x42];
        assert_eq!(Datagram::parse(&bytes), Some(Datagram::Video(&bytes)));
    }

    #[test]
    fn signals_parse() {
        assert_eq!(Datagram::parse(b"LOST"), Some(Datagram::Lost));
        assert_eq!(Datagram::parse(b"FULL"), Some(Datagram::Full));
        assert_eq!(Datagram::parse(b"QUIT"), Some(Datagram::Quit));
        assert_eq!(Datagram::parse(b"HELO"), Some(Datagram::Helo(&[])));
    }

    #[test]
    fn ctrl_header_layout() {
        let header = CtrlHeader {
            trust_srv: Seq::new(0xFF),
            trust_cli: Seq::new(3),
            sample: ControlSample::new(-2, 300, KeyMask::UP | KeyMask::RIGHT),
        };
        let mut packet = header.to_packet();
        assert_eq!(&packet[..4], b"CTRL");
        assert_eq!(packet.len(), 4 + CtrlHeader::SIZE);
        assert_eq!(packet[4], 0xFF);
        assert_eq!(packet[5], 3);
        assert_eq!(&packet[6..10], &(-2i32).to_le_bytes());
        assert_eq!(&packet[10..14], &300i32.to_le_bytes());
        assert_eq!(packet[14], 0b0110);

        packet.extend_from_slice(b"KIWI\x02hi");
        match Datagram::parse(&packet) {
            Some(Datagram::Ctrl { header: h, trust }) => {
                assert_eq!(h, header);
                assert_eq!(trust, b"KIWI\x02hi");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn truncated_headers_are_malformed() {
        let mut packet = b"CTRL".to_vec();
        packet.extend_from_slice(&[0; CtrlHeader::SIZE - 1]);
        assert_eq!(Datagram::parse(&packet), None);

        let mut packet = b"DATA".to_vec();
        packet.extend_from_slice(&[0; DataHeader::SIZE - 1]);
        assert_eq!(Datagram::parse(&packet), None);
    }

    #[test]
    fn data_header_layout() {
        let header = DataHeader {
            trust_srv: Seq::new(7),
            trust_cli: Seq::new(0xFF),
            timer: 7_499,
        };
        let packet = header.to_packet();
        assert_eq!(&packet[..4], b"DATA");
        assert_eq!(&packet[6..10], &7_499u32.to_le_bytes());
        assert_eq!(
            Datagram::parse(&packet),
            Some(Datagram::Data {
                header,
                trust: &[]
            })
        );
    }

    #[test]
    fn helo_and_time_replies() {
        let reply = HeloReply {
            version: PROTOCOL_VERSION,
            queue_time: 0,
        }
        .to_packet();
        assert_eq!(&reply, b"HELO\x02\x00\x00\x00\x00");
        let Some(Datagram::Helo(body)) = Datagram::parse(&reply) else {
            panic!("not a HELO");
        };
        assert_eq!(
            HeloReply::decode(body),
            Some(HeloReply {
                version: 2,
                queue_time: 0
            })
        );
        assert_eq!(HeloReply::decode(&[1]).map(|r| r.version), Some(1));
        assert_eq!(HeloReply::decode(&[]), None);

        let time = time_reply(15_000);
        let Some(Datagram::Time(body)) = Datagram::parse(&time) else {
            panic!("not a TIME");
        };
        assert_eq!(decode_time(body), Some(15_000));
        assert_eq!(decode_time(&[]), None);
    }

    #[test]
    fn tag_display() {
        assert_eq!(Tag::Ctrl.to_string(), "CTRL");
        assert_eq!(Tag::Video.to_string(), "VIDEO");
    }

    #[test]
    fn helo_reply_version_check() {
        let reply = HeloReply::decode(&[1]).unwrap();
        assert_eq!(reply.queue_time, 0);
        assert!(reply.check_version(1).is_ok());
        let err = reply.check_version(PROTOCOL_VERSION).unwrap_err();
        assert!(matches!(err, CortexError::VersionMismatch { local: 2, remote: 1 }));
    }
}
