//! Wire protocol: datagram header codec and fragmentation rules.
//!
//! Every UDP datagram on the bridge link starts with a fixed 38-byte header
//! (version 2), all integer fields big-endian:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        magic "NDIB"                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |    version    |   media type  |   source id   |     flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        sequence number                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    timestamp (100 ns ticks)                   |
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          total size                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        fragment index         |        fragment count         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |         payload size          |      sample rate (hi)         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      sample rate (lo)         |    channels   |   reserved    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |          reserved             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Version 1 is a legacy 28-byte video-only layout (no media type, source id,
//! sample rate, or channels). The send path always emits version 2; the
//! receive path accepts both.

pub mod fragment;
pub mod reassembly;

use crate::error::{BridgeError, HeaderErrorKind, Result};

pub use fragment::{Fragmenter, OutboundFrame};
pub use reassembly::{CompleteFrame, Reassembler, ReassemblyStats};

/// 4-byte magic tag `"NDIB"`.
pub const MAGIC: u32 = 0x4E44_4942;

/// Current wire protocol version, produced on the send path.
pub const PROTOCOL_VERSION: u8 = 2;

/// Legacy video-only protocol version, accepted on the receive path.
pub const LEGACY_VERSION: u8 = 1;

/// Version-2 header length in bytes.
pub const HEADER_LEN: usize = 38;

/// Version-1 legacy header length in bytes.
pub const LEGACY_HEADER_LEN: usize = 28;

/// Default UDP port for both endpoints.
pub const DEFAULT_PORT: u16 = 5990;

/// Default per-datagram byte budget, header included.
pub const DEFAULT_MTU: usize = 1400;

/// Wire timestamp timebase: 100-nanosecond ticks.
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// `flags` bit 0: this frame is a keyframe (video only).
pub const FLAG_KEYFRAME: u8 = 0x01;

/// Logical stream carried by a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// H.264 elementary stream in Annex-B form.
    Video,
    /// Planar 32-bit-float PCM.
    Audio,
}

impl MediaType {
    fn from_wire(byte: u8) -> Self {
        // Anything that is not audio is treated as video, matching the
        // original receiver.
        match byte {
            1 => Self::Audio,
            _ => Self::Video,
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
        }
    }
}

/// Decoded form of one datagram header.
///
/// Fields mirror the wire layout; `sample_rate` and `channels` are only
/// meaningful for audio and are zero for video and for legacy headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub version: u8,
    pub media_type: MediaType,
    pub source_id: u8,
    pub flags: u8,
    pub sequence: u32,
    pub timestamp: u64,
    pub total_size: u32,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_size: u16,
    pub sample_rate: u32,
    pub channels: u8,
}

impl PacketHeader {
    /// Whether the keyframe flag is set.
    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    /// Header length for this header's version.
    pub fn wire_len(&self) -> usize {
        if self.version == LEGACY_VERSION {
            LEGACY_HEADER_LEN
        } else {
            HEADER_LEN
        }
    }

    /// Reinterpret a signed capture timecode as an unsigned wire timestamp.
    ///
    /// Capture libraries hand out signed 64-bit timecodes; the wire carries
    /// the same bit pattern unsigned.
    pub fn timestamp_from_timecode(timecode: i64) -> u64 {
        timecode as u64
    }

    /// Serialize a version-2 header.
    ///
    /// Reserved bytes are written as zero. The caller is responsible for
    /// having fragmented the frame so that `payload_size` fits the link MTU
    /// (see [`Fragmenter`]).
    pub fn write(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.media_type.to_wire();
        buf[6] = self.source_id;
        buf[7] = self.flags;
        buf[8..12].copy_from_slice(&self.sequence.to_be_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.total_size.to_be_bytes());
        buf[24..26].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[26..28].copy_from_slice(&self.fragment_count.to_be_bytes());
        buf[28..30].copy_from_slice(&self.payload_size.to_be_bytes());
        buf[30..34].copy_from_slice(&self.sample_rate.to_be_bytes());
        buf[34] = self.channels;
        // buf[35..38] stays zero (reserved)
        buf
    }

    /// Parse a header from the front of a datagram, selecting the layout by
    /// the version byte.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < 5 {
            return Err(header_error(HeaderErrorKind::Truncated));
        }
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(header_error(HeaderErrorKind::BadMagic));
        }
        let header = match buf[4] {
            PROTOCOL_VERSION => Self::parse_v2(buf)?,
            LEGACY_VERSION => Self::parse_v1(buf)?,
            _ => return Err(header_error(HeaderErrorKind::BadVersion)),
        };
        if header.fragment_index >= header.fragment_count {
            return Err(header_error(HeaderErrorKind::BadFragmentIndex));
        }
        Ok(header)
    }

    fn parse_v2(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(header_error(HeaderErrorKind::Truncated));
        }
        Ok(Self {
            version: PROTOCOL_VERSION,
            media_type: MediaType::from_wire(buf[5]),
            source_id: buf[6],
            flags: buf[7],
            sequence: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            timestamp: u64::from_be_bytes([
                buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
            ]),
            total_size: u32::from_be_bytes([buf[20], buf[21], buf[22], buf[23]]),
            fragment_index: u16::from_be_bytes([buf[24], buf[25]]),
            fragment_count: u16::from_be_bytes([buf[26], buf[27]]),
            payload_size: u16::from_be_bytes([buf[28], buf[29]]),
            sample_rate: u32::from_be_bytes([buf[30], buf[31], buf[32], buf[33]]),
            channels: buf[34],
        })
    }

    /// Legacy layout: `magic(4) version(1) flags(1) sequence(4) timestamp(8)
    /// totalSize(4) fragmentIndex(2) fragmentCount(2) payloadSize(2)`.
    fn parse_v1(buf: &[u8]) -> Result<Self> {
        if buf.len() < LEGACY_HEADER_LEN {
            return Err(header_error(HeaderErrorKind::Truncated));
        }
        Ok(Self {
            version: LEGACY_VERSION,
            media_type: MediaType::Video,
            source_id: 0,
            flags: buf[5],
            sequence: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            timestamp: u64::from_be_bytes([
                buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16], buf[17],
            ]),
            total_size: u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]),
            fragment_index: u16::from_be_bytes([buf[22], buf[23]]),
            fragment_count: u16::from_be_bytes([buf[24], buf[25]]),
            payload_size: u16::from_be_bytes([buf[26], buf[27]]),
            sample_rate: 0,
            channels: 0,
        })
    }
}

fn header_error(kind: HeaderErrorKind) -> BridgeError {
    BridgeError::InvalidHeader { kind }
}

/// Split a raw datagram into its header and payload fragment.
///
/// The payload is clamped to the bytes actually present after the header, so
/// a header whose `payload_size` overstates the datagram length cannot read
/// past the buffer.
pub fn split_datagram(buf: &[u8]) -> Result<(PacketHeader, &[u8])> {
    let header = PacketHeader::parse(buf)?;
    let offset = header.wire_len();
    let available = buf.len() - offset;
    let take = (header.payload_size as usize).min(available);
    Ok((header, &buf[offset..offset + take]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_header() -> PacketHeader {
        PacketHeader {
            version: PROTOCOL_VERSION,
            media_type: MediaType::Audio,
            source_id: 0,
            flags: FLAG_KEYFRAME,
            sequence: 0xDEAD_BEEF,
            timestamp: 0x0123_4567_89AB_CDEF,
            total_size: 1_000_000,
            fragment_index: 3,
            fragment_count: 8,
            payload_size: 1362,
            sample_rate: 48_000,
            channels: 2,
        }
    }

    // --- Round trip ---

    #[test]
    fn round_trip_preserves_every_field() {
        let header = make_header();
        let parsed = PacketHeader::parse(&header.write()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn round_trip_video() {
        let header = PacketHeader {
            media_type: MediaType::Video,
            flags: 0,
            sample_rate: 0,
            channels: 0,
            ..make_header()
        };
        let parsed = PacketHeader::parse(&header.write()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn reserved_bytes_are_zero() {
        let buf = make_header().write();
        assert_eq!(&buf[35..38], &[0, 0, 0]);
    }

    #[test]
    fn magic_spells_ndib() {
        let buf = make_header().write();
        assert_eq!(&buf[0..4], b"NDIB");
    }

    // --- Rejection ---

    #[test]
    fn rejects_truncated() {
        let buf = make_header().write();
        for len in 0..HEADER_LEN {
            let err = PacketHeader::parse(&buf[..len]).unwrap_err();
            match err {
                BridgeError::InvalidHeader { kind } => {
                    assert_eq!(kind, HeaderErrorKind::Truncated, "at len {}", len)
                }
                other => panic!("expected InvalidHeader, got {:?}", other),
            }
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = make_header().write();
        buf[0] = b'X';
        let err = PacketHeader::parse(&buf).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidHeader {
                kind: HeaderErrorKind::BadMagic
            }
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = make_header().write();
        buf[4] = 3;
        let err = PacketHeader::parse(&buf).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidHeader {
                kind: HeaderErrorKind::BadVersion
            }
        ));
    }

    #[test]
    fn rejects_fragment_index_out_of_range() {
        let mut header = make_header();
        header.fragment_index = header.fragment_count;
        let err = PacketHeader::parse(&header.write()).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::InvalidHeader {
                kind: HeaderErrorKind::BadFragmentIndex
            }
        ));
    }

    #[test]
    fn rejects_zero_fragment_count() {
        let mut header = make_header();
        header.fragment_index = 0;
        header.fragment_count = 0;
        assert!(PacketHeader::parse(&header.write()).is_err());
    }

    // --- Legacy version 1 ---

    fn make_v1_datagram(payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LEGACY_HEADER_LEN + payload.len());
        buf.extend_from_slice(&MAGIC.to_be_bytes());
        buf.push(LEGACY_VERSION);
        buf.push(FLAG_KEYFRAME);
        buf.extend_from_slice(&7u32.to_be_bytes());
        buf.extend_from_slice(&123_456_789u64.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&1u16.to_be_bytes());
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn accepts_legacy_v1() {
        let datagram = make_v1_datagram(&[0xAA, 0xBB]);
        let (header, payload) = split_datagram(&datagram).unwrap();
        assert_eq!(header.version, LEGACY_VERSION);
        assert_eq!(header.media_type, MediaType::Video);
        assert_eq!(header.sequence, 7);
        assert_eq!(header.timestamp, 123_456_789);
        assert!(header.is_keyframe());
        assert_eq!(header.sample_rate, 0);
        assert_eq!(header.channels, 0);
        assert_eq!(payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn legacy_v1_truncated_rejected() {
        let datagram = make_v1_datagram(&[]);
        assert!(PacketHeader::parse(&datagram[..LEGACY_HEADER_LEN - 1]).is_err());
    }

    // --- Datagram splitting ---

    #[test]
    fn split_clamps_overstated_payload_size() {
        let mut header = make_header();
        header.payload_size = 500;
        let mut datagram = header.write().to_vec();
        datagram.extend_from_slice(&[1, 2, 3]); // only 3 bytes actually present
        let (_, payload) = split_datagram(&datagram).unwrap();
        assert_eq!(payload, &[1, 2, 3]);
    }

    #[test]
    fn split_header_only_datagram() {
        let mut header = make_header();
        header.payload_size = 0;
        header.total_size = 0;
        header.fragment_index = 0;
        header.fragment_count = 1;
        let bytes = header.write();
        let (parsed, payload) = split_datagram(&bytes).unwrap();
        assert_eq!(parsed.payload_size, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn split_ignores_trailing_bytes_past_payload_size() {
        let mut header = make_header();
        header.payload_size = 2;
        let mut datagram = header.write().to_vec();
        datagram.extend_from_slice(&[9, 9, 7, 7]);
        let (_, payload) = split_datagram(&datagram).unwrap();
        assert_eq!(payload, &[9, 9]);
    }

    // --- Timecode reinterpretation ---

    #[test]
    fn negative_timecode_keeps_bit_pattern() {
        let ts = PacketHeader::timestamp_from_timecode(-1);
        assert_eq!(ts, u64::MAX);
    }
}
