//! Frame fragmentation for the send path.

use super::{MediaType, PacketHeader, FLAG_KEYFRAME, HEADER_LEN, PROTOCOL_VERSION};

/// One logical frame about to go on the wire.
#[derive(Debug, Clone, Copy)]
pub struct OutboundFrame<'a> {
    pub media_type: MediaType,
    pub timestamp: u64,
    pub keyframe: bool,
    pub sample_rate: u32,
    pub channels: u8,
    pub payload: &'a [u8],
}

impl<'a> OutboundFrame<'a> {
    /// A video frame carrying an Annex-B H.264 payload.
    pub fn video(payload: &'a [u8], timestamp: u64, keyframe: bool) -> Self {
        Self {
            media_type: MediaType::Video,
            timestamp,
            keyframe,
            sample_rate: 0,
            channels: 0,
            payload,
        }
    }

    /// An audio frame carrying planar f32 PCM.
    pub fn audio(payload: &'a [u8], timestamp: u64, sample_rate: u32, channels: u8) -> Self {
        Self {
            media_type: MediaType::Audio,
            timestamp,
            keyframe: false,
            sample_rate,
            channels,
            payload,
        }
    }
}

/// Splits frames into ready-to-send datagrams.
///
/// Owns the sequence counter, which is shared across media types: every
/// frame, video or audio, consumes one sequence number. All fragments of a
/// frame share the sequence number, timestamp, and flags of that frame.
#[derive(Debug)]
pub struct Fragmenter {
    mtu: usize,
    sequence: u32,
}

impl Fragmenter {
    /// Create a fragmenter for the given per-datagram byte budget
    /// (header included). Budgets that cannot fit a header plus one payload
    /// byte are raised to that minimum.
    pub fn new(mtu: usize) -> Self {
        let mtu = mtu.max(HEADER_LEN + 1);
        Self { mtu, sequence: 0 }
    }

    /// Maximum payload bytes per datagram at this MTU.
    pub fn max_payload(&self) -> usize {
        self.mtu - HEADER_LEN
    }

    /// Sequence number the next frame will be assigned.
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }

    /// Fragment one frame into datagrams.
    ///
    /// An N-byte payload yields `ceil(N / max_payload)` datagrams; an empty
    /// payload yields exactly one header-only datagram. Advances the
    /// sequence counter by one regardless of fragment count.
    pub fn fragment(&mut self, frame: OutboundFrame<'_>) -> Vec<Vec<u8>> {
        let chunk = self.max_payload();
        let count = frame.payload.len().div_ceil(chunk).max(1);
        debug_assert!(count <= u16::MAX as usize, "frame too large for fragment count field");

        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        let flags = if frame.keyframe { FLAG_KEYFRAME } else { 0 };
        let mut datagrams = Vec::with_capacity(count);

        for index in 0..count {
            let start = index * chunk;
            let end = (start + chunk).min(frame.payload.len());
            let piece = &frame.payload[start..end];

            let header = PacketHeader {
                version: PROTOCOL_VERSION,
                media_type: frame.media_type,
                source_id: 0,
                flags,
                sequence,
                timestamp: frame.timestamp,
                total_size: frame.payload.len() as u32,
                fragment_index: index as u16,
                fragment_count: count as u16,
                payload_size: piece.len() as u16,
                sample_rate: frame.sample_rate,
                channels: frame.channels,
            };

            let mut datagram = Vec::with_capacity(HEADER_LEN + piece.len());
            datagram.extend_from_slice(&header.write());
            datagram.extend_from_slice(piece);
            datagrams.push(datagram);
        }

        tracing::trace!(
            media = ?frame.media_type,
            sequence,
            bytes = frame.payload.len(),
            fragments = count,
            "frame fragmented"
        );

        datagrams
    }
}
