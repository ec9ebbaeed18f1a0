//! Fragment reassembly for the receive path.
//!
//! One [`Reassembler`] instance per media type. The policy is
//! complete-or-drop: a fragment from a new sequence discards whatever
//! partial frame the slot held, so a lost fragment costs exactly one frame
//! and never blocks later ones.

use std::collections::HashMap;

use super::{MediaType, PacketHeader};

/// A fully reassembled frame, ready for the decoder or the audio sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteFrame {
    pub media_type: MediaType,
    pub sequence: u32,
    pub timestamp: u64,
    pub flags: u8,
    pub sample_rate: u32,
    pub channels: u8,
    pub payload: Vec<u8>,
}

impl CompleteFrame {
    pub fn is_keyframe(&self) -> bool {
        self.flags & super::FLAG_KEYFRAME != 0
    }
}

/// Counters exposed for the once-per-second stats line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Frames emitted complete.
    pub frames_completed: u64,
    /// Partial frames discarded on sequence change.
    pub frames_dropped: u64,
    /// Completed frames whose concatenated length disagreed with the
    /// header's total size (delivered anyway).
    pub length_mismatches: u64,
}

/// Per-media-type reassembly slot.
///
/// Holds at most one in-flight sequence. Fragments are keyed by index;
/// a duplicate index overwrites the earlier payload (last writer wins).
#[derive(Debug)]
pub struct Reassembler {
    label: &'static str,
    current: Option<u32>,
    expected_count: u16,
    expected_total: u32,
    first_header: Option<PacketHeader>,
    fragments: HashMap<u16, Vec<u8>>,
    stats: ReassemblyStats,
}

impl Reassembler {
    /// `label` names the stream in log lines ("video" / "audio").
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            current: None,
            expected_count: 0,
            expected_total: 0,
            first_header: None,
            fragments: HashMap::new(),
            stats: ReassemblyStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Admit one fragment. Returns the completed frame when this fragment
    /// was the last one missing.
    pub fn push(&mut self, header: &PacketHeader, payload: &[u8]) -> Option<CompleteFrame> {
        if self.current != Some(header.sequence) {
            if self.current.is_some() && !self.fragments.is_empty() {
                self.stats.frames_dropped += 1;
                tracing::warn!(
                    stream = self.label,
                    sequence = self.current.unwrap(),
                    got = self.fragments.len(),
                    expected = self.expected_count,
                    "incomplete frame dropped"
                );
            }
            self.fragments.clear();
            self.current = Some(header.sequence);
            self.expected_count = header.fragment_count;
            self.expected_total = header.total_size;
            self.first_header = Some(*header);
        }

        self.fragments.insert(header.fragment_index, payload.to_vec());

        if self.fragments.len() < self.expected_count as usize {
            return None;
        }

        let meta = self.first_header.take().unwrap_or(*header);
        let mut assembled = Vec::with_capacity(self.expected_total as usize);
        for index in 0..self.expected_count {
            // Index coverage is guaranteed: the map holds expected_count
            // entries and every key is < fragment_count by header validation.
            if let Some(piece) = self.fragments.remove(&index) {
                assembled.extend_from_slice(&piece);
            }
        }

        if assembled.len() != self.expected_total as usize {
            self.stats.length_mismatches += 1;
            tracing::warn!(
                stream = self.label,
                sequence = meta.sequence,
                assembled = assembled.len(),
                expected = self.expected_total,
                "reassembled length mismatch, delivering anyway"
            );
        }

        self.fragments.clear();
        self.current = None;
        self.stats.frames_completed += 1;

        Some(CompleteFrame {
            media_type: meta.media_type,
            sequence: meta.sequence,
            timestamp: meta.timestamp,
            flags: meta.flags,
            sample_rate: meta.sample_rate,
            channels: meta.channels,
            payload: assembled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Fragmenter, OutboundFrame};

    fn feed(
        reassembler: &mut Reassembler,
        datagrams: &[Vec<u8>],
        order: &[usize],
    ) -> Vec<CompleteFrame> {
        let mut out = Vec::new();
        for &i in order {
            let (header, payload) = crate::protocol::split_datagram(&datagrams[i]).unwrap();
            if let Some(frame) = reassembler.push(&header, payload) {
                out.push(frame);
            }
        }
        out
    }

    fn fragments_for(payload: &[u8], mtu: usize, timestamp: u64) -> Vec<Vec<u8>> {
        let mut f = Fragmenter::new(mtu);
        f.fragment(OutboundFrame::video(payload, timestamp, true))
    }

    // --- Completion ---

    #[test]
    fn out_of_order_fragments_complete_one_frame() {
        // Fragments arrive 1, 0, 2.
        let data: Vec<u8> = (0..250u8).collect();
        let datagrams = fragments_for(&data, 100 + crate::protocol::HEADER_LEN, 42);
        assert_eq!(datagrams.len(), 3);

        let mut r = Reassembler::new("video");
        let frames = feed(&mut r, &datagrams, &[1, 0, 2]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, data);
        assert_eq!(frames[0].timestamp, 42);
        assert!(frames[0].is_keyframe());
    }

    #[test]
    fn every_permutation_of_three_fragments_completes() {
        let data: Vec<u8> = (0..300u32).map(|i| i as u8).collect();
        let permutations: &[[usize; 3]] = &[
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in permutations {
            let datagrams = fragments_for(&data, 100 + crate::protocol::HEADER_LEN, 0);
            let mut r = Reassembler::new("video");
            let frames = feed(&mut r, &datagrams, order);
            assert_eq!(frames.len(), 1, "order {:?}", order);
            assert_eq!(frames[0].payload, data, "order {:?}", order);
        }
    }

    #[test]
    fn single_fragment_frame_emits_immediately() {
        let datagrams = fragments_for(&[1, 2, 3], crate::protocol::DEFAULT_MTU, 9);
        let mut r = Reassembler::new("video");
        let frames = feed(&mut r, &datagrams, &[0]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, vec![1, 2, 3]);
    }

    #[test]
    fn zero_length_frame_accepted() {
        let datagrams = fragments_for(&[], crate::protocol::DEFAULT_MTU, 0);
        let mut r = Reassembler::new("video");
        let frames = feed(&mut r, &datagrams, &[0]);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    // --- Drop policy ---

    #[test]
    fn partial_frame_dropped_on_new_sequence() {
        let mut f = Fragmenter::new(100 + crate::protocol::HEADER_LEN);
        let first = f.fragment(OutboundFrame::video(&[0xAA; 300], 1, false));
        let second = f.fragment(OutboundFrame::video(&[0xBB; 50], 2, false));
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);

        let mut r = Reassembler::new("video");
        // One fragment of sequence 0, then the whole of sequence 1.
        let (h, p) = crate::protocol::split_datagram(&first[1]).unwrap();
        assert!(r.push(&h, p).is_none());
        let (h, p) = crate::protocol::split_datagram(&second[0]).unwrap();
        let frame = r.push(&h, p).expect("second sequence should complete");

        assert_eq!(frame.sequence, 1);
        assert_eq!(frame.payload, vec![0xBB; 50]);
        assert_eq!(r.stats().frames_dropped, 1);
        assert_eq!(r.stats().frames_completed, 1);
    }

    #[test]
    fn missing_middle_fragment_emits_nothing() {
        let data = vec![0x11; 300];
        let datagrams = fragments_for(&data, 100 + crate::protocol::HEADER_LEN, 0);
        let mut r = Reassembler::new("video");
        let frames = feed(&mut r, &datagrams, &[0, 2]);
        assert!(frames.is_empty());
        assert_eq!(r.stats().frames_completed, 0);
    }

    #[test]
    fn duplicate_fragment_last_writer_wins() {
        let data = vec![0x22; 200];
        let datagrams = fragments_for(&data, 100 + crate::protocol::HEADER_LEN, 0);
        assert_eq!(datagrams.len(), 2);

        let mut r = Reassembler::new("video");
        let (h0, p0) = crate::protocol::split_datagram(&datagrams[0]).unwrap();
        assert!(r.push(&h0, p0).is_none());
        // Same index again with different bytes.
        let forged = vec![0x33; p0.len()];
        assert!(r.push(&h0, &forged).is_none());
        let (h1, p1) = crate::protocol::split_datagram(&datagrams[1]).unwrap();
        let frame = r.push(&h1, p1).unwrap();

        assert_eq!(&frame.payload[..p0.len()], &forged[..]);
    }

    #[test]
    fn length_mismatch_delivers_with_counter() {
        let data = vec![0x44; 200];
        let datagrams = fragments_for(&data, 100 + crate::protocol::HEADER_LEN, 0);
        let mut r = Reassembler::new("video");

        // Shorten the second fragment's payload behind the header's back.
        let (h0, p0) = crate::protocol::split_datagram(&datagrams[0]).unwrap();
        assert!(r.push(&h0, p0).is_none());
        let (h1, p1) = crate::protocol::split_datagram(&datagrams[1]).unwrap();
        let frame = r.push(&h1, &p1[..p1.len() - 10]).unwrap();

        assert_eq!(frame.payload.len(), data.len() - 10);
        assert_eq!(r.stats().length_mismatches, 1);
    }

    #[test]
    fn consecutive_frames_reuse_the_slot() {
        let mut f = Fragmenter::new(crate::protocol::DEFAULT_MTU);
        let mut r = Reassembler::new("audio");
        for i in 0..10u8 {
            let payload = vec![i; 100];
            for datagram in f.fragment(OutboundFrame::audio(&payload, i as u64, 48_000, 2)) {
                let (h, p) = crate::protocol::split_datagram(&datagram).unwrap();
                let frame = r.push(&h, p).expect("single-fragment frame");
                assert_eq!(frame.payload, payload);
                assert_eq!(frame.sample_rate, 48_000);
            }
        }
        assert_eq!(r.stats().frames_completed, 10);
        assert_eq!(r.stats().frames_dropped, 0);
    }
}
