//! Annex-B byte-stream handling.
//!
//! The wire carries H.264 in Annex-B form: NAL units delimited by
//! `00 00 01` or `00 00 00 01` start codes. Host codecs commonly want the
//! length-prefixed AVCC form instead, with parameter sets held out-of-band;
//! the conversions here bridge the two.

/// Coded slice of a non-IDR picture.
pub const NAL_SLICE: u8 = 1;
/// Instantaneous decoder refresh (keyframe) slice.
pub const NAL_IDR: u8 = 5;
/// Supplemental enhancement information.
pub const NAL_SEI: u8 = 6;
/// Sequence parameter set.
pub const NAL_SPS: u8 = 7;
/// Picture parameter set.
pub const NAL_PPS: u8 = 8;
/// Access unit delimiter.
pub const NAL_AUD: u8 = 9;

/// NAL unit type: low 5 bits of the first payload byte.
pub fn nal_type(first_byte: u8) -> u8 {
    first_byte & 0x1F
}

/// Split an Annex-B bitstream into NAL unit payloads (start codes removed).
///
/// Both start code lengths are accepted, mixed freely. A zero byte followed
/// by `00 00 01` is counted as a four-byte start code, not as trailing data
/// of the previous NAL (prefer the longer match). Bytes before the first
/// start code are ignored.
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut units = Vec::new();
    let mut nal_start: Option<usize> = None;
    let mut i = 0usize;

    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // Close the NAL that ran up to this start code. A preceding
            // zero byte belongs to a four-byte start code, not to the NAL.
            let mut end = i;
            if end > 0 && data[end - 1] == 0 {
                end -= 1;
            }
            if let Some(start) = nal_start {
                if start < end {
                    units.push(&data[start..end]);
                }
            }
            nal_start = Some(i + 3);
            i += 3;
        } else if data[i + 2] == 0 {
            // Cannot start a code at i or i+1 if the third byte is zero;
            // skip ahead past it.
            i += 1;
        } else {
            i += 3;
        }
    }

    if let Some(start) = nal_start {
        if start < data.len() {
            units.push(&data[start..]);
        }
    }

    units
}

/// Append one NAL unit to an Annex-B stream with a four-byte start code.
pub fn write_annexb(out: &mut Vec<u8>, nal: &[u8]) {
    out.extend_from_slice(&[0, 0, 0, 1]);
    out.extend_from_slice(nal);
}

/// Convert an Annex-B stream to AVCC form (4-byte big-endian length
/// prefixes, no start codes).
pub fn to_avcc(annexb: &[u8]) -> Vec<u8> {
    let units = split_nal_units(annexb);
    let total: usize = units.iter().map(|u| 4 + u.len()).sum();
    let mut out = Vec::with_capacity(total);
    for unit in units {
        out.extend_from_slice(&(unit.len() as u32).to_be_bytes());
        out.extend_from_slice(unit);
    }
    out
}

/// Convert an AVCC sample to Annex-B form with four-byte start codes.
///
/// A truncated trailing length entry ends the conversion; everything parsed
/// up to that point is returned.
pub fn from_avcc(avcc: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(avcc.len());
    let mut i = 0usize;
    while i + 4 <= avcc.len() {
        let len = u32::from_be_bytes([avcc[i], avcc[i + 1], avcc[i + 2], avcc[i + 3]]) as usize;
        i += 4;
        if len == 0 || i + len > avcc.len() {
            break;
        }
        write_annexb(&mut out, &avcc[i..i + len]);
        i += len;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Splitting ---

    #[test]
    fn single_nal_four_byte_code() {
        let data = [0, 0, 0, 1, 0x65, 0xAA, 0xBB];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x65, 0xAA, 0xBB][..]]);
    }

    #[test]
    fn single_nal_three_byte_code() {
        let data = [0, 0, 1, 0x67, 0x42];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x67, 0x42][..]]);
    }

    #[test]
    fn mixed_start_codes_recover_all_payloads() {
        let mut data = vec![0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E];
        data.extend_from_slice(&[0, 0, 1, 0x68, 0xCE]);
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0x88, 0x84]);
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0], &[0x67, 0x42, 0x00, 0x1E]);
        assert_eq!(units[1], &[0x68, 0xCE]);
        assert_eq!(units[2], &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn longer_start_code_preferred() {
        // 0x00 before "00 00 01" belongs to the start code, not the NAL.
        let data = [0, 0, 1, 0x41, 0xFF, 0x00, 0x00, 0x00, 0x01, 0x41, 0xEE];
        let units = split_nal_units(&data);
        assert_eq!(units.len(), 2);
        assert_eq!(units[0], &[0x41, 0xFF]);
        assert_eq!(units[1], &[0x41, 0xEE]);
    }

    #[test]
    fn leading_garbage_ignored() {
        let data = [0xDE, 0xAD, 0, 0, 0, 1, 0x41, 0x01];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x41, 0x01][..]]);
    }

    #[test]
    fn empty_input() {
        assert!(split_nal_units(&[]).is_empty());
    }

    #[test]
    fn no_start_code() {
        assert!(split_nal_units(&[0xFF, 0x00, 0xFE, 0x00]).is_empty());
    }

    #[test]
    fn zero_runs_inside_nal_body_survive() {
        // A NAL body containing 00 00 02 must not be split.
        let data = [0, 0, 0, 1, 0x41, 0x00, 0x00, 0x02, 0x17];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x41, 0x00, 0x00, 0x02, 0x17][..]]);
    }

    #[test]
    fn nal_types_routed() {
        assert_eq!(nal_type(0x67), NAL_SPS);
        assert_eq!(nal_type(0x68), NAL_PPS);
        assert_eq!(nal_type(0x65), NAL_IDR);
        assert_eq!(nal_type(0x41), NAL_SLICE);
        assert_eq!(nal_type(0x06), NAL_SEI);
        assert_eq!(nal_type(0x09), NAL_AUD);
    }

    // --- AVCC conversion ---

    #[test]
    fn annexb_to_avcc_and_back() {
        let mut annexb = Vec::new();
        write_annexb(&mut annexb, &[0x67, 0x42, 0x00]);
        write_annexb(&mut annexb, &[0x68, 0xCE]);
        write_annexb(&mut annexb, &[0x65, 0x88, 0x11, 0x22]);

        let avcc = to_avcc(&annexb);
        assert_eq!(&avcc[0..4], &3u32.to_be_bytes());
        assert_eq!(&avcc[4..7], &[0x67, 0x42, 0x00]);

        assert_eq!(from_avcc(&avcc), annexb);
    }

    #[test]
    fn avcc_with_three_byte_source_codes_normalizes_to_four() {
        let annexb = [0u8, 0, 1, 0x41, 0x07];
        let avcc = to_avcc(&annexb);
        let back = from_avcc(&avcc);
        assert_eq!(back, &[0, 0, 0, 1, 0x41, 0x07]);
    }

    #[test]
    fn truncated_avcc_stops_clean() {
        let mut avcc = Vec::new();
        avcc.extend_from_slice(&2u32.to_be_bytes());
        avcc.extend_from_slice(&[0x41, 0x01]);
        avcc.extend_from_slice(&100u32.to_be_bytes()); // claims more than present
        avcc.push(0x41);
        let back = from_avcc(&avcc);
        assert_eq!(back, &[0, 0, 0, 1, 0x41, 0x01]);
    }
}
