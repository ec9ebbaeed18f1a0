//! Software codec backend built on OpenH264.
//!
//! Implements the backend capability traits for platforms without a usable
//! hardware codec. OpenH264 speaks Annex-B natively and keeps parameter
//! sets in-band, so this module extracts SPS/PPS from the bitstream on the
//! way out and re-inlines them on the way in.

use openh264::decoder::{Decoder, DecoderConfig};
use openh264::encoder::{Encoder, EncoderConfig};
use openh264::formats::YUVSource;
use openh264::OpenH264API;

use super::{
    annexb, DecodedVideo, EncodedSample, H264DecoderBackend, H264EncoderBackend, ParameterSets,
    SessionParams,
};
use crate::error::{BridgeError, Result};
use crate::source::{PixelBuffer, PixelFormat, Plane};

fn codec_err(e: openh264::Error) -> BridgeError {
    BridgeError::Codec(e.to_string())
}

/// Software H.264 encoder session.
#[derive(Default)]
pub struct OpenH264Encoder {
    session: Option<Encoder>,
    parameter_sets: Option<ParameterSets>,
}

impl OpenH264Encoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl H264EncoderBackend for OpenH264Encoder {
    fn start(&mut self, params: &SessionParams) -> Result<()> {
        let fps = params.frame_rate_num as f32 / params.frame_rate_den.max(1) as f32;
        let config = EncoderConfig::new()
            .set_bitrate_bps(params.bitrate_bps)
            .max_frame_rate(fps)
            .enable_skip_frame(false);
        let api = OpenH264API::from_source();
        let encoder = Encoder::with_api_config(api, config).map_err(codec_err)?;
        self.session = Some(encoder);
        self.parameter_sets = None;
        Ok(())
    }

    fn encode(
        &mut self,
        frame: &PixelBuffer,
        _timestamp: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedSample>> {
        let encoder = self.session.as_mut().ok_or(BridgeError::NotStarted)?;
        if force_keyframe {
            encoder.force_intra_frame();
        }

        let yuv = I420Buffer::from_pixel_buffer(frame)?;
        let bitstream = encoder.encode(&yuv).map_err(codec_err)?;
        let stream = bitstream.to_vec();
        if stream.is_empty() {
            return Ok(None);
        }

        // OpenH264 inlines SPS/PPS ahead of IDR slices; lift them out so
        // the sample matches the out-of-band backend contract.
        let mut avcc = Vec::with_capacity(stream.len());
        let mut is_keyframe = false;
        let mut sps: Option<Vec<u8>> = None;
        let mut pps: Option<Vec<u8>> = None;
        for unit in annexb::split_nal_units(&stream) {
            match annexb::nal_type(unit[0]) {
                annexb::NAL_SPS => sps = Some(unit.to_vec()),
                annexb::NAL_PPS => pps = Some(unit.to_vec()),
                kind => {
                    if kind == annexb::NAL_IDR {
                        is_keyframe = true;
                    }
                    avcc.extend_from_slice(&(unit.len() as u32).to_be_bytes());
                    avcc.extend_from_slice(unit);
                }
            }
        }
        if let (Some(sps), Some(pps)) = (sps, pps) {
            self.parameter_sets = Some(ParameterSets { sps, pps });
        }

        Ok(Some(EncodedSample { avcc, is_keyframe }))
    }

    fn parameter_sets(&self) -> Option<ParameterSets> {
        self.parameter_sets.clone()
    }

    fn flush(&mut self) -> Result<Vec<EncodedSample>> {
        // The session encodes synchronously; nothing is ever held back.
        Ok(Vec::new())
    }

    fn stop(&mut self) {
        self.session = None;
    }
}

/// Software H.264 decoder session.
#[derive(Default)]
pub struct OpenH264Decoder {
    session: Option<Decoder>,
}

impl OpenH264Decoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl H264DecoderBackend for OpenH264Decoder {
    fn configure(&mut self, sps: &[u8], pps: &[u8]) -> Result<()> {
        let api = OpenH264API::from_source();
        let mut decoder = Decoder::with_api_config(api, DecoderConfig::new()).map_err(codec_err)?;

        // Prime the fresh session with the parameter sets in-band.
        let mut stream = Vec::with_capacity(sps.len() + pps.len() + 8);
        annexb::write_annexb(&mut stream, sps);
        annexb::write_annexb(&mut stream, pps);
        decoder.decode(&stream).map_err(codec_err)?;

        self.session = Some(decoder);
        Ok(())
    }

    fn decode(&mut self, avcc: &[u8], timestamp: u64) -> Result<Option<DecodedVideo>> {
        let decoder = self.session.as_mut().ok_or(BridgeError::NotStarted)?;
        let stream = annexb::from_avcc(avcc);
        match decoder.decode(&stream).map_err(codec_err)? {
            Some(yuv) => Ok(Some(DecodedVideo {
                image: bgra_from_yuv(&yuv),
                timestamp,
            })),
            None => Ok(None),
        }
    }

    fn stop(&mut self) {
        self.session = None;
    }
}

/// Owned I420 frame handed to the encoder.
struct I420Buffer {
    width: usize,
    height: usize,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
}

impl I420Buffer {
    fn chroma_width(width: usize) -> usize {
        width.div_ceil(2)
    }

    fn from_pixel_buffer(frame: &PixelBuffer) -> Result<Self> {
        match frame.format {
            PixelFormat::Bgra => Ok(Self::from_bgra(frame)),
            PixelFormat::I420 => Self::from_planes(frame),
            PixelFormat::Nv12 => Self::from_nv12(frame),
        }
    }

    fn from_bgra(frame: &PixelBuffer) -> Self {
        let width = frame.width as usize;
        let height = frame.height as usize;
        let plane = &frame.planes[0];
        let cw = Self::chroma_width(width);
        let ch = height.div_ceil(2);

        let mut y = vec![0u8; width * height];
        let mut u = vec![0u8; cw * ch];
        let mut v = vec![0u8; cw * ch];

        let sample = |px: usize, py: usize| -> (i32, i32, i32) {
            let at = py.min(height - 1) * plane.stride + px.min(width - 1) * 4;
            let b = plane.data[at] as i32;
            let g = plane.data[at + 1] as i32;
            let r = plane.data[at + 2] as i32;
            (r, g, b)
        };

        for py in 0..height {
            for px in 0..width {
                let (r, g, b) = sample(px, py);
                y[py * width + px] = (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8;
            }
        }
        // 2x2 chroma averaging.
        for cy in 0..ch {
            for cx in 0..cw {
                let mut us = 0i32;
                let mut vs = 0i32;
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (r, g, b) = sample(cx * 2 + dx, cy * 2 + dy);
                    us += ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
                    vs += ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
                }
                u[cy * cw + cx] = (us / 4).clamp(0, 255) as u8;
                v[cy * cw + cx] = (vs / 4).clamp(0, 255) as u8;
            }
        }

        Self { width, height, y, u, v }
    }

    fn from_planes(frame: &PixelBuffer) -> Result<Self> {
        if frame.planes.len() != 3 {
            return Err(BridgeError::Codec("I420 frame without 3 planes".into()));
        }
        let width = frame.width as usize;
        let height = frame.height as usize;
        let cw = Self::chroma_width(width);
        let ch = height.div_ceil(2);
        Ok(Self {
            width,
            height,
            y: copy_plane(&frame.planes[0], width, height),
            u: copy_plane(&frame.planes[1], cw, ch),
            v: copy_plane(&frame.planes[2], cw, ch),
        })
    }

    fn from_nv12(frame: &PixelBuffer) -> Result<Self> {
        if frame.planes.len() != 2 {
            return Err(BridgeError::Codec("NV12 frame without 2 planes".into()));
        }
        let width = frame.width as usize;
        let height = frame.height as usize;
        let cw = Self::chroma_width(width);
        let ch = height.div_ceil(2);
        let uv = &frame.planes[1];

        let mut u = vec![0u8; cw * ch];
        let mut v = vec![0u8; cw * ch];
        for cy in 0..ch {
            for cx in 0..cw {
                let at = cy * uv.stride + cx * 2;
                u[cy * cw + cx] = uv.data[at];
                v[cy * cw + cx] = uv.data[at + 1];
            }
        }

        Ok(Self {
            width,
            height,
            y: copy_plane(&frame.planes[0], width, height),
            u,
            v,
        })
    }
}

fn copy_plane(plane: &Plane, width: usize, height: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(width * height);
    for row in 0..height {
        let start = row * plane.stride;
        out.extend_from_slice(&plane.data[start..start + width]);
    }
    out
}

impl YUVSource for I420Buffer {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn strides(&self) -> (usize, usize, usize) {
        let cw = Self::chroma_width(self.width);
        (self.width, cw, cw)
    }

    fn y(&self) -> &[u8] {
        &self.y
    }

    fn u(&self) -> &[u8] {
        &self.u
    }

    fn v(&self) -> &[u8] {
        &self.v
    }
}

/// Convert a decoded YUV frame to the capture-default BGRA layout.
fn bgra_from_yuv<S: YUVSource>(src: &S) -> PixelBuffer {
    let (width, height) = src.dimensions();
    let (sy, su, sv) = src.strides();
    let y = src.y();
    let u = src.u();
    let v = src.v();

    let stride = width * 4;
    let mut data = vec![0u8; stride * height];
    for py in 0..height {
        for px in 0..width {
            let c = y[py * sy + px] as i32 - 16;
            let d = u[(py / 2) * su + px / 2] as i32 - 128;
            let e = v[(py / 2) * sv + px / 2] as i32 - 128;

            let r = ((298 * c + 409 * e + 128) >> 8).clamp(0, 255) as u8;
            let g = ((298 * c - 100 * d - 208 * e + 128) >> 8).clamp(0, 255) as u8;
            let b = ((298 * c + 516 * d + 128) >> 8).clamp(0, 255) as u8;

            let at = py * stride + px * 4;
            data[at] = b;
            data[at + 1] = g;
            data[at + 2] = r;
            data[at + 3] = 0xFF;
        }
    }

    PixelBuffer::bgra(width as u32, height as u32, stride, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bgra_gray_converts_to_midscale_yuv() {
        let frame = PixelBuffer::bgra(4, 4, 16, vec![128u8; 64]);
        let yuv = I420Buffer::from_pixel_buffer(&frame).unwrap();
        // Gray: Y near 126, chroma near neutral 128.
        assert!(yuv.y.iter().all(|&y| (120..=132).contains(&y)));
        assert!(yuv.u.iter().all(|&u| (124..=132).contains(&u)));
        assert!(yuv.v.iter().all(|&v| (124..=132).contains(&v)));
    }

    #[test]
    fn yuv_round_trip_stays_close() {
        let mut data = vec![0u8; 8 * 8 * 4];
        for (i, px) in data.chunks_mut(4).enumerate() {
            px[0] = (i * 7) as u8;
            px[1] = (i * 13) as u8;
            px[2] = (i * 29) as u8;
            px[3] = 0xFF;
        }
        let frame = PixelBuffer::bgra(8, 8, 32, data);
        let yuv = I420Buffer::from_pixel_buffer(&frame).unwrap();
        let back = bgra_from_yuv(&yuv);
        assert_eq!(back.width, 8);
        assert_eq!(back.height, 8);
        // Chroma subsampling loses detail; luma should track within a
        // coarse tolerance on average.
        let diff: i64 = frame.planes[0]
            .data
            .iter()
            .zip(&back.planes[0].data)
            .map(|(&a, &b)| (a as i64 - b as i64).abs())
            .sum();
        let mean = diff / (8 * 8 * 4);
        assert!(mean < 40, "mean channel error {}", mean);
    }

    #[test]
    fn odd_dimensions_handled() {
        let frame = PixelBuffer::bgra(5, 3, 20, vec![200u8; 60]);
        let yuv = I420Buffer::from_pixel_buffer(&frame).unwrap();
        assert_eq!(yuv.y.len(), 15);
        assert_eq!(yuv.u.len(), 3 * 2);
        let back = bgra_from_yuv(&yuv);
        assert_eq!((back.width, back.height), (5, 3));
    }
}
