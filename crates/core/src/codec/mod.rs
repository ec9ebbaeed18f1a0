//! H.264 codec adapters.
//!
//! The transport speaks Annex-B; host codecs commonly speak length-prefixed
//! AVCC with parameter sets held out-of-band. [`VideoEncoder`] and
//! [`VideoDecoder`] sit between the two: they own keyframe pacing, SPS/PPS
//! lifecycle, and bitstream conversion, and delegate the actual compression
//! to a platform backend behind [`H264EncoderBackend`] /
//! [`H264DecoderBackend`].

pub mod annexb;
pub mod decoder;
pub mod encoder;
#[cfg(feature = "openh264-backend")]
pub mod openh264;

use crate::error::Result;
use crate::source::PixelBuffer;

pub use decoder::{DecoderStats, VideoDecoder};
pub use encoder::{EncodedFrame, EncoderConfig, EncoderStats, Profile, VideoEncoder};

/// An encoder parameter that is either fixed by configuration or resolved
/// from the first input frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Setting {
    #[default]
    Auto,
    Fixed(u32),
}

impl Setting {
    /// The configured value, or `fallback` when auto.
    pub fn resolve(self, fallback: u32) -> u32 {
        match self {
            Self::Auto => fallback,
            Self::Fixed(value) => value,
        }
    }
}

/// Fully resolved parameters for one encode session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub width: u32,
    pub height: u32,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    pub bitrate_bps: u32,
    pub low_latency: bool,
    pub profile: Profile,
}

impl SessionParams {
    /// Frame duration in 100-ns ticks.
    pub fn frame_duration(&self) -> u64 {
        if self.frame_rate_num == 0 {
            return 0;
        }
        crate::protocol::TICKS_PER_SECOND * self.frame_rate_den as u64 / self.frame_rate_num as u64
    }
}

/// One compressed sample in AVCC form (4-byte length-prefixed NAL units,
/// parameter sets not included).
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub avcc: Vec<u8>,
    pub is_keyframe: bool,
}

/// Out-of-band H.264 parameter sets (raw NAL payloads, no start codes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

/// Platform H.264 encoder capability.
///
/// Sessions are single-threaded: the adapter calls from one thread at a
/// time. `encode` may return `None` while the backend is priming.
pub trait H264EncoderBackend: Send {
    /// Create the underlying session. Called once per resolved parameter
    /// set; a second call after [`stop`](Self::stop) re-creates the session.
    fn start(&mut self, params: &SessionParams) -> Result<()>;

    /// Compress one frame. `force_keyframe` requests an IDR for this frame.
    fn encode(
        &mut self,
        frame: &PixelBuffer,
        timestamp: u64,
        force_keyframe: bool,
    ) -> Result<Option<EncodedSample>>;

    /// Current parameter sets, available once the session has produced its
    /// first keyframe (often at `start` already).
    fn parameter_sets(&self) -> Option<ParameterSets>;

    /// Drain any frames the backend is still holding.
    fn flush(&mut self) -> Result<Vec<EncodedSample>>;

    /// Tear down the session. Idempotent.
    fn stop(&mut self);
}

/// One decompressed frame with its presentation timestamp.
#[derive(Debug, Clone)]
pub struct DecodedVideo {
    pub image: PixelBuffer,
    pub timestamp: u64,
}

/// Platform H.264 decoder capability.
pub trait H264DecoderBackend: Send {
    /// Create or re-create the decode session from out-of-band parameter
    /// sets. Called again whenever SPS or PPS change.
    fn configure(&mut self, sps: &[u8], pps: &[u8]) -> Result<()>;

    /// Decode one AVCC sample. `None` means the backend needs more input
    /// before it can emit.
    fn decode(&mut self, avcc: &[u8], timestamp: u64) -> Result<Option<DecodedVideo>>;

    /// Tear down the session. Idempotent.
    fn stop(&mut self);
}
