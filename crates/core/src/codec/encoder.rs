//! Encoder adapter: keyframe pacing, parameter-set injection, AVCC to
//! Annex-B conversion.

use super::{annexb, EncodedSample, H264EncoderBackend, SessionParams, Setting};
use crate::error::Result;
use crate::source::PixelBuffer;

/// H.264 profile requested from the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    Baseline,
    Main,
    #[default]
    High,
}

/// Encoder configuration.
///
/// `width`, `height`, and `frame_rate` may be [`Setting::Auto`], in which
/// case they are resolved from the first captured frame before the backend
/// session is created.
#[derive(Debug, Clone, Copy)]
pub struct EncoderConfig {
    pub width: Setting,
    pub height: Setting,
    pub bitrate_bps: u32,
    /// A keyframe is produced at least every this many frames. Zero means
    /// only the first frame and explicit requests.
    pub keyframe_interval: u32,
    /// Frames per second; auto falls back to 60.
    pub frame_rate: Setting,
    pub low_latency: bool,
    pub profile: Profile,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: Setting::Auto,
            height: Setting::Auto,
            bitrate_bps: 10_000_000,
            keyframe_interval: 60,
            frame_rate: Setting::Auto,
            low_latency: true,
            profile: Profile::default(),
        }
    }
}

const DEFAULT_FRAME_RATE: u32 = 60;

/// One encoded frame in transport form.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Annex-B payload. Keyframes start with SPS and PPS NAL units.
    pub annexb: Vec<u8>,
    pub is_keyframe: bool,
    pub timestamp: u64,
    /// Frame duration in 100-ns ticks (0 when the rate is unknown).
    pub duration: u64,
}

/// Counters exposed for the once-per-second stats line.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncoderStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub keyframes: u64,
    pub bytes_out: u64,
    pub errors: u64,
}

/// Adapter from pixel buffers to Annex-B H.264.
///
/// The backend session is created lazily from the first frame so that
/// auto-configured dimensions track whatever the source actually delivers.
/// A mid-stream resolution change tears the session down and re-creates it.
pub struct VideoEncoder {
    backend: Box<dyn H264EncoderBackend>,
    config: EncoderConfig,
    session: Option<SessionParams>,
    frame_count: u64,
    force_next_keyframe: bool,
    stats: EncoderStats,
}

impl VideoEncoder {
    pub fn new(backend: Box<dyn H264EncoderBackend>, config: EncoderConfig) -> Self {
        Self {
            backend,
            config,
            session: None,
            frame_count: 0,
            force_next_keyframe: false,
            stats: EncoderStats::default(),
        }
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    /// Request that the next encoded frame be a keyframe.
    pub fn force_keyframe(&mut self) {
        self.force_next_keyframe = true;
    }

    /// Resolved session parameters, once the first frame has been seen.
    pub fn session_params(&self) -> Option<SessionParams> {
        self.session
    }

    /// Encode one frame.
    ///
    /// Returns `Ok(None)` while the backend is priming. Encode failures are
    /// fatal to this frame only; the error is returned for the caller to
    /// log and the session stays usable.
    pub fn encode(&mut self, frame: &PixelBuffer, timestamp: u64) -> Result<Option<EncodedFrame>> {
        self.ensure_session(frame)?;
        self.stats.frames_in += 1;

        let interval = self.config.keyframe_interval as u64;
        let scheduled = self.frame_count == 0 || (interval > 0 && self.frame_count % interval == 0);
        let want_keyframe = scheduled || self.force_next_keyframe;

        let index = self.frame_count;
        self.frame_count += 1;
        if want_keyframe {
            self.force_next_keyframe = false;
        }

        let sample = match self.backend.encode(frame, timestamp, want_keyframe) {
            Ok(Some(sample)) => sample,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.stats.errors += 1;
                tracing::warn!(frame = index, error = %e, "encode failed, frame skipped");
                return Err(e);
            }
        };

        let duration = self.session.map(|s| s.frame_duration()).unwrap_or(0);
        Ok(Some(self.to_transport(sample, timestamp, duration)))
    }

    /// Drain frames the backend is still holding.
    pub fn flush(&mut self) -> Result<Vec<EncodedFrame>> {
        let duration = self.session.map(|s| s.frame_duration()).unwrap_or(0);
        let drained = self.backend.flush()?;
        Ok(drained
            .into_iter()
            .map(|sample| self.to_transport(sample, 0, duration))
            .collect())
    }

    /// Tear down the backend session. Encoding after this re-creates it.
    pub fn shutdown(&mut self) {
        if self.session.take().is_some() {
            self.backend.stop();
        }
    }

    fn ensure_session(&mut self, frame: &PixelBuffer) -> Result<()> {
        if let Some(session) = self.session {
            if session.width == frame.width && session.height == frame.height {
                return Ok(());
            }
            tracing::info!(
                old_width = session.width,
                old_height = session.height,
                new_width = frame.width,
                new_height = frame.height,
                "input resolution changed, restarting encode session"
            );
            self.backend.stop();
            self.session = None;
            self.frame_count = 0;
        }

        let params = SessionParams {
            width: self.config.width.resolve(frame.width),
            height: self.config.height.resolve(frame.height),
            frame_rate_num: self.config.frame_rate.resolve(DEFAULT_FRAME_RATE),
            frame_rate_den: 1,
            bitrate_bps: self.config.bitrate_bps,
            low_latency: self.config.low_latency,
            profile: self.config.profile,
        };
        self.backend.start(&params)?;
        self.session = Some(params);
        tracing::info!(
            width = params.width,
            height = params.height,
            fps = params.frame_rate_num,
            bitrate = params.bitrate_bps,
            "encode session started"
        );
        Ok(())
    }

    /// Convert a backend sample to the transport payload: Annex-B, with SPS
    /// and PPS prefixed on keyframes.
    fn to_transport(&mut self, sample: EncodedSample, timestamp: u64, duration: u64) -> EncodedFrame {
        let body = annexb::from_avcc(&sample.avcc);
        let annexb_payload = if sample.is_keyframe {
            match self.backend.parameter_sets() {
                Some(sets) => {
                    let mut out =
                        Vec::with_capacity(8 + sets.sps.len() + sets.pps.len() + body.len());
                    annexb::write_annexb(&mut out, &sets.sps);
                    annexb::write_annexb(&mut out, &sets.pps);
                    out.extend_from_slice(&body);
                    out
                }
                None => {
                    tracing::warn!("keyframe without parameter sets from backend");
                    body
                }
            }
        } else {
            body
        };

        self.stats.frames_out += 1;
        self.stats.bytes_out += annexb_payload.len() as u64;
        if sample.is_keyframe {
            self.stats.keyframes += 1;
        }

        EncodedFrame {
            annexb: annexb_payload,
            is_keyframe: sample.is_keyframe,
            timestamp,
            duration,
        }
    }
}

impl Drop for VideoEncoder {
    fn drop(&mut self) {
        self.shutdown();
    }
}
