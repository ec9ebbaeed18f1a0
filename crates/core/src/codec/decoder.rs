//! Decoder adapter: Annex-B parsing, SPS/PPS lifecycle, lazy session
//! creation.

use super::{annexb, DecodedVideo, H264DecoderBackend};

/// Counters exposed for the once-per-second stats line.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderStats {
    pub payloads_in: u64,
    pub frames_out: u64,
    pub parameter_updates: u64,
    pub errors: u64,
}

/// Adapter from Annex-B transport payloads to decoded pixel buffers.
///
/// NAL units are routed by type: SPS and PPS update the stored parameter
/// sets, everything else is forwarded to the backend in AVCC form. The
/// backend session is created lazily once both parameter sets are known,
/// and re-created whenever either of them changes mid-stream.
pub struct VideoDecoder {
    backend: Box<dyn H264DecoderBackend>,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    session_ready: bool,
    stats: DecoderStats,
}

impl VideoDecoder {
    pub fn new(backend: Box<dyn H264DecoderBackend>) -> Self {
        Self {
            backend,
            sps: None,
            pps: None,
            session_ready: false,
            stats: DecoderStats::default(),
        }
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    /// Whether a decode session currently exists.
    pub fn is_ready(&self) -> bool {
        self.session_ready
    }

    /// Decode one Annex-B payload.
    ///
    /// Returns every frame the backend emitted for it (usually zero or
    /// one). Backend failures drop the affected sample and are counted;
    /// they never propagate.
    pub fn decode(&mut self, payload: &[u8], timestamp: u64) -> Vec<DecodedVideo> {
        self.stats.payloads_in += 1;
        let mut out = Vec::new();

        for unit in annexb::split_nal_units(payload) {
            if unit.is_empty() {
                continue;
            }
            match annexb::nal_type(unit[0]) {
                annexb::NAL_SPS => self.update_sps(unit),
                annexb::NAL_PPS => self.update_pps(unit),
                // IDR, non-IDR, SEI, and anything unknown all go to the
                // backend; it decides what it can use.
                _ => {
                    if !self.ensure_session() {
                        tracing::debug!("dropping NAL before first SPS/PPS");
                        continue;
                    }
                    let mut avcc = Vec::with_capacity(4 + unit.len());
                    avcc.extend_from_slice(&(unit.len() as u32).to_be_bytes());
                    avcc.extend_from_slice(unit);
                    match self.backend.decode(&avcc, timestamp) {
                        Ok(Some(frame)) => {
                            self.stats.frames_out += 1;
                            out.push(frame);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            self.stats.errors += 1;
                            tracing::warn!(error = %e, "decode failed, frame dropped");
                        }
                    }
                }
            }
        }

        out
    }

    /// Drop the session and stored parameter sets.
    pub fn reset(&mut self) {
        self.backend.stop();
        self.sps = None;
        self.pps = None;
        self.session_ready = false;
    }

    fn update_sps(&mut self, unit: &[u8]) {
        if self.sps.as_deref() == Some(unit) {
            return;
        }
        let changed = self.sps.is_some();
        self.sps = Some(unit.to_vec());
        self.stats.parameter_updates += 1;
        if changed {
            tracing::info!("SPS changed, invalidating decode session");
            self.invalidate_session();
        }
    }

    fn update_pps(&mut self, unit: &[u8]) {
        if self.pps.as_deref() == Some(unit) {
            return;
        }
        let changed = self.pps.is_some();
        self.pps = Some(unit.to_vec());
        self.stats.parameter_updates += 1;
        if changed {
            tracing::info!("PPS changed, invalidating decode session");
            self.invalidate_session();
        }
    }

    fn invalidate_session(&mut self) {
        if self.session_ready {
            self.backend.stop();
            self.session_ready = false;
        }
    }

    /// Create the backend session if both parameter sets are known.
    /// Returns whether a session exists afterwards.
    fn ensure_session(&mut self) -> bool {
        if self.session_ready {
            return true;
        }
        let (Some(sps), Some(pps)) = (self.sps.as_deref(), self.pps.as_deref()) else {
            return false;
        };
        match self.backend.configure(sps, pps) {
            Ok(()) => {
                self.session_ready = true;
                tracing::info!("decode session created");
                true
            }
            Err(e) => {
                self.stats.errors += 1;
                tracing::warn!(error = %e, "decoder configure failed");
                false
            }
        }
    }
}

impl Drop for VideoDecoder {
    fn drop(&mut self) {
        self.backend.stop();
    }
}
