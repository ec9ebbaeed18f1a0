//! Capability interfaces to the local media fabric.
//!
//! The bridge core never talks to the media library or the platform codec
//! directly; it talks to the three contracts here ([`SourceCapture`],
//! [`SourceOutput`], and the codec backends in [`crate::codec`]).
//! Platform implementations live outside the core; the in-tree
//! [`loopback`] fabric implements the same contracts for tests, demos, and
//! single-machine use.

pub mod loopback;

use std::time::Duration;

use crate::error::Result;

/// A source visible on the local discovery fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    /// Human-readable source name, used for selection and exclusion.
    pub name: String,
    /// Fabric-specific locator, when the implementation has one.
    pub address: Option<String>,
}

impl SourceDescriptor {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: None,
        }
    }
}

/// Pixel layout of a [`PixelBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit BGRA, one plane. The default capture format.
    Bgra,
    /// Planar 4:2:0 YUV, three planes (Y, U, V).
    I420,
    /// Biplanar 4:2:0 YUV, two planes (Y, interleaved UV).
    Nv12,
}

/// One plane of image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    /// Bytes per row.
    pub stride: usize,
    pub data: Vec<u8>,
}

/// An owned image buffer.
///
/// Decoded buffers handed out by codec backends are conceptually drawn from
/// a recycled pool; any consumer that defers presentation must take
/// ownership via [`deep_copy`](Self::deep_copy) rather than holding the
/// original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<Plane>,
}

impl PixelBuffer {
    /// Single-plane 8-bit BGRA buffer.
    pub fn bgra(width: u32, height: u32, stride: usize, data: Vec<u8>) -> Self {
        Self {
            format: PixelFormat::Bgra,
            width,
            height,
            planes: vec![Plane { stride, data }],
        }
    }

    /// Copy every plane into freshly owned storage, preserving format,
    /// dimensions, and per-plane stride.
    pub fn deep_copy(&self) -> Self {
        let mut planes = Vec::with_capacity(self.planes.len());
        for plane in &self.planes {
            planes.push(Plane {
                stride: plane.stride,
                data: plane.data.clone(),
            });
        }
        Self {
            format: self.format,
            width: self.width,
            height: self.height,
            planes,
        }
    }
}

/// One captured or received audio frame: planar 32-bit-float PCM.
///
/// `data` holds all samples of channel 0, then all samples of channel 1,
/// and so on; `data.len() == channels * samples_per_channel() * 4`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub data: Vec<u8>,
    pub timestamp: u64,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioFrame {
    pub fn samples_per_channel(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.data.len() / 4 / self.channels as usize
    }
}

/// Consumer of capture callbacks.
///
/// Methods are invoked on the capture implementation's own thread. After
/// [`SourceCapture::stop`] returns, no further invocations happen.
pub trait CaptureSink: Send {
    fn on_video(&mut self, frame: PixelBuffer, timestamp: u64, frame_number: u64);
    fn on_audio(&mut self, frame: AudioFrame);
    /// The source went away; the orchestrator decides whether to reconnect.
    fn on_disconnect(&mut self, reason: Option<String>);
}

/// Capture side of the media fabric.
pub trait SourceCapture: Send {
    /// Acquire whatever process-wide resources the fabric needs.
    fn initialize(&mut self) -> Result<()>;

    /// Enumerate sources, waiting up to `timeout` for the fabric to settle.
    fn discover(&mut self, timeout: Duration) -> Result<Vec<SourceDescriptor>>;

    /// Bind to one discovered source.
    fn connect(&mut self, source: &SourceDescriptor) -> Result<()>;

    /// Start the capture thread; `sink` receives every frame until
    /// [`stop`](Self::stop).
    fn start_capture(&mut self, sink: Box<dyn CaptureSink>) -> Result<()>;

    /// Stop capturing and join the capture thread. Idempotent; guarantees
    /// no sink invocation after it returns.
    fn stop(&mut self);
}

/// Output side of the media fabric: republishes a stream under a local name.
pub trait SourceOutput: Send {
    /// Announce the output with its initial video mode.
    fn start(&mut self, width: u32, height: u32) -> Result<()>;

    fn send_video(&mut self, frame: &PixelBuffer, timestamp: u64) -> Result<()>;

    fn send_audio(&mut self, frame: &AudioFrame) -> Result<()>;

    /// The incoming stream's resolution changed; adjust announced framing.
    fn set_resolution(&mut self, width: u32, height: u32);

    /// Withdraw the output. Idempotent.
    fn stop(&mut self);
}
