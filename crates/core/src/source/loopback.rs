//! In-process loopback fabric.
//!
//! A process-wide registry where every started [`LoopbackOutput`] appears
//! as a capturable source, mirroring how the real media library's discovery
//! behaves on a single machine. The integration suite, the demo CLI, and
//! single-machine bridges all run against it; platform fabrics implement
//! the same traits out of tree.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use super::{AudioFrame, CaptureSink, PixelBuffer, SourceCapture, SourceDescriptor, SourceOutput};
use crate::error::{BridgeError, Result};

/// Events queued on a channel ahead of its (single) consumer.
const CHANNEL_DEPTH: usize = 64;

/// Poll interval for discovery and the capture drain loop.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum ChannelEvent {
    Video {
        frame: PixelBuffer,
        timestamp: u64,
        number: u64,
    },
    Audio(AudioFrame),
}

/// One named stream on the fabric: an output publishes into it, at most one
/// capture drains it.
struct Channel {
    name: String,
    queue: Mutex<VecDeque<ChannelEvent>>,
    available: Condvar,
    closed: AtomicBool,
}

impl Channel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn publish(&self, event: ChannelEvent) {
        let mut queue = self.queue.lock();
        if queue.len() >= CHANNEL_DEPTH {
            // No consumer, or a slow one; oldest frame loses.
            queue.pop_front();
            tracing::trace!(channel = %self.name, "loopback queue full, oldest dropped");
        }
        queue.push_back(event);
        self.available.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.available.notify_all();
    }
}

/// Process-wide channel registry with its init/teardown pair.
#[derive(Default)]
struct Fabric {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

fn fabric() -> &'static Fabric {
    static FABRIC: OnceLock<Fabric> = OnceLock::new();
    FABRIC.get_or_init(Fabric::default)
}

/// Acquire the fabric. Idempotent; call before starting any orchestrator.
pub fn initialize() {
    let _ = fabric();
    tracing::debug!("loopback fabric ready");
}

/// Tear the fabric down: close and remove every channel. Call after all
/// orchestrators have stopped.
pub fn shutdown() {
    let mut channels = fabric().channels.write();
    for channel in channels.values() {
        channel.close();
    }
    let removed = channels.len();
    channels.clear();
    tracing::debug!(removed, "loopback fabric shut down");
}

/// Republishes a received stream as a named source on the fabric.
pub struct LoopbackOutput {
    name: String,
    channel: Option<Arc<Channel>>,
    resolution: (u32, u32),
    frames_published: u64,
}

impl LoopbackOutput {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            channel: None,
            resolution: (0, 0),
            frames_published: 0,
        }
    }
}

impl SourceOutput for LoopbackOutput {
    fn start(&mut self, width: u32, height: u32) -> Result<()> {
        let channel = Arc::new(Channel::new(&self.name));
        let mut channels = fabric().channels.write();
        if channels.contains_key(&self.name) {
            return Err(BridgeError::OutputUnavailable(format!(
                "name already registered: {}",
                self.name
            )));
        }
        channels.insert(self.name.clone(), channel.clone());
        self.channel = Some(channel);
        self.resolution = (width, height);
        tracing::info!(name = %self.name, width, height, "loopback output registered");
        Ok(())
    }

    fn send_video(&mut self, frame: &PixelBuffer, timestamp: u64) -> Result<()> {
        let channel = self.channel.as_ref().ok_or(BridgeError::NotStarted)?;
        let number = self.frames_published;
        self.frames_published += 1;
        channel.publish(ChannelEvent::Video {
            frame: frame.deep_copy(),
            timestamp,
            number,
        });
        Ok(())
    }

    fn send_audio(&mut self, frame: &AudioFrame) -> Result<()> {
        let channel = self.channel.as_ref().ok_or(BridgeError::NotStarted)?;
        channel.publish(ChannelEvent::Audio(frame.clone()));
        Ok(())
    }

    fn set_resolution(&mut self, width: u32, height: u32) {
        self.resolution = (width, height);
        tracing::info!(name = %self.name, width, height, "loopback output resolution updated");
    }

    fn stop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
            fabric().channels.write().remove(&self.name);
            tracing::info!(name = %self.name, frames = self.frames_published, "loopback output withdrawn");
        }
    }
}

impl Drop for LoopbackOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Captures a named source from the fabric.
pub struct LoopbackCapture {
    connected: Option<Arc<Channel>>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl LoopbackCapture {
    pub fn new() -> Self {
        Self {
            connected: None,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl Default for LoopbackCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceCapture for LoopbackCapture {
    fn initialize(&mut self) -> Result<()> {
        initialize();
        Ok(())
    }

    fn discover(&mut self, timeout: Duration) -> Result<Vec<SourceDescriptor>> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut names: Vec<String> = fabric().channels.read().keys().cloned().collect();
            if !names.is_empty() || Instant::now() >= deadline {
                names.sort();
                return Ok(names
                    .into_iter()
                    .map(|name| SourceDescriptor::named(&name))
                    .collect());
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn connect(&mut self, source: &SourceDescriptor) -> Result<()> {
        let channel = fabric()
            .channels
            .read()
            .get(&source.name)
            .cloned()
            .ok_or_else(|| BridgeError::SourceNotFound(source.name.clone()))?;
        tracing::info!(name = %source.name, "loopback capture connected");
        self.connected = Some(channel);
        Ok(())
    }

    fn start_capture(&mut self, mut sink: Box<dyn CaptureSink>) -> Result<()> {
        if self.worker.is_some() {
            return Err(BridgeError::AlreadyRunning);
        }
        let channel = self.connected.clone().ok_or(BridgeError::NotStarted)?;
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();

        let worker = thread::Builder::new()
            .name("loopback-capture".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    let mut drained: Vec<ChannelEvent> = Vec::new();
                    {
                        let mut queue = channel.queue.lock();
                        if queue.is_empty() {
                            if channel.closed.load(Ordering::SeqCst) {
                                drop(queue);
                                sink.on_disconnect(None);
                                return;
                            }
                            let _ = channel.available.wait_for(&mut queue, POLL_INTERVAL);
                        }
                        drained.extend(queue.drain(..));
                    }
                    for event in drained {
                        match event {
                            ChannelEvent::Video {
                                frame,
                                timestamp,
                                number,
                            } => sink.on_video(frame, timestamp, number),
                            ChannelEvent::Audio(frame) => sink.on_audio(frame),
                        }
                    }
                }
            })?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for LoopbackCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Publishes a synthetic moving-bars + sine-tone source on the fabric.
///
/// Handy for demos and for exercising a bridge with no real capture
/// hardware attached.
pub struct TestPattern {
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl TestPattern {
    pub fn publish(name: &str, width: u32, height: u32, fps: u32) -> Result<Self> {
        let mut output = LoopbackOutput::new(name);
        output.start(width, height)?;

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let fps = fps.max(1);

        let worker = thread::Builder::new()
            .name("test-pattern".to_string())
            .spawn(move || {
                let frame_ticks = crate::protocol::TICKS_PER_SECOND / fps as u64;
                let samples_per_frame = (48_000 / fps) as usize;
                let period = Duration::from_nanos(1_000_000_000 / fps as u64);
                let mut next = Instant::now();
                let mut index = 0u64;

                while flag.load(Ordering::SeqCst) {
                    let timestamp = index * frame_ticks;
                    let frame = bars_frame(width, height, index);
                    let _ = output.send_video(&frame, timestamp);
                    let audio = sine_frame(samples_per_frame, index, timestamp);
                    let _ = output.send_audio(&audio);

                    index += 1;
                    next += period;
                    let now = Instant::now();
                    if next > now {
                        thread::sleep(next - now);
                    } else {
                        next = now;
                    }
                }
                output.stop();
            })?;

        Ok(Self {
            running,
            worker: Some(worker),
        })
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for TestPattern {
    fn drop(&mut self) {
        self.stop();
    }
}

/// BGRA color bars, scrolling one bar-width every 32 frames.
fn bars_frame(width: u32, height: u32, index: u64) -> PixelBuffer {
    const BARS: [[u8; 4]; 7] = [
        [0xFF, 0xFF, 0xFF, 0xFF], // white
        [0x00, 0xFF, 0xFF, 0xFF], // yellow
        [0xFF, 0xFF, 0x00, 0xFF], // cyan
        [0x00, 0xFF, 0x00, 0xFF], // green
        [0xFF, 0x00, 0xFF, 0xFF], // magenta
        [0x00, 0x00, 0xFF, 0xFF], // red
        [0xFF, 0x00, 0x00, 0xFF], // blue
    ];
    let stride = width as usize * 4;
    let mut data = vec![0u8; stride * height as usize];
    let bar_width = (width as usize / BARS.len()).max(1);
    let shift = (index / 32) as usize;
    for y in 0..height as usize {
        for x in 0..width as usize {
            let bar = (x / bar_width + shift) % BARS.len();
            let at = y * stride + x * 4;
            data[at..at + 4].copy_from_slice(&BARS[bar]);
        }
    }
    PixelBuffer::bgra(width, height, stride, data)
}

/// One frame of planar stereo 440 Hz sine at 48 kHz.
fn sine_frame(samples: usize, index: u64, timestamp: u64) -> AudioFrame {
    let mut data = Vec::with_capacity(samples * 2 * 4);
    let base = index as usize * samples;
    for channel in 0..2 {
        for s in 0..samples {
            let t = (base + s) as f32 / 48_000.0;
            let amplitude = if channel == 0 { 0.25 } else { 0.20 };
            let value = amplitude * (t * 440.0 * 2.0 * std::f32::consts::PI).sin();
            data.extend_from_slice(&value.to_le_bytes());
        }
    }
    AudioFrame {
        data,
        timestamp,
        sample_rate: 48_000,
        channels: 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Sink that records what it sees behind a shared handle.
    #[derive(Default)]
    struct Recorded {
        video: Vec<(u64, u64)>, // (timestamp, frame number)
        audio: Vec<u64>,
        disconnects: usize,
    }

    struct RecordingSink(Arc<StdMutex<Recorded>>);

    impl CaptureSink for RecordingSink {
        fn on_video(&mut self, _frame: PixelBuffer, timestamp: u64, frame_number: u64) {
            self.0.lock().unwrap().video.push((timestamp, frame_number));
        }
        fn on_audio(&mut self, frame: AudioFrame) {
            self.0.lock().unwrap().audio.push(frame.timestamp);
        }
        fn on_disconnect(&mut self, _reason: Option<String>) {
            self.0.lock().unwrap().disconnects += 1;
        }
    }

    fn wait_until(deadline_ms: u64, mut probe: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_millis(deadline_ms);
        while Instant::now() < deadline {
            if probe() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn output_appears_in_discovery() {
        let mut output = LoopbackOutput::new("Disco Test");
        output.start(64, 36).unwrap();

        let mut capture = LoopbackCapture::new();
        capture.initialize().unwrap();
        let sources = capture.discover(Duration::from_millis(100)).unwrap();
        assert!(sources.iter().any(|s| s.name == "Disco Test"));

        output.stop();
        let sources = capture.discover(Duration::ZERO).unwrap();
        assert!(!sources.iter().any(|s| s.name == "Disco Test"));
    }

    #[test]
    fn duplicate_output_name_rejected() {
        let mut first = LoopbackOutput::new("Dup Name");
        first.start(64, 36).unwrap();
        let mut second = LoopbackOutput::new("Dup Name");
        assert!(matches!(
            second.start(64, 36),
            Err(BridgeError::OutputUnavailable(_))
        ));
        first.stop();
    }

    #[test]
    fn frames_flow_output_to_capture() {
        let mut output = LoopbackOutput::new("Flow Test");
        output.start(4, 4).unwrap();

        let mut capture = LoopbackCapture::new();
        capture.initialize().unwrap();
        capture.connect(&SourceDescriptor::named("Flow Test")).unwrap();

        let seen = Arc::new(StdMutex::new(Recorded::default()));
        capture
            .start_capture(Box::new(RecordingSink(seen.clone())))
            .unwrap();

        let frame = PixelBuffer::bgra(4, 4, 16, vec![0; 64]);
        for i in 0..5u64 {
            output.send_video(&frame, i * 100).unwrap();
        }
        output
            .send_audio(&AudioFrame {
                data: vec![0; 32],
                timestamp: 999,
                sample_rate: 48_000,
                channels: 2,
            })
            .unwrap();

        assert!(wait_until(500, || {
            let got = seen.lock().unwrap();
            got.video.len() == 5 && got.audio.len() == 1
        }));

        let got = seen.lock().unwrap();
        assert_eq!(got.video[0], (0, 0));
        assert_eq!(got.video[4], (400, 4));
        assert_eq!(got.audio[0], 999);
        drop(got);

        capture.stop();
        output.stop();
    }

    #[test]
    fn output_stop_disconnects_capture() {
        let mut output = LoopbackOutput::new("Gone Test");
        output.start(4, 4).unwrap();

        let mut capture = LoopbackCapture::new();
        capture.connect(&SourceDescriptor::named("Gone Test")).unwrap();
        let seen = Arc::new(StdMutex::new(Recorded::default()));
        capture
            .start_capture(Box::new(RecordingSink(seen.clone())))
            .unwrap();

        output.stop();
        assert!(wait_until(500, || seen.lock().unwrap().disconnects == 1));
        capture.stop();
    }

    #[test]
    fn connect_to_missing_source_fails() {
        let mut capture = LoopbackCapture::new();
        assert!(matches!(
            capture.connect(&SourceDescriptor::named("No Such Thing")),
            Err(BridgeError::SourceNotFound(_))
        ));
    }

    #[test]
    fn stop_is_idempotent_and_halts_callbacks() {
        let mut output = LoopbackOutput::new("Halt Test");
        output.start(4, 4).unwrap();
        let mut capture = LoopbackCapture::new();
        capture.connect(&SourceDescriptor::named("Halt Test")).unwrap();
        let seen = Arc::new(StdMutex::new(Recorded::default()));
        capture
            .start_capture(Box::new(RecordingSink(seen.clone())))
            .unwrap();

        capture.stop();
        capture.stop();

        let frame = PixelBuffer::bgra(4, 4, 16, vec![0; 64]);
        output.send_video(&frame, 1).unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(seen.lock().unwrap().video.is_empty());
        output.stop();
    }

    #[test]
    fn test_pattern_publishes_frames() {
        let mut pattern = TestPattern::publish("Pattern Test", 32, 18, 30).unwrap();

        let mut capture = LoopbackCapture::new();
        capture.connect(&SourceDescriptor::named("Pattern Test")).unwrap();
        let seen = Arc::new(StdMutex::new(Recorded::default()));
        capture
            .start_capture(Box::new(RecordingSink(seen.clone())))
            .unwrap();

        assert!(wait_until(1000, || {
            let got = seen.lock().unwrap();
            got.video.len() >= 3 && got.audio.len() >= 3
        }));

        capture.stop();
        pattern.stop();
    }
}
