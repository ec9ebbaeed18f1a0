//! Join orchestrator: receive, reassemble, decode, republish.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::buffer::DelayBuffer;
use crate::codec::{H264DecoderBackend, VideoDecoder};
use crate::error::{BridgeError, Result};
use crate::protocol::{split_datagram, MediaType, Reassembler, DEFAULT_PORT};
use crate::source::{AudioFrame, SourceOutput};

/// Blocking-read slice so the receive thread observes shutdown promptly.
const RECV_TIMEOUT: Duration = Duration::from_millis(250);

/// Output pump cadence in buffered mode.
const PUMP_INTERVAL: Duration = Duration::from_millis(1);

/// Initial video mode announced before the first frame decodes.
const INITIAL_RESOLUTION: (u32, u32) = (1920, 1080);

/// Join endpoint configuration.
#[derive(Debug, Clone)]
pub struct JoinConfig {
    pub port: u16,
    /// Name the republished stream appears under on the local fabric.
    pub output_name: String,
    /// Presentation delay; zero means real-time (the delay buffer is
    /// bypassed entirely).
    pub buffer: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            output_name: "NDI Bridge".to_string(),
            buffer: Duration::ZERO,
        }
    }
}

type SharedOutput = Arc<Mutex<Box<dyn SourceOutput>>>;

/// The receiver endpoint: wires `UDP -> Reassembler -> VideoDecoder ->
/// SourceOutput`, with the delay buffer in between when configured.
///
/// One thread blocks on the socket and runs reassembly plus decode; in
/// buffered mode a second thread pumps due entries to the output.
pub struct Join {
    config: JoinConfig,
    running: Arc<AtomicBool>,
    output: Option<SharedOutput>,
    recv_worker: Option<JoinHandle<()>>,
    pump_worker: Option<JoinHandle<()>>,
}

impl Join {
    pub fn new(config: JoinConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            output: None,
            recv_worker: None,
            pump_worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bind the port, announce the output, and start receiving.
    ///
    /// Setup failures (port in use, output rejected) are returned directly;
    /// once this returns `Ok`, hot-path failures are logged and counted but
    /// never abort the loops.
    pub fn start(
        &mut self,
        mut output: Box<dyn SourceOutput>,
        decoder_backend: Box<dyn H264DecoderBackend>,
    ) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }

        let socket = UdpSocket::bind(("0.0.0.0", self.config.port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        output.start(INITIAL_RESOLUTION.0, INITIAL_RESOLUTION.1)?;

        let output: SharedOutput = Arc::new(Mutex::new(output));
        self.output = Some(output.clone());

        let delay = if self.config.buffer.is_zero() {
            None
        } else {
            Some(Arc::new(DelayBuffer::new(self.config.buffer)))
        };

        self.running.store(true, Ordering::SeqCst);

        if let Some(delay) = delay.clone() {
            let pump_output = output.clone();
            let running = self.running.clone();
            let pump = thread::Builder::new().name("join-pump".to_string()).spawn(move || {
                pump_loop(delay, pump_output, running);
            })?;
            self.pump_worker = Some(pump);
            tracing::info!(delay_ms = self.config.buffer.as_millis() as u64, "delay buffer enabled");
        }

        let running = self.running.clone();
        let recv = thread::Builder::new().name("join-recv".to_string()).spawn(move || {
            recv_loop(socket, output, delay, decoder_backend, running);
        })?;
        self.recv_worker = Some(recv);

        tracing::info!(port = self.config.port, output = %self.config.output_name, "join listening");
        Ok(())
    }

    /// Stop receiving and join all threads. Idempotent; no output call
    /// happens after this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.recv_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.pump_worker.take() {
            let _ = worker.join();
        }
        if let Some(output) = self.output.take() {
            output.lock().stop();
        }
        tracing::info!("join stopped");
    }
}

impl Drop for Join {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 1-ms cadence moving due entries from the delay buffer to the output.
fn pump_loop(delay: Arc<DelayBuffer>, output: SharedOutput, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        thread::sleep(PUMP_INTERVAL);
        let batch = delay.dequeue_ready();
        if batch.is_empty() {
            continue;
        }
        let mut output = output.lock();
        for (frame, timestamp) in &batch.video {
            if let Err(e) = output.send_video(frame, *timestamp) {
                tracing::warn!(error = %e, "buffered video output failed");
            }
        }
        for frame in &batch.audio {
            if let Err(e) = output.send_audio(frame) {
                tracing::warn!(error = %e, "buffered audio output failed");
            }
        }
    }
    delay.flush();
}

struct RecvState {
    video: Reassembler,
    audio: Reassembler,
    decoder: VideoDecoder,
    resolution: Option<(u32, u32)>,
    packets: u64,
    bad_datagrams: u64,
    audio_frames: u64,
}

/// Socket loop: demultiplex datagrams, reassemble, decode, deliver.
fn recv_loop(
    socket: UdpSocket,
    output: SharedOutput,
    delay: Option<Arc<DelayBuffer>>,
    decoder_backend: Box<dyn H264DecoderBackend>,
    running: Arc<AtomicBool>,
) {
    let mut state = RecvState {
        video: Reassembler::new("video"),
        audio: Reassembler::new("audio"),
        decoder: VideoDecoder::new(decoder_backend),
        resolution: None,
        packets: 0,
        bad_datagrams: 0,
        audio_frames: 0,
    };
    let mut buf = vec![0u8; 65536];
    let mut last_log = Instant::now();

    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, _from)) => {
                state.packets += 1;
                handle_datagram(&buf[..len], &mut state, &output, delay.as_deref());
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "receive failed");
                }
            }
        }

        if last_log.elapsed() >= Duration::from_secs(1) {
            let video_stats = state.video.stats();
            tracing::info!(
                packets = state.packets,
                bad = state.bad_datagrams,
                video_frames = video_stats.frames_completed,
                video_dropped = video_stats.frames_dropped,
                audio_frames = state.audio_frames,
                decoded = state.decoder.stats().frames_out,
                "link stats"
            );
            last_log = Instant::now();
        }
    }
}

fn handle_datagram(
    datagram: &[u8],
    state: &mut RecvState,
    output: &SharedOutput,
    delay: Option<&DelayBuffer>,
) {
    let (header, payload) = match split_datagram(datagram) {
        Ok(parts) => parts,
        Err(e) => {
            // Not ours, or mangled; count it and move on.
            state.bad_datagrams += 1;
            tracing::debug!(error = %e, "datagram discarded");
            return;
        }
    };

    match header.media_type {
        MediaType::Video => {
            let Some(frame) = state.video.push(&header, payload) else {
                return;
            };
            for decoded in state.decoder.decode(&frame.payload, frame.timestamp) {
                let size = (decoded.image.width, decoded.image.height);
                if state.resolution != Some(size) {
                    tracing::info!(width = size.0, height = size.1, "stream resolution");
                    output.lock().set_resolution(size.0, size.1);
                    state.resolution = Some(size);
                }
                match delay {
                    Some(buffer) => buffer.enqueue_video(&decoded.image, decoded.timestamp),
                    None => {
                        if let Err(e) = output.lock().send_video(&decoded.image, decoded.timestamp)
                        {
                            tracing::warn!(error = %e, "video output failed");
                        }
                    }
                }
            }
        }
        MediaType::Audio => {
            let Some(frame) = state.audio.push(&header, payload) else {
                return;
            };
            state.audio_frames += 1;
            let audio = AudioFrame {
                data: frame.payload,
                timestamp: frame.timestamp,
                sample_rate: frame.sample_rate,
                channels: frame.channels,
            };
            match delay {
                Some(buffer) => buffer.enqueue_audio(audio),
                None => {
                    if let Err(e) = output.lock().send_audio(&audio) {
                        tracing::warn!(error = %e, "audio output failed");
                    }
                }
            }
        }
    }
}
