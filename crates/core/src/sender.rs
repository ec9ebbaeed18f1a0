//! Host orchestrator: capture, encode, fragment, transmit.

use std::io::{self, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::codec::{EncoderConfig, H264EncoderBackend, Setting, VideoEncoder};
use crate::error::{BridgeError, Result};
use crate::protocol::{Fragmenter, OutboundFrame, DEFAULT_MTU, DEFAULT_PORT};
use crate::source::{AudioFrame, CaptureSink, PixelBuffer, SourceCapture, SourceDescriptor};

/// How long a disconnected source gets before the next reconnect attempt.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Supervisor poll interval while the capture callbacks do the work.
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(50);

/// Host endpoint configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Destination `host:port`.
    pub target: String,
    pub bitrate_bps: u32,
    /// Pick this source by name (exact match preferred, then substring).
    pub source_name: Option<String>,
    /// Case-insensitive substrings; matching sources are never offered.
    /// Defaults to `"Bridge"` so a co-located receiver's own output is not
    /// captured back into the link.
    pub exclude: Vec<String>,
    /// Skip the interactive prompt and take the first source that survives
    /// filtering.
    pub auto_select: bool,
    /// Per-datagram byte budget, header included.
    pub mtu: usize,
    pub keyframe_interval: u32,
    pub discovery_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            target: format!("127.0.0.1:{}", DEFAULT_PORT),
            bitrate_bps: 10_000_000,
            source_name: None,
            exclude: vec!["Bridge".to_string()],
            auto_select: false,
            mtu: DEFAULT_MTU,
            keyframe_interval: 60,
            discovery_timeout: Duration::from_secs(10),
        }
    }
}

/// Drop every source whose name contains one of the exclusion substrings,
/// case-insensitively.
pub fn filter_sources(
    sources: Vec<SourceDescriptor>,
    exclude: &[String],
) -> Vec<SourceDescriptor> {
    sources
        .into_iter()
        .filter(|source| {
            let name = source.name.to_lowercase();
            !exclude.iter().any(|pat| name.contains(&pat.to_lowercase()))
        })
        .collect()
}

/// Resolve the configured selection against a filtered source list.
///
/// Returns `Ok(None)` when the choice has to come from the interactive
/// prompt (no name configured, auto off).
pub fn choose_source(
    sources: &[SourceDescriptor],
    name: Option<&str>,
    auto: bool,
) -> Result<Option<SourceDescriptor>> {
    if sources.is_empty() {
        return Err(BridgeError::NoSources);
    }
    if let Some(wanted) = name {
        let lower = wanted.to_lowercase();
        let exact = sources.iter().find(|s| s.name.to_lowercase() == lower);
        let partial = sources
            .iter()
            .find(|s| s.name.to_lowercase().contains(&lower));
        return exact
            .or(partial)
            .cloned()
            .map(Some)
            .ok_or_else(|| BridgeError::SourceNotFound(wanted.to_string()));
    }
    if auto {
        return Ok(Some(sources[0].clone()));
    }
    Ok(None)
}

fn prompt_selection(sources: &[SourceDescriptor]) -> Result<SourceDescriptor> {
    println!("Available sources:");
    for (i, source) in sources.iter().enumerate() {
        println!("[{}] {}", i, source.name);
    }
    print!("Select source: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let index: usize = line
        .trim()
        .parse()
        .map_err(|_| BridgeError::SourceNotFound(line.trim().to_string()))?;
    sources
        .get(index)
        .cloned()
        .ok_or_else(|| BridgeError::SourceNotFound(format!("index {}", index)))
}

#[derive(Default)]
struct LinkCounters {
    video_frames: AtomicU64,
    audio_frames: AtomicU64,
    packets: AtomicU64,
    bytes: AtomicU64,
    send_errors: AtomicU64,
}

/// Capture sink that drives encode, fragmentation, and transmission on the
/// capture thread.
struct HostSink {
    encoder: Arc<Mutex<VideoEncoder>>,
    fragmenter: Arc<Mutex<Fragmenter>>,
    socket: UdpSocket,
    target: SocketAddr,
    counters: Arc<LinkCounters>,
    disconnected: Arc<AtomicBool>,
}

impl HostSink {
    fn send_frame(&self, frame: OutboundFrame<'_>, is_video: bool) {
        let datagrams = self.fragmenter.lock().fragment(frame);
        for datagram in &datagrams {
            match self.socket.send_to(datagram, self.target) {
                Ok(sent) => {
                    self.counters.packets.fetch_add(1, Ordering::Relaxed);
                    self.counters.bytes.fetch_add(sent as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    // Transient; the frame is simply short a fragment.
                    self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(target = %self.target, error = %e, "send failed, fragment dropped");
                }
            }
        }
        let counter = if is_video {
            &self.counters.video_frames
        } else {
            &self.counters.audio_frames
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl CaptureSink for HostSink {
    fn on_video(&mut self, frame: PixelBuffer, timestamp: u64, _frame_number: u64) {
        let encoded = match self.encoder.lock().encode(&frame, timestamp) {
            Ok(Some(encoded)) => encoded,
            // Priming, or a per-frame failure the encoder already logged.
            Ok(None) | Err(_) => return,
        };
        self.send_frame(
            OutboundFrame::video(&encoded.annexb, encoded.timestamp, encoded.is_keyframe),
            true,
        );
    }

    fn on_audio(&mut self, frame: AudioFrame) {
        self.send_frame(
            OutboundFrame::audio(&frame.data, frame.timestamp, frame.sample_rate, frame.channels),
            false,
        );
    }

    fn on_disconnect(&mut self, reason: Option<String>) {
        tracing::warn!(reason = reason.as_deref().unwrap_or("unknown"), "source disconnected");
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// The sender endpoint: wires `SourceCapture -> VideoEncoder -> Fragmenter
/// -> UDP`.
///
/// Audio frames bypass the encoder and are fragmented directly. One
/// supervisor thread owns the capture handle, watches for disconnects, and
/// applies the reconnect policy; media itself flows on the capture thread.
pub struct Host {
    config: HostConfig,
    running: Arc<AtomicBool>,
    supervisor: Option<JoinHandle<()>>,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            supervisor: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Discover and select a source, open the socket, and start bridging.
    ///
    /// Setup failures (no source, unresolvable target, socket) are returned
    /// directly; once this returns `Ok` the orchestrator keeps running,
    /// reconnecting as needed, until [`stop`](Self::stop).
    pub fn start(
        &mut self,
        mut capture: Box<dyn SourceCapture>,
        encoder_backend: Box<dyn H264EncoderBackend>,
    ) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }

        let target = resolve_target(&self.config.target)?;
        capture.initialize()?;

        let discovered = capture.discover(self.config.discovery_timeout)?;
        let filtered = filter_sources(discovered, &self.config.exclude);
        let selected = match choose_source(
            &filtered,
            self.config.source_name.as_deref(),
            self.config.auto_select,
        )? {
            Some(source) => source,
            None => prompt_selection(&filtered)?,
        };
        tracing::info!(source = %selected.name, target = %target, "host starting");
        capture.connect(&selected)?;

        let socket = UdpSocket::bind("0.0.0.0:0")?;

        let encoder_config = EncoderConfig {
            width: Setting::Auto,
            height: Setting::Auto,
            frame_rate: Setting::Auto,
            bitrate_bps: self.config.bitrate_bps,
            keyframe_interval: self.config.keyframe_interval,
            ..EncoderConfig::default()
        };
        let encoder = Arc::new(Mutex::new(VideoEncoder::new(encoder_backend, encoder_config)));
        let fragmenter = Arc::new(Mutex::new(Fragmenter::new(self.config.mtu)));
        let counters = Arc::new(LinkCounters::default());

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let supervisor = thread::Builder::new().name("host-supervisor".to_string()).spawn(
            move || {
                supervise(
                    capture, selected, socket, target, encoder, fragmenter, counters, running,
                );
            },
        )?;
        self.supervisor = Some(supervisor);
        Ok(())
    }

    /// Stop bridging and join all threads. Idempotent; no capture callback
    /// runs after this returns.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        self.stop();
    }
}

fn resolve_target(target: &str) -> Result<SocketAddr> {
    target
        .to_socket_addrs()
        .map_err(|_| BridgeError::InvalidAddress(target.to_string()))?
        .next()
        .ok_or_else(|| BridgeError::InvalidAddress(target.to_string()))
}

/// Runs capture sessions until stopped, reconnecting on disconnect.
#[allow(clippy::too_many_arguments)]
fn supervise(
    mut capture: Box<dyn SourceCapture>,
    source: SourceDescriptor,
    socket: UdpSocket,
    target: SocketAddr,
    encoder: Arc<Mutex<VideoEncoder>>,
    fragmenter: Arc<Mutex<Fragmenter>>,
    counters: Arc<LinkCounters>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        let disconnected = Arc::new(AtomicBool::new(false));
        let sink_socket = match socket.try_clone() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "socket clone failed, host stopping");
                break;
            }
        };
        let sink = HostSink {
            encoder: encoder.clone(),
            fragmenter: fragmenter.clone(),
            socket: sink_socket,
            target,
            counters: counters.clone(),
            disconnected: disconnected.clone(),
        };

        if let Err(e) = capture.start_capture(Box::new(sink)) {
            tracing::error!(error = %e, "capture start failed, host stopping");
            break;
        }

        watch_session(&counters, &running, &disconnected);
        capture.stop();

        if !running.load(Ordering::SeqCst) {
            break;
        }

        // Reconnect policy: retry at fixed intervals for as long as the
        // orchestrator runs.
        tracing::warn!(source = %source.name, "reconnecting after disconnect");
        loop {
            if !sleep_while_running(&running, RECONNECT_DELAY) {
                break;
            }
            match capture.connect(&source) {
                Ok(()) => {
                    tracing::info!(source = %source.name, "reconnected");
                    break;
                }
                Err(e) => {
                    tracing::warn!(source = %source.name, error = %e, "reconnect failed, retrying");
                }
            }
        }
    }

    // Drain anything the backend was still holding before teardown.
    let drained = {
        let mut encoder = encoder.lock();
        let drained = encoder.flush().unwrap_or_default();
        encoder.shutdown();
        drained
    };
    for frame in &drained {
        let datagrams = fragmenter.lock().fragment(OutboundFrame::video(
            &frame.annexb,
            frame.timestamp,
            frame.is_keyframe,
        ));
        for datagram in &datagrams {
            let _ = socket.send_to(datagram, target);
        }
    }
    tracing::info!("host stopped");
}

/// Poll until stop or disconnect, logging a stats line once per second.
fn watch_session(counters: &LinkCounters, running: &AtomicBool, disconnected: &AtomicBool) {
    let mut last_log = Instant::now();
    let mut last_bytes = counters.bytes.load(Ordering::Relaxed);

    while running.load(Ordering::SeqCst) && !disconnected.load(Ordering::SeqCst) {
        thread::sleep(SUPERVISE_INTERVAL);
        let elapsed = last_log.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let bytes = counters.bytes.load(Ordering::Relaxed);
            let mbps = (bytes - last_bytes) as f64 * 8.0 / elapsed.as_secs_f64() / 1e6;
            tracing::info!(
                mbps = format_args!("{:.2}", mbps),
                video = counters.video_frames.load(Ordering::Relaxed),
                audio = counters.audio_frames.load(Ordering::Relaxed),
                packets = counters.packets.load(Ordering::Relaxed),
                send_errors = counters.send_errors.load(Ordering::Relaxed),
                "link stats"
            );
            last_bytes = bytes;
            last_log = Instant::now();
        }
    }
}

/// Sleep in supervisor-poll steps; false once `running` clears.
fn sleep_while_running(running: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(SUPERVISE_INTERVAL);
    }
    running.load(Ordering::SeqCst)
}
