//! Fixed-delay presentation buffer.
//!
//! Holds decoded video and received audio for a configured wall-clock
//! duration before release, for institutional broadcast pacing. Entries are
//! released strictly in enqueue order per media type; because the delay is
//! constant, release order equals arrival order.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::source::{AudioFrame, PixelBuffer};

struct DelayedVideo {
    frame: PixelBuffer,
    timestamp: u64,
    release_at: Instant,
}

struct DelayedAudio {
    frame: AudioFrame,
    release_at: Instant,
}

/// Entries whose release time has passed, in presentation order.
#[derive(Default)]
pub struct ReadyBatch {
    pub video: Vec<(PixelBuffer, u64)>,
    pub audio: Vec<AudioFrame>,
}

impl ReadyBatch {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

/// Thread-safe delay line for video and audio.
///
/// Writers are the decoder-completion and network paths; the reader is the
/// output pump. Each side takes the mutex only long enough to move entries.
pub struct DelayBuffer {
    delay: Duration,
    video: Mutex<VecDeque<DelayedVideo>>,
    audio: Mutex<VecDeque<DelayedAudio>>,
}

impl DelayBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            video: Mutex::new(VecDeque::new()),
            audio: Mutex::new(VecDeque::new()),
        }
    }

    /// A zero-delay buffer is disabled; the orchestrator bypasses it
    /// entirely rather than paying the copy.
    pub fn is_enabled(&self) -> bool {
        !self.delay.is_zero()
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Queue a decoded video frame.
    ///
    /// Takes a deep copy: decoded buffers come from a pool the codec
    /// recycles as soon as its callback returns, so the buffer must own the
    /// pixels for the entire dwell time.
    pub fn enqueue_video(&self, frame: &PixelBuffer, timestamp: u64) {
        let entry = DelayedVideo {
            frame: frame.deep_copy(),
            timestamp,
            release_at: Instant::now() + self.delay,
        };
        self.video.lock().push_back(entry);
    }

    /// Queue an audio frame. The frame is moved in, so later mutation by
    /// the producer cannot reach the queued entry.
    pub fn enqueue_audio(&self, frame: AudioFrame) {
        let entry = DelayedAudio {
            frame,
            release_at: Instant::now() + self.delay,
        };
        self.audio.lock().push_back(entry);
    }

    /// Remove and return every entry that is due.
    pub fn dequeue_ready(&self) -> ReadyBatch {
        let now = Instant::now();
        let mut batch = ReadyBatch::default();

        {
            let mut video = self.video.lock();
            while video.front().is_some_and(|e| e.release_at <= now) {
                let entry = video.pop_front().unwrap();
                batch.video.push((entry.frame, entry.timestamp));
            }
        }
        {
            let mut audio = self.audio.lock();
            while audio.front().is_some_and(|e| e.release_at <= now) {
                batch.audio.push(audio.pop_front().unwrap().frame);
            }
        }

        batch
    }

    /// Drop everything, due or not.
    pub fn flush(&self) {
        self.video.lock().clear();
        self.audio.lock().clear();
    }

    /// Entries currently held, `(video, audio)`.
    pub fn depth(&self) -> (usize, usize) {
        (self.video.lock().len(), self.audio.lock().len())
    }
}
