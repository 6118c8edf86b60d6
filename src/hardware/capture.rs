//! Feeding captured frames into the ring buffer.
//!
//! A [`FrameSource`] is anything that produces raw detector frames: a
//! [`PluginDriver`](crate::hardware::plugin::PluginDriver) wrapping a vendor
//! module, or the [`SyntheticDetector`] used for demos and tests. The
//! [`CaptureAdapter`] owns the producer thread that pulls from a source and
//! writes into a [`FrameRingBuffer`].

use crate::data::ring_buffer::{BufferError, FrameRingBuffer};
use crate::frame::{quantize, BYTES_PER_PIXEL};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Metadata of a frame pulled from a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureInfo {
    /// Driver frame counter
    pub frame_id: u64,
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

/// A producer of raw 16-bit detector frames.
pub trait FrameSource: Send {
    /// Human readable identification for logs.
    fn describe(&self) -> String;

    /// Begin acquisition.
    fn start(&mut self) -> Result<()>;

    /// End acquisition.
    fn stop(&mut self) -> Result<()>;

    /// Copy the next frame into `buffer`; `Ok(None)` when none is ready yet.
    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<Option<CaptureInfo>>;
}

/// Parameters of the synthetic detector.
#[derive(Debug, Clone)]
pub struct SyntheticDetectorConfig {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Mean dark offset added to every pixel
    pub dark_level: f32,
    /// Signal at the left edge of the gradient
    pub signal_low: f32,
    /// Signal at the right edge of the gradient
    pub signal_high: f32,
    /// Peak-to-peak amplitude of per-pixel gain variation (0.1 = ±5 %)
    pub gain_spread: f32,
    /// Uniform noise amplitude in counts
    pub noise: f32,
    /// Minimum time between frames
    pub frame_interval: Duration,
    /// Seed for the fixed pattern and the noise
    pub seed: u64,
}

impl Default for SyntheticDetectorConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            dark_level: 100.0,
            signal_low: 500.0,
            signal_high: 3500.0,
            gain_spread: 0.1,
            noise: 8.0,
            frame_interval: Duration::ZERO,
            seed: 0x5EED,
        }
    }
}

/// Simulated flat panel: horizontal gradient exposure on top of a fixed
/// dark offset pattern and per-pixel gain variation, plus noise.
pub struct SyntheticDetector {
    config: SyntheticDetectorConfig,
    dark_pattern: Vec<f32>,
    gain_pattern: Vec<f32>,
    rng: StdRng,
    next_frame_id: u64,
    last_frame: Option<Instant>,
    running: bool,
    exposure: bool,
}

impl SyntheticDetector {
    /// Create a detector and its fixed patterns.
    pub fn new(config: SyntheticDetectorConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let pixels = config.width as usize * config.height as usize;
        let dark_pattern = (0..pixels)
            .map(|_| config.dark_level + rng.gen_range(-0.1..=0.1) * config.dark_level)
            .collect();
        let half_spread = config.gain_spread / 2.0;
        let gain_pattern = (0..pixels)
            .map(|_| 1.0 + rng.gen_range(-half_spread..=half_spread))
            .collect();
        Self {
            config,
            dark_pattern,
            gain_pattern,
            rng,
            next_frame_id: 0,
            last_frame: None,
            running: false,
            exposure: true,
        }
    }

    /// Switch between exposed frames and dark frames (no exposure).
    pub fn set_exposure(&mut self, exposure: bool) {
        self.exposure = exposure;
    }

    /// Size of one frame in bytes.
    pub fn frame_size(&self) -> usize {
        self.config.width as usize * self.config.height as usize * BYTES_PER_PIXEL
    }

    /// Render one frame into `buffer` without pacing.
    pub fn render(&mut self, buffer: &mut [u8]) {
        let width = self.config.width as usize;
        let span = self.config.signal_high - self.config.signal_low;
        let denom = (width.max(2) - 1) as f32;
        let noise = self.config.noise;
        for (idx, px) in buffer.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
            let x = idx % width;
            let signal = if self.exposure {
                (self.config.signal_low + span * x as f32 / denom) * self.gain_pattern[idx]
            } else {
                0.0
            };
            let jitter = if noise > 0.0 {
                self.rng.gen_range(-noise..=noise)
            } else {
                0.0
            };
            let value = quantize(self.dark_pattern[idx] + signal + jitter);
            px.copy_from_slice(&value.to_le_bytes());
        }
    }
}

impl FrameSource for SyntheticDetector {
    fn describe(&self) -> String {
        format!("synthetic {}x{}", self.config.width, self.config.height)
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.running = false;
        Ok(())
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> Result<Option<CaptureInfo>> {
        if !self.running {
            return Err(anyhow!("synthetic detector is not acquiring"));
        }
        if buffer.len() != self.frame_size() {
            return Err(anyhow!(
                "buffer holds {} bytes, frame needs {}",
                buffer.len(),
                self.frame_size()
            ));
        }
        if let Some(last) = self.last_frame {
            if last.elapsed() < self.config.frame_interval {
                return Ok(None);
            }
        }
        self.render(buffer);
        self.last_frame = Some(Instant::now());
        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;
        Ok(Some(CaptureInfo {
            frame_id,
            timestamp: Utc::now(),
        }))
    }
}

/// Producer-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames pulled from the source
    pub frames_captured: u64,
    /// Frames accepted by the ring buffer
    pub frames_written: u64,
    /// Longest time a single ring buffer write took
    pub max_write_latency: Duration,
}

/// Producer thread pulling frames from a [`FrameSource`] into a ring buffer.
pub struct CaptureAdapter {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<CaptureStats>>>,
}

impl CaptureAdapter {
    /// Start the producer thread. It stops after `max_frames` frames when set,
    /// when [`stop`](Self::stop) is called, or when the buffer is closed.
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        buffer: Arc<FrameRingBuffer>,
        max_frames: Option<u64>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("xray-capture".into())
            .spawn(move || {
                let description = source.describe();
                source
                    .start()
                    .with_context(|| format!("failed to start {description}"))?;
                info!(source = %description, "Capture started");
                let result = capture_loop(source.as_mut(), &buffer, &stop_flag, max_frames);
                if let Err(e) = source.stop() {
                    warn!(source = %description, error = %e, "Failed to stop source");
                }
                info!(source = %description, "Capture stopped");
                result
            })
            .context("failed to spawn capture thread")?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Ask the producer to stop and wait for it.
    pub fn stop(mut self) -> Result<CaptureStats> {
        self.stop.store(true, Ordering::SeqCst);
        self.join_inner()
    }

    /// Wait for the producer to finish on its own.
    pub fn join(mut self) -> Result<CaptureStats> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<CaptureStats> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow!("capture thread panicked"))?,
            None => Ok(CaptureStats::default()),
        }
    }
}

impl Drop for CaptureAdapter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.join_inner() {
            warn!(error = %e, "Capture thread ended with error");
        }
    }
}

fn capture_loop(
    source: &mut dyn FrameSource,
    buffer: &FrameRingBuffer,
    stop: &AtomicBool,
    max_frames: Option<u64>,
) -> Result<CaptureStats> {
    let mut stats = CaptureStats::default();
    let mut scratch = vec![0u8; buffer.frame_size()];

    while !stop.load(Ordering::SeqCst) {
        if max_frames.is_some_and(|max| stats.frames_captured >= max) {
            break;
        }
        let Some(info) = source.read_frame(&mut scratch)? else {
            thread::sleep(Duration::from_millis(1));
            continue;
        };
        stats.frames_captured += 1;

        let started = Instant::now();
        match buffer.write_frame(&scratch) {
            Ok(sequence) => {
                stats.frames_written += 1;
                stats.max_write_latency = stats.max_write_latency.max(started.elapsed());
                debug!(sequence, frame_id = info.frame_id, "Frame queued");
            }
            Err(BufferError::Closed) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(stats)
}
