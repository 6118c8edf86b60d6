//! Consumer side of the data path.
//!
//! A [`PipelineWorker`] owns one [`ImageProcessingEngine`] and one thread. It
//! pops frames from the ring buffer, takes a fresh calibration snapshot per
//! frame, processes the frame in place and hands the result to a
//! [`FrameSink`]. Stage failures are logged and counted; the worker never
//! retries a frame.

use crate::calibration::CalibrationManager;
use crate::data::ring_buffer::{BufferError, FrameRingBuffer};
use crate::error::{AppResult, XrayError};
use crate::frame::Frame;
use crate::processing::{EngineConfig, ImageProcessingEngine, ProcessingConfig, ProcessingReport};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Downstream consumer of processed frames.
///
/// The frame is only borrowed for the duration of the call.
pub trait FrameSink: Send {
    /// Receive one processed frame.
    fn deliver(&mut self, frame: &Frame<'_>, report: &ProcessingReport) -> anyhow::Result<()>;
}

/// Logs a one-line summary per frame.
#[derive(Debug, Default)]
pub struct LoggingSink;

impl FrameSink for LoggingSink {
    fn deliver(&mut self, frame: &Frame<'_>, report: &ProcessingReport) -> anyhow::Result<()> {
        info!(
            frame_id = frame.frame_id,
            mode = %report.mode,
            total_ms = report.total.as_secs_f64() * 1000.0,
            within_budget = report.within_budget(),
            defects_repaired = report.defects_repaired,
            "Frame delivered"
        );
        Ok(())
    }
}

/// A processed frame copied out of the worker.
#[derive(Debug, Clone)]
pub struct ProcessedFrame {
    /// Ring buffer sequence number
    pub frame_id: u64,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Packed processed pixels
    pub data: Vec<u8>,
    /// Processing outcome
    pub report: ProcessingReport,
}

/// Forwards copies of processed frames over a channel.
#[derive(Debug)]
pub struct ChannelSink {
    sender: Sender<ProcessedFrame>,
}

impl ChannelSink {
    /// Create a sink and the receiving end.
    pub fn channel() -> (Self, Receiver<ProcessedFrame>) {
        let (sender, receiver) = std::sync::mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl FrameSink for ChannelSink {
    fn deliver(&mut self, frame: &Frame<'_>, report: &ProcessingReport) -> anyhow::Result<()> {
        self.sender
            .send(ProcessedFrame {
                frame_id: frame.frame_id,
                width: frame.width,
                height: frame.height,
                data: frame.packed_bytes(),
                report: report.clone(),
            })
            .map_err(|_| anyhow::anyhow!("processed frame receiver dropped"))
    }
}

/// Consumer-side counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames popped from the ring buffer
    pub frames_received: u64,
    /// Frames processed and delivered
    pub frames_delivered: u64,
    /// Frames whose processing failed
    pub frames_failed: u64,
    /// Frames processed over their mode's budget
    pub budget_overruns: u64,
    /// Frames the sink refused
    pub sink_errors: u64,
}

/// Settings of one worker.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Engine settings
    pub engine: EngineConfig,
    /// Per-frame settings; calibration references are attached per frame
    pub processing: ProcessingConfig,
    /// How long a read waits before re-checking the stop flag
    pub poll_interval: Duration,
}

/// Consumer thread: ring buffer -> engine -> sink.
pub struct PipelineWorker {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<AppResult<PipelineStats>>>,
}

impl PipelineWorker {
    /// Start a worker.
    ///
    /// The worker runs until [`stop`](Self::stop) is called or the buffer is
    /// closed and drained.
    pub fn spawn(
        buffer: Arc<FrameRingBuffer>,
        calibration: Arc<CalibrationManager>,
        settings: PipelineSettings,
        sink: Box<dyn FrameSink>,
    ) -> AppResult<Self> {
        let expected = settings.width as usize * settings.height as usize * crate::frame::BYTES_PER_PIXEL;
        if buffer.frame_size() != expected {
            return Err(XrayError::Configuration(format!(
                "ring buffer frame size {} does not match {}x{} frames ({expected} bytes)",
                buffer.frame_size(),
                settings.width,
                settings.height
            )));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("xray-pipeline".into())
            .spawn(move || run(&buffer, &calibration, settings, sink, &stop_flag))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Ask the worker to stop after the current frame and wait for it.
    pub fn stop(mut self) -> AppResult<PipelineStats> {
        self.stop.store(true, Ordering::SeqCst);
        self.join_inner()
    }

    /// Wait for the worker to finish on its own (buffer closed and drained).
    pub fn join(mut self) -> AppResult<PipelineStats> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> AppResult<PipelineStats> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| {
                XrayError::ShutdownFailed(vec![XrayError::Configuration(
                    "pipeline thread panicked".into(),
                )])
            })?,
            None => Ok(PipelineStats::default()),
        }
    }
}

impl Drop for PipelineWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = self.join_inner() {
            error!(error = %e, "Pipeline worker ended with error");
        }
    }
}

fn run(
    buffer: &FrameRingBuffer,
    calibration: &CalibrationManager,
    settings: PipelineSettings,
    mut sink: Box<dyn FrameSink>,
    stop: &AtomicBool,
) -> AppResult<PipelineStats> {
    let mut engine = ImageProcessingEngine::new();
    engine.initialize(settings.engine.clone())?;
    let mut stats = PipelineStats::default();
    let mut scratch = vec![0u8; buffer.frame_size()];
    info!(mode = %settings.processing.mode, "Pipeline worker started");

    while !stop.load(Ordering::SeqCst) {
        let sequence = match buffer.read_frame_timeout(&mut scratch, settings.poll_interval) {
            Ok(sequence) => sequence,
            Err(BufferError::Timeout) => continue,
            Err(BufferError::Closed) => break,
            Err(e) => return Err(e.into()),
        };
        stats.frames_received += 1;

        let snapshot = calibration.snapshot();
        let config = settings.processing.clone().with_calibration(&snapshot);
        let mut frame =
            Frame::new(settings.width, settings.height, &mut scratch).with_capture(sequence, Utc::now());

        match engine.process_frame(&mut frame, &config) {
            Ok(report) => {
                if !report.within_budget() {
                    stats.budget_overruns += 1;
                }
                match sink.deliver(&frame, &report) {
                    Ok(()) => stats.frames_delivered += 1,
                    Err(e) => {
                        stats.sink_errors += 1;
                        warn!(frame_id = sequence, error = %e, "Sink rejected frame");
                    }
                }
            }
            Err(err) => {
                stats.frames_failed += 1;
                warn!(
                    frame_id = sequence,
                    stage = %err.stage,
                    code = %err.code,
                    error = %err.message,
                    "Frame processing failed"
                );
            }
        }
    }

    debug!(?stats, "Pipeline worker finished");
    info!(
        received = stats.frames_received,
        delivered = stats.frames_delivered,
        failed = stats.frames_failed,
        "Pipeline worker stopped"
    );
    Ok(stats)
}
