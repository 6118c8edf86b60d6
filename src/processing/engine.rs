//! The correction pipeline driver.

use super::config::{FlatteningParams, NoiseReductionParams, ProcessingBudgets, ProcessingConfig, ProcessingMode};
use super::stages::{self, require_calibration, validate_frame};
use super::timing::{StageTimer, StageTimings};
use super::{ErrorCode, Stage, StageError};
use crate::calibration::{CalibrationDataset, CalibrationType};
use crate::frame::Frame;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Engine-wide settings fixed at initialisation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Latency budgets per mode
    pub budgets: ProcessingBudgets,
}

/// Outcome of a successful [`ImageProcessingEngine::process_frame`].
#[derive(Debug, Clone)]
pub struct ProcessingReport {
    /// Frame id of the processed frame
    pub frame_id: u64,
    /// Mode that ran
    pub mode: ProcessingMode,
    /// Stages that ran, in order
    pub stages_run: Vec<Stage>,
    /// Per-stage timings
    pub timings: StageTimings,
    /// Wall-clock time of the whole call
    pub total: Duration,
    /// Budget for the mode
    pub budget: Duration,
    /// Pixels repaired by the defect stage
    pub defects_repaired: usize,
    /// Packed copy of the raw pixels, when preservation was requested
    pub raw: Option<Vec<u8>>,
}

impl ProcessingReport {
    /// Whether the call finished within its budget.
    pub fn within_budget(&self) -> bool {
        self.total <= self.budget
    }
}

/// Runs correction stages on borrowed frames.
///
/// Must be initialised exactly once before any stage call. Not shared between
/// threads; each consumer owns its engine.
pub struct ImageProcessingEngine {
    config: Option<EngineConfig>,
    planner: FftPlanner<f32>,
    last_error: Option<StageError>,
    timings: StageTimings,
    frames_processed: u64,
}

impl std::fmt::Debug for ImageProcessingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageProcessingEngine")
            .field("config", &self.config)
            .field("last_error", &self.last_error)
            .field("frames_processed", &self.frames_processed)
            .finish_non_exhaustive()
    }
}

impl Default for ImageProcessingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProcessingEngine {
    /// Create an uninitialised engine.
    pub fn new() -> Self {
        Self {
            config: None,
            planner: FftPlanner::new(),
            last_error: None,
            timings: StageTimings::default(),
            frames_processed: 0,
        }
    }

    /// Initialise the engine. A second call fails.
    pub fn initialize(&mut self, config: EngineConfig) -> Result<(), StageError> {
        if self.config.is_some() {
            return self.record(Err(StageError::new(
                ErrorCode::AlreadyInitialized,
                Stage::Initialize,
                "engine is already initialized",
            )));
        }
        debug!(
            full_budget = ?config.budgets.full_pipeline,
            preview_budget = ?config.budgets.preview,
            "Processing engine initialized"
        );
        self.config = Some(config);
        self.last_error = None;
        Ok(())
    }

    /// Whether `initialize` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.config.is_some()
    }

    /// Most recent failure; cleared by the next successful call.
    pub fn last_error(&self) -> Option<&StageError> {
        self.last_error.as_ref()
    }

    /// Timings recorded by the most recent calls.
    pub fn timings(&self) -> StageTimings {
        self.timings
    }

    /// Frames successfully run through `process_frame`.
    pub fn frames_processed(&self) -> u64 {
        self.frames_processed
    }

    /// Subtract the dark frame, clamping at zero.
    pub fn offset_correction(
        &mut self,
        frame: &mut Frame<'_>,
        dark: Option<&CalibrationDataset>,
    ) -> Result<(), StageError> {
        self.run_stage(Stage::OffsetCorrection, |_| stages::offset::apply(frame, dark))
    }

    /// Apply the per-pixel gain map.
    pub fn gain_correction(
        &mut self,
        frame: &mut Frame<'_>,
        gain: Option<&CalibrationDataset>,
    ) -> Result<(), StageError> {
        self.run_stage(Stage::GainCorrection, |_| stages::gain::apply(frame, gain))
    }

    /// Repair the pixels listed in the defect map; returns how many were repaired.
    pub fn defect_pixel_map(
        &mut self,
        frame: &mut Frame<'_>,
        defects: Option<&CalibrationDataset>,
    ) -> Result<usize, StageError> {
        self.run_stage(Stage::DefectPixelMap, |_| stages::defect::apply(frame, defects))
    }

    /// Frequency-domain scatter suppression; returns whether the frame changed.
    pub fn scatter_correction(
        &mut self,
        frame: &mut Frame<'_>,
        params: Option<&CalibrationDataset>,
    ) -> Result<bool, StageError> {
        self.run_stage(Stage::ScatterCorrection, |planner| {
            stages::scatter::apply(frame, params, planner)
        })
    }

    /// Map the window onto the display range.
    pub fn window_level(&mut self, frame: &mut Frame<'_>, window: f32, level: f32) -> Result<(), StageError> {
        self.run_stage(Stage::WindowLevel, |_| stages::window_level::apply(frame, window, level))
    }

    /// Apply the configured noise filter.
    pub fn noise_reduction(
        &mut self,
        frame: &mut Frame<'_>,
        params: &NoiseReductionParams,
    ) -> Result<(), StageError> {
        self.run_stage(Stage::NoiseReduction, |_| stages::noise::apply(frame, params))
    }

    /// Correct background illumination.
    pub fn flattening(&mut self, frame: &mut Frame<'_>, params: &FlatteningParams) -> Result<(), StageError> {
        self.run_stage(Stage::Flattening, |_| stages::flatten::apply(frame, params))
    }

    fn run_stage<T>(
        &mut self,
        stage: Stage,
        f: impl FnOnce(&mut FftPlanner<f32>) -> Result<T, StageError>,
    ) -> Result<T, StageError> {
        if self.config.is_none() {
            return self.record(Err(StageError::new(
                ErrorCode::NotInitialized,
                stage,
                "engine is not initialized",
            )));
        }
        let timer = StageTimer::start(stage);
        let result = f(&mut self.planner);
        let (stage, elapsed) = timer.stop();
        if result.is_ok() {
            self.timings.set(stage, elapsed);
        }
        self.record(result)
    }

    fn record<T>(&mut self, result: Result<T, StageError>) -> Result<T, StageError> {
        match &result {
            Ok(_) => self.last_error = None,
            Err(err) => {
                warn!(stage = %err.stage, code = %err.code, error = %err.message, "Processing stage failed");
                self.last_error = Some(err.clone());
            }
        }
        result
    }

    /// Run the pipeline for `config.mode` on `frame`.
    ///
    /// Every precondition (frame shape, parameters, required calibration) is
    /// checked before the first stage runs. If a stage still fails part way
    /// and the raw pixels were preserved, they are written back so the caller
    /// gets the frame as captured.
    pub fn process_frame(
        &mut self,
        frame: &mut Frame<'_>,
        config: &ProcessingConfig,
    ) -> Result<ProcessingReport, StageError> {
        let started = Instant::now();
        let budgets = match &self.config {
            Some(engine) => engine.budgets,
            None => {
                return self.record(Err(StageError::new(
                    ErrorCode::NotInitialized,
                    Stage::ProcessFrame,
                    "engine is not initialized",
                )))
            }
        };

        if let Err(err) = self.preflight(frame, config) {
            return self.record(Err(err));
        }

        let raw = if config.preserve_raw {
            Some(frame.packed_bytes())
        } else {
            warn!(frame_id = frame.frame_id, "Raw frame preservation disabled for this call");
            None
        };

        self.timings = StageTimings::default();
        let mut stages_run = Vec::with_capacity(Stage::CORRECTIONS.len());
        let outcome = self.run_pipeline(frame, config, &mut stages_run);

        let defects_repaired = match outcome {
            Ok(repaired) => repaired,
            Err(err) => {
                if let Some(raw) = &raw {
                    restore(frame, raw);
                    warn!(frame_id = frame.frame_id, stage = %err.stage, "Restored raw pixels after stage failure");
                }
                return Err(err);
            }
        };

        let report = ProcessingReport {
            frame_id: frame.frame_id,
            mode: config.mode,
            stages_run,
            timings: self.timings,
            total: started.elapsed(),
            budget: budgets.for_mode(config.mode),
            defects_repaired,
            raw,
        };
        if !report.within_budget() {
            warn!(
                frame_id = report.frame_id,
                mode = %report.mode,
                total_ms = report.total.as_secs_f64() * 1000.0,
                budget_ms = report.budget.as_secs_f64() * 1000.0,
                stages = %report.timings.summary(),
                "Processing budget exceeded"
            );
        } else {
            debug!(
                frame_id = report.frame_id,
                mode = %report.mode,
                total_ms = report.total.as_secs_f64() * 1000.0,
                "Frame processed"
            );
        }
        self.frames_processed += 1;
        self.last_error = None;
        Ok(report)
    }

    fn run_pipeline(
        &mut self,
        frame: &mut Frame<'_>,
        config: &ProcessingConfig,
        stages_run: &mut Vec<Stage>,
    ) -> Result<usize, StageError> {
        self.offset_correction(frame, config.dark_frame.as_deref())?;
        stages_run.push(Stage::OffsetCorrection);
        self.gain_correction(frame, config.gain_map.as_deref())?;
        stages_run.push(Stage::GainCorrection);

        let mut repaired = 0;
        if config.mode == ProcessingMode::Full {
            if config.enable_defect_correction {
                repaired = self.defect_pixel_map(frame, config.defect_map.as_deref())?;
                stages_run.push(Stage::DefectPixelMap);
            }
            if config.enable_scatter_correction {
                self.scatter_correction(frame, config.scatter_params.as_deref())?;
                stages_run.push(Stage::ScatterCorrection);
            }
            if config.enable_noise_reduction {
                self.noise_reduction(frame, &config.noise)?;
                stages_run.push(Stage::NoiseReduction);
            }
            if config.enable_flattening {
                self.flattening(frame, &config.flattening)?;
                stages_run.push(Stage::Flattening);
            }
        }

        self.window_level(frame, config.window, config.level)?;
        stages_run.push(Stage::WindowLevel);
        Ok(repaired)
    }

    fn preflight(&self, frame: &Frame<'_>, config: &ProcessingConfig) -> Result<(), StageError> {
        let stage = Stage::ProcessFrame;
        validate_frame(frame, stage)?;
        stages::window_level::check(config.window, config.level)?;

        require_calibration(config.dark_frame.as_deref(), CalibrationType::DarkFrame, frame, stage)?;
        require_calibration(config.gain_map.as_deref(), CalibrationType::GainMap, frame, stage)?;

        if config.mode == ProcessingMode::Full {
            require_calibration(config.defect_map.as_deref(), CalibrationType::DefectMap, frame, stage)?;
            if config.enable_scatter_correction {
                require_calibration(
                    config.scatter_params.as_deref(),
                    CalibrationType::ScatterParams,
                    frame,
                    stage,
                )?;
            }
            if config.enable_noise_reduction {
                stages::noise::check(&config.noise)?;
            }
            if config.enable_flattening {
                stages::flatten::check(&config.flattening)?;
            }
        }
        Ok(())
    }
}

fn restore(frame: &mut Frame<'_>, raw: &[u8]) {
    let row_bytes = frame.row_bytes();
    for (y, chunk) in raw.chunks_exact(row_bytes).enumerate() {
        frame.row_mut(y as u32).copy_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;

    #[test]
    fn stage_before_initialize_fails() {
        let mut engine = ImageProcessingEngine::new();
        let mut buffer = FrameBuffer::gradient(4, 4, 0, 100);
        let err = engine.window_level(&mut buffer.as_frame(), 100.0, 50.0).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotInitialized);
        assert_eq!(engine.last_error(), Some(&err));
    }

    #[test]
    fn second_initialize_fails() {
        let mut engine = ImageProcessingEngine::new();
        engine.initialize(EngineConfig::default()).unwrap();
        let err = engine.initialize(EngineConfig::default()).unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyInitialized);
        assert!(engine.is_initialized());
    }

    #[test]
    fn success_clears_last_error() {
        let mut engine = ImageProcessingEngine::new();
        engine.initialize(EngineConfig::default()).unwrap();
        let mut buffer = FrameBuffer::gradient(4, 4, 0, 100);
        assert!(engine.window_level(&mut buffer.as_frame(), -1.0, 50.0).is_err());
        assert!(engine.last_error().is_some());
        engine.window_level(&mut buffer.as_frame(), 100.0, 50.0).unwrap();
        assert!(engine.last_error().is_none());
        assert!(engine.timings().window_level > Duration::ZERO);
    }

    #[test]
    fn restore_writes_back_rows() {
        let mut buffer = FrameBuffer::from_u16(2, 2, &[1, 2, 3, 4]);
        let raw = buffer.data.clone();
        buffer.as_frame().map_pixels(|_, _| 0);
        restore(&mut buffer.as_frame(), &raw);
        assert_eq!(buffer.to_u16(), vec![1, 2, 3, 4]);
    }
}
