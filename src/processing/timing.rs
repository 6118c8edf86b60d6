use super::Stage;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Wall-clock time spent per correction stage in the most recent call.
///
/// Stages that did not run report zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageTimings {
    /// Dark subtraction
    pub offset: Duration,
    /// Gain correction
    pub gain: Duration,
    /// Defect repair
    pub defect: Duration,
    /// Scatter correction
    pub scatter: Duration,
    /// Window/level
    pub window_level: Duration,
    /// Noise reduction
    pub noise: Duration,
    /// Flattening
    pub flattening: Duration,
}

impl StageTimings {
    /// Time recorded for `stage`; zero for non-correction stages.
    pub fn get(&self, stage: Stage) -> Duration {
        match stage {
            Stage::OffsetCorrection => self.offset,
            Stage::GainCorrection => self.gain,
            Stage::DefectPixelMap => self.defect,
            Stage::ScatterCorrection => self.scatter,
            Stage::WindowLevel => self.window_level,
            Stage::NoiseReduction => self.noise,
            Stage::Flattening => self.flattening,
            Stage::Initialize | Stage::ProcessFrame => Duration::ZERO,
        }
    }

    /// Record `duration` for `stage`.
    pub fn set(&mut self, stage: Stage, duration: Duration) {
        let slot = match stage {
            Stage::OffsetCorrection => &mut self.offset,
            Stage::GainCorrection => &mut self.gain,
            Stage::DefectPixelMap => &mut self.defect,
            Stage::ScatterCorrection => &mut self.scatter,
            Stage::WindowLevel => &mut self.window_level,
            Stage::NoiseReduction => &mut self.noise,
            Stage::Flattening => &mut self.flattening,
            Stage::Initialize | Stage::ProcessFrame => return,
        };
        *slot = duration;
    }

    /// Sum over all stages.
    pub fn total(&self) -> Duration {
        Stage::CORRECTIONS.iter().map(|s| self.get(*s)).sum()
    }

    /// Summary line for logs, e.g. `offset=1.2ms gain=0.8ms ...`.
    pub fn summary(&self) -> String {
        Stage::CORRECTIONS
            .iter()
            .map(|s| format!("{}={:.3}ms", s, self.get(*s).as_secs_f64() * 1000.0))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Measures one stage.
pub struct StageTimer {
    stage: Stage,
    start: Instant,
}

impl StageTimer {
    /// Start timing `stage`.
    pub fn start(stage: Stage) -> Self {
        Self {
            stage,
            start: Instant::now(),
        }
    }

    /// Stop and return the stage with its elapsed time.
    ///
    /// Never returns zero: a zero timing means the stage did not run.
    pub fn stop(self) -> (Stage, Duration) {
        (self.stage, self.start.elapsed().max(Duration::from_nanos(1)))
    }
}
