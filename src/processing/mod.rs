//! Image processing engine.
//!
//! The [`ImageProcessingEngine`] applies the correction stages to a borrowed
//! [`Frame`](crate::frame::Frame) in place:
//!
//! ```text
//! offset -> gain -> defect -> scatter -> noise -> flattening -> window/level
//! ```
//!
//! Preview mode runs offset, gain and window/level only. Each stage validates
//! the frame and its calibration input first and leaves the frame untouched on
//! failure. Failures are returned as [`StageError`] and kept as the engine's
//! last error.

pub mod config;
pub mod engine;
pub mod stages;
pub mod timing;

pub use config::{
    FlatteningParams, NoiseFilter, NoiseReductionParams, ProcessingBudgets, ProcessingConfig,
    ProcessingMode,
};
pub use engine::{EngineConfig, ImageProcessingEngine, ProcessingReport};
pub use timing::{StageTimer, StageTimings};

use serde::Serialize;
use thiserror::Error;

/// Failure classes reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// A stage was called before `initialize`
    NotInitialized,
    /// `initialize` was called twice
    AlreadyInitialized,
    /// Malformed frame or out-of-range parameter
    InvalidParameter,
    /// Calibration input missing, invalid, or of the wrong kind or size
    CalibrationMismatch,
    /// Noise filter name not recognised
    UnknownFilter,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorCode::NotInitialized => "not-initialized",
            ErrorCode::AlreadyInitialized => "already-initialized",
            ErrorCode::InvalidParameter => "invalid-parameter",
            ErrorCode::CalibrationMismatch => "calibration-mismatch",
            ErrorCode::UnknownFilter => "unknown-filter",
        };
        f.write_str(label)
    }
}

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// Engine initialisation
    Initialize,
    /// Dark subtraction
    OffsetCorrection,
    /// Per-pixel gain
    GainCorrection,
    /// Defective pixel repair
    DefectPixelMap,
    /// Frequency-domain scatter suppression
    ScatterCorrection,
    /// Display windowing
    WindowLevel,
    /// Spatial noise filter
    NoiseReduction,
    /// Background illumination correction
    Flattening,
    /// Whole-frame preconditions
    ProcessFrame,
}

impl Stage {
    /// The seven correction stages in execution order.
    pub const CORRECTIONS: [Stage; 7] = [
        Stage::OffsetCorrection,
        Stage::GainCorrection,
        Stage::DefectPixelMap,
        Stage::ScatterCorrection,
        Stage::NoiseReduction,
        Stage::Flattening,
        Stage::WindowLevel,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Stage::Initialize => "initialize",
            Stage::OffsetCorrection => "offset-correction",
            Stage::GainCorrection => "gain-correction",
            Stage::DefectPixelMap => "defect-pixel-map",
            Stage::ScatterCorrection => "scatter-correction",
            Stage::WindowLevel => "window-level",
            Stage::NoiseReduction => "noise-reduction",
            Stage::Flattening => "flattening",
            Stage::ProcessFrame => "process-frame",
        };
        f.write_str(label)
    }
}

/// Structured, stage-tagged failure.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{stage} failed ({code}): {message}")]
pub struct StageError {
    /// Failure class
    pub code: ErrorCode,
    /// Failed stage
    pub stage: Stage,
    /// Human readable detail
    pub message: String,
}

impl StageError {
    /// Create a stage error.
    pub fn new(code: ErrorCode, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            code,
            stage,
            message: message.into(),
        }
    }
}
