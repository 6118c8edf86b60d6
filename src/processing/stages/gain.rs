//! Per-pixel gain correction.

use super::{require_calibration, validate_frame};
use crate::calibration::{CalibrationDataset, CalibrationType};
use crate::frame::{quantize, Frame};
use crate::processing::{ErrorCode, Stage, StageError};

/// Multiply every pixel by its gain factor.
pub fn apply(frame: &mut Frame<'_>, gain: Option<&CalibrationDataset>) -> Result<(), StageError> {
    let stage = Stage::GainCorrection;
    validate_frame(frame, stage)?;
    let gain = require_calibration(gain, CalibrationType::GainMap, frame, stage)?;
    let factors = gain
        .gain_map()
        .ok_or_else(|| StageError::new(ErrorCode::CalibrationMismatch, stage, "gain map has no payload"))?;
    frame.map_pixels(|idx, value| quantize(f32::from(value) * factors[idx]));
    Ok(())
}
