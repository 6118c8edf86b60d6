//! Dark frame subtraction.

use super::{require_calibration, validate_frame};
use crate::calibration::{CalibrationDataset, CalibrationType};
use crate::frame::{quantize, Frame};
use crate::processing::{ErrorCode, Stage, StageError};

/// Subtract the dark frame, clamping at zero.
pub fn apply(frame: &mut Frame<'_>, dark: Option<&CalibrationDataset>) -> Result<(), StageError> {
    let stage = Stage::OffsetCorrection;
    validate_frame(frame, stage)?;
    let dark = require_calibration(dark, CalibrationType::DarkFrame, frame, stage)?;
    let Some(offsets) = dark.dark_frame() else {
        return Err(StageError::new(
            ErrorCode::CalibrationMismatch,
            stage,
            "dark frame has no payload",
        ));
    };
    frame.map_pixels(|idx, value| quantize(f32::from(value) - offsets[idx]));
    Ok(())
}
