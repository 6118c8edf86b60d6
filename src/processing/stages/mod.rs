//! Correction stages.
//!
//! Every stage checks its frame and inputs before touching a pixel, so a
//! failing stage leaves the frame exactly as it found it.

pub mod defect;
pub mod flatten;
pub mod gain;
pub mod noise;
pub mod offset;
pub mod scatter;
pub mod window_level;

use super::{ErrorCode, Stage, StageError};
use crate::calibration::{CalibrationDataset, CalibrationType};
use crate::frame::Frame;

/// Frame contract check shared by every stage.
pub(crate) fn validate_frame(frame: &Frame<'_>, stage: Stage) -> Result<(), StageError> {
    frame
        .validate()
        .map_err(|e| StageError::new(ErrorCode::InvalidParameter, stage, e.to_string()))
}

/// Calibration input check: present, valid, of `kind`, sized like `frame`.
pub(crate) fn require_calibration<'c>(
    dataset: Option<&'c CalibrationDataset>,
    kind: CalibrationType,
    frame: &Frame<'_>,
    stage: Stage,
) -> Result<&'c CalibrationDataset, StageError> {
    let mismatch = |message: String| StageError::new(ErrorCode::CalibrationMismatch, stage, message);
    let dataset = dataset.ok_or_else(|| mismatch(format!("no {kind} provided")))?;
    if dataset.kind != kind {
        return Err(mismatch(format!("expected {kind}, got {}", dataset.kind)));
    }
    if !dataset.is_valid() {
        return Err(mismatch(format!(
            "{kind} is invalid: {}",
            dataset.invalid_reason().unwrap_or("unknown reason")
        )));
    }
    if !dataset.matches_dimensions(frame.width, frame.height) {
        return Err(mismatch(format!(
            "{kind} is {}x{}, frame is {}x{}",
            dataset.width, dataset.height, frame.width, frame.height
        )));
    }
    if let Some(values) = dataset.dark_frame().or_else(|| dataset.gain_map()) {
        if values.len() != frame.pixel_count() {
            return Err(mismatch(format!(
                "{kind} holds {} values, frame has {} pixels",
                values.len(),
                frame.pixel_count()
            )));
        }
    }
    Ok(dataset)
}

/// Value at (x, y) of a dense row-major image, with coordinates clamped to the edges.
pub(crate) fn clamped(image: &[f32], width: usize, height: usize, x: i64, y: i64) -> f32 {
    let cx = x.clamp(0, width as i64 - 1) as usize;
    let cy = y.clamp(0, height as i64 - 1) as usize;
    image[cy * width + cx]
}

/// Median of a small, non-empty sample.
pub(crate) fn median(values: &mut [f32]) -> f32 {
    values.sort_by(f32::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
