//! Background illumination correction.
//!
//! Estimates the slowly varying background with a box mean of the configured
//! radius and divides it out, rescaled to the mean background so overall
//! brightness is kept.

use super::validate_frame;
use crate::frame::Frame;
use crate::processing::config::FlatteningParams;
use crate::processing::{ErrorCode, Stage, StageError};

/// Check flattening settings without touching any frame.
pub fn check(params: &FlatteningParams) -> Result<(), StageError> {
    if params.radius == 0 {
        return Err(StageError::new(
            ErrorCode::InvalidParameter,
            Stage::Flattening,
            "flattening radius must be at least 1",
        ));
    }
    Ok(())
}

/// Flatten the frame's background.
pub fn apply(frame: &mut Frame<'_>, params: &FlatteningParams) -> Result<(), StageError> {
    validate_frame(frame, Stage::Flattening)?;
    check(params)?;
    let (width, height) = (frame.width as usize, frame.height as usize);
    let image = frame.to_f32();
    let background = box_mean(&image, width, height, params.radius as usize);

    let mean_background = background.iter().map(|v| f64::from(*v)).sum::<f64>() / background.len() as f64;
    let mean_background = mean_background as f32;
    let flattened: Vec<f32> = image
        .iter()
        .zip(&background)
        .map(|(value, bg)| if *bg > 0.0 { value * mean_background / bg } else { *value })
        .collect();
    frame.store_f32(&flattened);
    Ok(())
}

/// Box mean over a `(2r+1)^2` window truncated at the frame edges, via a summed-area table.
fn box_mean(image: &[f32], width: usize, height: usize, radius: usize) -> Vec<f32> {
    let stride = width + 1;
    let mut table = vec![0f64; stride * (height + 1)];
    for y in 0..height {
        let mut row_sum = 0f64;
        for x in 0..width {
            row_sum += f64::from(image[y * width + x]);
            table[(y + 1) * stride + x + 1] = table[y * stride + x + 1] + row_sum;
        }
    }

    let mut out = vec![0.0; image.len()];
    for y in 0..height {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius + 1).min(height);
        for x in 0..width {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(width);
            let sum = table[y1 * stride + x1] - table[y0 * stride + x1] - table[y1 * stride + x0]
                + table[y0 * stride + x0];
            let count = ((y1 - y0) * (x1 - x0)) as f64;
            out[y * width + x] = (sum / count) as f32;
        }
    }
    out
}
