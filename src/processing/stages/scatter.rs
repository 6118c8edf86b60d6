//! Frequency-domain scatter suppression.
//!
//! Scatter shows up as a smooth, low-frequency haze. The stage estimates it
//! with a 2D low-pass filter applied in the Fourier domain and subtracts the
//! configured fraction of the estimate.

use super::{require_calibration, validate_frame};
use crate::calibration::{CalibrationDataset, CalibrationType, ScatterAlgorithm, ScatterParameters};
use crate::frame::Frame;
use crate::processing::{ErrorCode, Stage, StageError};
use num_complex::Complex;
use rustfft::FftPlanner;

/// Apply scatter correction; a disabled parameter set is a successful no-op.
///
/// Returns whether the frame was modified.
pub fn apply(
    frame: &mut Frame<'_>,
    params: Option<&CalibrationDataset>,
    planner: &mut FftPlanner<f32>,
) -> Result<bool, StageError> {
    let stage = Stage::ScatterCorrection;
    validate_frame(frame, stage)?;
    let dataset = require_calibration(params, CalibrationType::ScatterParams, frame, stage)?;
    let params = dataset
        .scatter_params()
        .ok_or_else(|| StageError::new(ErrorCode::CalibrationMismatch, stage, "scatter dataset has no payload"))?;
    if !params.enabled {
        return Ok(false);
    }
    check_params(params)?;

    let image = frame.to_f32();
    let estimate = low_pass(&image, frame.width as usize, frame.height as usize, params, planner);
    let corrected: Vec<f32> = image
        .iter()
        .zip(&estimate)
        .map(|(value, scatter)| value - params.suppression_ratio * scatter.max(0.0))
        .collect();
    frame.store_f32(&corrected);
    Ok(true)
}

fn check_params(params: &ScatterParameters) -> Result<(), StageError> {
    let invalid = |message: String| StageError::new(ErrorCode::InvalidParameter, Stage::ScatterCorrection, message);
    if !(params.cutoff > 0.0 && params.cutoff <= 1.0) {
        return Err(invalid(format!("cutoff {} outside (0, 1]", params.cutoff)));
    }
    if !(0.0..=1.0).contains(&params.suppression_ratio) {
        return Err(invalid(format!(
            "suppression ratio {} outside [0, 1]",
            params.suppression_ratio
        )));
    }
    Ok(())
}

/// Signed frequency of bin `k` of an `n`-point transform, as a fraction of Nyquist.
fn normalised_frequency(k: usize, n: usize) -> f32 {
    let signed = if k <= n / 2 { k as f32 } else { k as f32 - n as f32 };
    // cycles per pixel, Nyquist = 0.5
    (signed / n as f32) / 0.5
}

fn transfer(algorithm: ScatterAlgorithm, f: f32, cutoff: f32) -> f32 {
    let ratio = f / cutoff;
    match algorithm {
        ScatterAlgorithm::GaussianLowPass => (-0.5 * ratio * ratio).exp(),
        ScatterAlgorithm::Butterworth => 1.0 / (1.0 + ratio.powi(4)),
    }
}

fn low_pass(
    image: &[f32],
    width: usize,
    height: usize,
    params: &ScatterParameters,
    planner: &mut FftPlanner<f32>,
) -> Vec<f32> {
    let mut data: Vec<Complex<f32>> = image.iter().map(|v| Complex::new(*v, 0.0)).collect();

    let row_forward = planner.plan_fft_forward(width);
    let col_forward = planner.plan_fft_forward(height);
    let row_inverse = planner.plan_fft_inverse(width);
    let col_inverse = planner.plan_fft_inverse(height);

    row_forward.process(&mut data);
    let mut columns = transpose(&data, width, height);
    col_forward.process(&mut columns);

    // `columns` is height-major per column: index = x * height + y
    for x in 0..width {
        let fx = normalised_frequency(x, width);
        for y in 0..height {
            let fy = normalised_frequency(y, height);
            let f = (fx * fx + fy * fy).sqrt();
            columns[x * height + y] *= transfer(params.algorithm, f, params.cutoff);
        }
    }

    col_inverse.process(&mut columns);
    let mut data = transpose(&columns, height, width);
    row_inverse.process(&mut data);

    let scale = (width * height) as f32;
    data.into_iter().map(|c| c.re / scale).collect()
}

/// Transpose a row-major `width` x `height` matrix.
fn transpose(data: &[Complex<f32>], width: usize, height: usize) -> Vec<Complex<f32>> {
    let mut out = vec![Complex::new(0.0, 0.0); data.len()];
    for y in 0..height {
        for x in 0..width {
            out[x * height + y] = data[y * width + x];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationPayload;
    use crate::frame::FrameBuffer;
    use chrono::Utc;

    fn scatter(width: u32, height: u32, params: ScatterParameters) -> CalibrationDataset {
        CalibrationDataset::new(width, height, Utc::now(), CalibrationPayload::ScatterParams(params))
    }

    #[test]
    fn disabled_is_noop() {
        let mut buffer = FrameBuffer::gradient(8, 8, 100, 900);
        let before = buffer.clone();
        let dataset = scatter(
            8,
            8,
            ScatterParameters {
                enabled: false,
                ..Default::default()
            },
        );
        let changed = apply(&mut buffer.as_frame(), Some(&dataset), &mut FftPlanner::new()).unwrap();
        assert!(!changed);
        assert_eq!(buffer, before);
    }

    #[test]
    fn uniform_frame_loses_suppressed_fraction() {
        // A constant image is pure DC, which every low-pass passes unchanged.
        let mut buffer = FrameBuffer::from_u16(16, 8, &[1000; 128]);
        let dataset = scatter(
            16,
            8,
            ScatterParameters {
                suppression_ratio: 0.25,
                ..Default::default()
            },
        );
        apply(&mut buffer.as_frame(), Some(&dataset), &mut FftPlanner::new()).unwrap();
        assert!(buffer.to_u16().iter().all(|v| (*v as i32 - 750).abs() <= 1));
    }

    #[test]
    fn edges_survive_better_than_background() {
        let mut pixels = vec![1000u16; 32 * 32];
        pixels[16 * 32 + 16] = 5000;
        let mut buffer = FrameBuffer::from_u16(32, 32, &pixels);
        let dataset = scatter(
            32,
            32,
            ScatterParameters {
                algorithm: ScatterAlgorithm::Butterworth,
                cutoff: 0.1,
                suppression_ratio: 0.5,
                ..Default::default()
            },
        );
        apply(&mut buffer.as_frame(), Some(&dataset), &mut FftPlanner::new()).unwrap();
        let out = buffer.to_u16();
        // the spike keeps most of its contrast, the background halves
        assert!(out[16 * 32 + 16] > 4000);
        assert!(out[0] < 600);
    }

    #[test]
    fn bad_cutoff_is_rejected() {
        let mut buffer = FrameBuffer::new(4, 4);
        let mut params = ScatterParameters::default();
        params.cutoff = 0.0;
        let dataset = scatter(4, 4, params);
        let err = apply(&mut buffer.as_frame(), Some(&dataset), &mut FftPlanner::new()).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParameter);
    }
}
