//! Spatial noise reduction.

use super::{clamped, median, validate_frame};
use crate::frame::Frame;
use crate::processing::config::{NoiseFilter, NoiseReductionParams};
use crate::processing::{ErrorCode, Stage, StageError};

/// Largest accepted `sigma_spatial`, in pixels. The bilateral window is
/// `(4σ + 1)²` pixels, so this bounds it at 65x65.
pub const MAX_SIGMA_SPATIAL: f32 = 16.0;

/// Resolve and check the filter settings without touching any frame.
pub fn check(params: &NoiseReductionParams) -> Result<NoiseFilter, StageError> {
    let stage = Stage::NoiseReduction;
    let filter: NoiseFilter = params
        .filter
        .parse()
        .map_err(|message: String| StageError::new(ErrorCode::UnknownFilter, stage, message))?;
    let needs_spatial = matches!(filter, NoiseFilter::Gaussian | NoiseFilter::Bilateral);
    if needs_spatial && !(params.sigma_spatial.is_finite() && params.sigma_spatial > 0.0) {
        return Err(StageError::new(
            ErrorCode::InvalidParameter,
            stage,
            format!("sigma_spatial must be positive, got {}", params.sigma_spatial),
        ));
    }
    if needs_spatial && params.sigma_spatial > MAX_SIGMA_SPATIAL {
        return Err(StageError::new(
            ErrorCode::InvalidParameter,
            stage,
            format!(
                "sigma_spatial {} exceeds the maximum of {MAX_SIGMA_SPATIAL}",
                params.sigma_spatial
            ),
        ));
    }
    if filter == NoiseFilter::Bilateral && !(params.sigma_range.is_finite() && params.sigma_range > 0.0) {
        return Err(StageError::new(
            ErrorCode::InvalidParameter,
            stage,
            format!("sigma_range must be positive, got {}", params.sigma_range),
        ));
    }
    Ok(filter)
}

/// Filter the frame with the configured filter.
pub fn apply(frame: &mut Frame<'_>, params: &NoiseReductionParams) -> Result<(), StageError> {
    validate_frame(frame, Stage::NoiseReduction)?;
    let filter = check(params)?;
    let (width, height) = (frame.width as usize, frame.height as usize);
    let image = frame.to_f32();
    let filtered = match filter {
        NoiseFilter::Gaussian => gaussian(&image, width, height, params.sigma_spatial),
        NoiseFilter::Median => median3x3(&image, width, height),
        NoiseFilter::Bilateral => bilateral(&image, width, height, params.sigma_spatial, params.sigma_range),
    };
    frame.store_f32(&filtered);
    Ok(())
}

fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let radius = (3.0 * sigma).ceil() as i64;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|d| (-(d * d) as f32 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Separable Gaussian blur with clamped edges.
pub(crate) fn gaussian(image: &[f32], width: usize, height: usize, sigma: f32) -> Vec<f32> {
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;

    let mut horizontal = vec![0.0; image.len()];
    for y in 0..height {
        for x in 0..width {
            horizontal[y * width + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * clamped(image, width, height, x as i64 + k as i64 - radius, y as i64))
                .sum();
        }
    }

    let mut out = vec![0.0; image.len()];
    for y in 0..height {
        for x in 0..width {
            out[y * width + x] = kernel
                .iter()
                .enumerate()
                .map(|(k, w)| w * clamped(&horizontal, width, height, x as i64, y as i64 + k as i64 - radius))
                .sum();
        }
    }
    out
}

fn median3x3(image: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut out = vec![0.0; image.len()];
    let mut window = [0.0f32; 9];
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let mut i = 0;
            for dy in -1..=1 {
                for dx in -1..=1 {
                    window[i] = clamped(image, width, height, x + dx, y + dy);
                    i += 1;
                }
            }
            out[y as usize * width + x as usize] = median(&mut window);
        }
    }
    out
}

fn bilateral(image: &[f32], width: usize, height: usize, sigma_spatial: f32, sigma_range: f32) -> Vec<f32> {
    let radius = (2.0 * sigma_spatial).ceil() as i64;
    let spatial_denom = 2.0 * sigma_spatial * sigma_spatial;
    let range_denom = 2.0 * sigma_range * sigma_range;
    let mut out = vec![0.0; image.len()];
    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let centre = image[y as usize * width + x as usize];
            let mut weighted = 0.0;
            let mut total = 0.0;
            for dy in -radius..=radius {
                for dx in -radius..=radius {
                    let value = clamped(image, width, height, x + dx, y + dy);
                    let spatial = -((dx * dx + dy * dy) as f32) / spatial_denom;
                    let diff = value - centre;
                    let weight = (spatial - diff * diff / range_denom).exp();
                    weighted += weight * value;
                    total += weight;
                }
            }
            out[y as usize * width + x as usize] = weighted / total;
        }
    }
    out
}
