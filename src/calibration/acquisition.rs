//! Building calibration datasets from raw frames.
//!
//! Dark frames are averaged without exposure; flat fields are averaged under
//! uniform exposure and turned into a per-pixel response. The gain map and the
//! defect map are both derived from that response.

use super::dataset::{
    CalibrationDataset, CalibrationPayload, DefectClass, DefectEntry, Interpolation,
};
use super::CalibrationError;
use crate::frame::FrameBuffer;
use chrono::Utc;
use std::collections::HashSet;

/// Thresholds for defect detection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DefectThresholds {
    /// Dark offset above the median that marks a pixel hot, in counts
    pub hot_offset: f32,
    /// Response below this fraction of the mean marks a pixel dead
    pub min_response: f32,
}

impl Default for DefectThresholds {
    fn default() -> Self {
        Self {
            hot_offset: 500.0,
            min_response: 0.2,
        }
    }
}

fn check_frames(width: u32, height: u32, frames: &[FrameBuffer]) -> Result<(), CalibrationError> {
    if frames.is_empty() {
        return Err(CalibrationError::InvalidPayload("no frames to average".into()));
    }
    if let Some(frame) = frames.iter().find(|f| f.width != width || f.height != height) {
        return Err(CalibrationError::DimensionMismatch {
            expected: (width, height),
            found: (frame.width, frame.height),
        });
    }
    Ok(())
}

fn mean_image(width: u32, height: u32, frames: &[FrameBuffer]) -> Result<Vec<f32>, CalibrationError> {
    check_frames(width, height, frames)?;
    let mut sum = vec![0f64; width as usize * height as usize];
    for frame in frames {
        for (acc, value) in sum.iter_mut().zip(frame.to_u16()) {
            *acc += f64::from(value);
        }
    }
    let n = frames.len() as f64;
    Ok(sum.into_iter().map(|s| (s / n) as f32).collect())
}

/// Average unexposed frames into a dark frame.
pub fn average_dark(
    width: u32,
    height: u32,
    frames: &[FrameBuffer],
) -> Result<CalibrationDataset, CalibrationError> {
    let mean = mean_image(width, height, frames)?;
    Ok(CalibrationDataset::new(
        width,
        height,
        Utc::now(),
        CalibrationPayload::DarkFrame(mean),
    ))
}

/// Dark-subtracted mean response of flat-field frames.
pub fn flat_response(
    dark: &CalibrationDataset,
    flats: &[FrameBuffer],
) -> Result<Vec<f32>, CalibrationError> {
    let offsets = dark
        .dark_frame()
        .ok_or_else(|| CalibrationError::InvalidPayload("a valid dark frame is required".into()))?;
    let mut mean = mean_image(dark.width, dark.height, flats)?;
    for (value, offset) in mean.iter_mut().zip(offsets) {
        *value = (*value - offset).max(0.0);
    }
    Ok(mean)
}

/// Gain map normalising every pixel to the mean response.
///
/// Pixels without response get unit gain; the defect map is expected to
/// repair them.
pub fn gain_from_response(
    width: u32,
    height: u32,
    response: &[f32],
) -> Result<CalibrationDataset, CalibrationError> {
    let responsive: Vec<f32> = response.iter().copied().filter(|r| *r > 0.0).collect();
    if responsive.is_empty() {
        return Err(CalibrationError::InvalidPayload("flat fields show no response".into()));
    }
    let mean = responsive.iter().map(|r| f64::from(*r)).sum::<f64>() / responsive.len() as f64;
    let gains = response
        .iter()
        .map(|r| if *r > 0.0 { (mean / f64::from(*r)) as f32 } else { 1.0 })
        .collect();
    Ok(CalibrationDataset::new(
        width,
        height,
        Utc::now(),
        CalibrationPayload::GainMap(gains),
    ))
}

/// Gain map from flat-field frames.
pub fn gain_from_flats(
    dark: &CalibrationDataset,
    flats: &[FrameBuffer],
) -> Result<CalibrationDataset, CalibrationError> {
    let response = flat_response(dark, flats)?;
    gain_from_response(dark.width, dark.height, &response)
}

/// Detect hot pixels from the dark frame and dead pixels from the flat response.
///
/// Defects with a defective 8-neighbour are classed `Cluster` and repaired
/// with the 3x3 median; isolated ones use bilinear repair, or nearest on the
/// frame border.
pub fn detect_defects(
    dark: &CalibrationDataset,
    response: &[f32],
    thresholds: DefectThresholds,
) -> Result<CalibrationDataset, CalibrationError> {
    let offsets = dark
        .dark_frame()
        .ok_or_else(|| CalibrationError::InvalidPayload("a valid dark frame is required".into()))?;
    let (width, height) = (dark.width, dark.height);
    if response.len() != offsets.len() {
        return Err(CalibrationError::PayloadLength {
            expected: offsets.len() as u64,
            actual: response.len() as u64,
        });
    }

    let mut sorted = offsets.to_vec();
    sorted.sort_by(f32::total_cmp);
    let median_dark = sorted[sorted.len() / 2];

    let responsive: Vec<f32> = response.iter().copied().filter(|r| *r > 0.0).collect();
    let mean_response = if responsive.is_empty() {
        0.0
    } else {
        responsive.iter().sum::<f32>() / responsive.len() as f32
    };
    let dead_limit = mean_response * thresholds.min_response;

    let mut found: Vec<(u32, u32, DefectClass)> = Vec::new();
    for (idx, (offset, r)) in offsets.iter().zip(response).enumerate() {
        let (x, y) = ((idx % width as usize) as u32, (idx / width as usize) as u32);
        if *offset > median_dark + thresholds.hot_offset {
            found.push((x, y, DefectClass::Hot));
        } else if *r <= dead_limit {
            found.push((x, y, DefectClass::Dead));
        }
    }

    let positions: HashSet<(u32, u32)> = found.iter().map(|(x, y, _)| (*x, *y)).collect();
    let entries = found
        .into_iter()
        .map(|(x, y, class)| {
            let clustered = neighbours(x, y, width, height).any(|p| positions.contains(&p));
            let on_border = x == 0 || y == 0 || x + 1 == width || y + 1 == height;
            if clustered {
                DefectEntry::new(x, y, DefectClass::Cluster, Interpolation::Median3x3)
            } else if on_border {
                DefectEntry::new(x, y, class, Interpolation::Nearest)
            } else {
                DefectEntry::new(x, y, class, Interpolation::Bilinear)
            }
        })
        .collect();

    Ok(CalibrationDataset::new(
        width,
        height,
        Utc::now(),
        CalibrationPayload::DefectMap(entries),
    ))
}

fn neighbours(x: u32, y: u32, width: u32, height: u32) -> impl Iterator<Item = (u32, u32)> {
    (-1i64..=1)
        .flat_map(|dy| (-1i64..=1).map(move |dx| (dx, dy)))
        .filter(|&(dx, dy)| dx != 0 || dy != 0)
        .filter_map(move |(dx, dy)| {
            let nx = i64::from(x) + dx;
            let ny = i64::from(y) + dy;
            (nx >= 0 && ny >= 0 && nx < i64::from(width) && ny < i64::from(height))
                .then_some((nx as u32, ny as u32))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(width: u32, height: u32, value: u16) -> FrameBuffer {
        FrameBuffer::from_u16(width, height, &vec![value; (width * height) as usize])
    }

    #[test]
    fn dark_is_frame_mean() {
        let frames = vec![uniform(2, 2, 100), uniform(2, 2, 110)];
        let dark = average_dark(2, 2, &frames).unwrap();
        assert_eq!(dark.dark_frame().unwrap(), &[105.0; 4]);
    }

    #[test]
    fn mismatched_frames_rejected() {
        let frames = vec![uniform(2, 2, 100), uniform(3, 2, 100)];
        assert!(matches!(
            average_dark(2, 2, &frames),
            Err(CalibrationError::DimensionMismatch { .. })
        ));
        assert!(average_dark(2, 2, &[]).is_err());
    }

    #[test]
    fn gain_normalises_response() {
        let dark = average_dark(2, 1, &[uniform(2, 1, 100)]).unwrap();
        let flat = FrameBuffer::from_u16(2, 1, &[1100, 2100]);
        let gain = gain_from_flats(&dark, &[flat]).unwrap();
        let values = gain.gain_map().unwrap();
        // responses 1000 and 2000, mean 1500
        assert!((values[0] - 1.5).abs() < 1e-6);
        assert!((values[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn defects_are_classified() {
        let width = 5;
        let mut dark_pixels = vec![100u16; 25];
        dark_pixels[12] = 5000; // hot, centre
        let dark = average_dark(width, 5, &[FrameBuffer::from_u16(width, 5, &dark_pixels)]).unwrap();

        let mut response = vec![1000.0f32; 25];
        response[0] = 0.0; // dead, corner
        response[3] = 0.0; // dead, adjacent to 4
        response[4] = 0.0;

        let map = detect_defects(&dark, &response, DefectThresholds::default()).unwrap();
        let entries = map.defect_map().unwrap();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0], DefectEntry::new(0, 0, DefectClass::Dead, Interpolation::Nearest));
        assert_eq!(entries[1].class, DefectClass::Cluster);
        assert_eq!(entries[2].class, DefectClass::Cluster);
        assert_eq!(
            entries[3],
            DefectEntry::new(2, 2, DefectClass::Hot, Interpolation::Bilinear)
        );
    }
}
