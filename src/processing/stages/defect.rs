//! Defective pixel repair.
//!
//! Neighbours that are themselves listed as defective are not used as
//! sources unless nothing else is available. Entries outside the frame are
//! skipped.

use super::{median, require_calibration, validate_frame};
use crate::calibration::{CalibrationDataset, CalibrationType, DefectEntry, Interpolation};
use crate::frame::{quantize, Frame};
use crate::processing::{ErrorCode, Stage, StageError};
use std::collections::HashSet;
use tracing::trace;

const NEAREST_SEARCH_RADIUS: i64 = 3;

/// Repair every in-bounds defect listed in the map, in map order.
///
/// Returns the number of pixels repaired.
pub fn apply(frame: &mut Frame<'_>, defects: Option<&CalibrationDataset>) -> Result<usize, StageError> {
    let stage = Stage::DefectPixelMap;
    validate_frame(frame, stage)?;
    let map = require_calibration(defects, CalibrationType::DefectMap, frame, stage)?;
    let entries = map
        .defect_map()
        .ok_or_else(|| StageError::new(ErrorCode::CalibrationMismatch, stage, "defect map has no payload"))?;

    let (width, height) = (frame.width, frame.height);
    let defective: HashSet<(u32, u32)> = entries
        .iter()
        .filter(|e| e.x < width && e.y < height)
        .map(|e| (e.x, e.y))
        .collect();

    let mut repaired = 0;
    let mut skipped = 0;
    for entry in entries {
        if entry.x >= width || entry.y >= height {
            skipped += 1;
            continue;
        }
        if let Some(value) = replacement(frame, entry, &defective) {
            frame.set_pixel(entry.x, entry.y, quantize(value));
            repaired += 1;
        }
    }
    if skipped > 0 {
        trace!(skipped, "Skipped out-of-bounds defect entries");
    }
    Ok(repaired)
}

fn sample(frame: &Frame<'_>, x: i64, y: i64) -> Option<(u32, u32, f32)> {
    if x < 0 || y < 0 || x >= i64::from(frame.width) || y >= i64::from(frame.height) {
        return None;
    }
    let (x, y) = (x as u32, y as u32);
    Some((x, y, f32::from(frame.pixel(x, y))))
}

/// Prefer good neighbours; fall back to any in-bounds neighbour.
fn pick(candidates: Vec<(u32, u32, f32)>, defective: &HashSet<(u32, u32)>) -> Vec<f32> {
    let good: Vec<f32> = candidates
        .iter()
        .filter(|(x, y, _)| !defective.contains(&(*x, *y)))
        .map(|(_, _, v)| *v)
        .collect();
    if good.is_empty() {
        candidates.into_iter().map(|(_, _, v)| v).collect()
    } else {
        good
    }
}

fn replacement(frame: &Frame<'_>, entry: &DefectEntry, defective: &HashSet<(u32, u32)>) -> Option<f32> {
    let (x, y) = (i64::from(entry.x), i64::from(entry.y));
    match entry.interpolation {
        Interpolation::Nearest => {
            for distance in 1..=NEAREST_SEARCH_RADIUS {
                let ring = [(x - distance, y), (x + distance, y), (x, y - distance), (x, y + distance)];
                let found = ring
                    .iter()
                    .filter_map(|&(nx, ny)| sample(frame, nx, ny))
                    .find(|(nx, ny, _)| !defective.contains(&(*nx, *ny)));
                if let Some((_, _, value)) = found {
                    return Some(value);
                }
            }
            None
        }
        Interpolation::Bilinear => {
            let candidates = [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)]
                .iter()
                .filter_map(|&(nx, ny)| sample(frame, nx, ny))
                .collect();
            let values = pick(candidates, defective);
            (!values.is_empty()).then(|| values.iter().sum::<f32>() / values.len() as f32)
        }
        Interpolation::Median3x3 => {
            let candidates = (-1..=1)
                .flat_map(|dy| (-1..=1).map(move |dx| (dx, dy)))
                .filter(|&(dx, dy)| dx != 0 || dy != 0)
                .filter_map(|(dx, dy)| sample(frame, x + dx, y + dy))
                .collect();
            let mut values = pick(candidates, defective);
            (!values.is_empty()).then(|| median(&mut values))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationPayload, DefectClass};
    use crate::frame::FrameBuffer;
    use chrono::Utc;

    fn map(width: u32, height: u32, entries: Vec<DefectEntry>) -> CalibrationDataset {
        CalibrationDataset::new(width, height, Utc::now(), CalibrationPayload::DefectMap(entries))
    }

    fn frame_3x3(centre: u16) -> FrameBuffer {
        FrameBuffer::from_u16(3, 3, &[10, 20, 30, 40, centre, 60, 70, 80, 90])
    }

    #[test]
    fn bilinear_averages_cross() {
        let mut buffer = frame_3x3(9999);
        let defects = map(3, 3, vec![DefectEntry::new(1, 1, DefectClass::Hot, Interpolation::Bilinear)]);
        assert_eq!(apply(&mut buffer.as_frame(), Some(&defects)).unwrap(), 1);
        // (20 + 40 + 60 + 80) / 4
        assert_eq!(buffer.to_u16()[4], 50);
    }

    #[test]
    fn median_uses_ring() {
        let mut buffer = frame_3x3(0);
        let defects = map(3, 3, vec![DefectEntry::new(1, 1, DefectClass::Dead, Interpolation::Median3x3)]);
        apply(&mut buffer.as_frame(), Some(&defects)).unwrap();
        // median of 10,20,30,40,60,70,80,90
        assert_eq!(buffer.to_u16()[4], 50);
    }

    #[test]
    fn nearest_skips_defective_neighbour() {
        let mut buffer = FrameBuffer::from_u16(4, 1, &[0, 0, 500, 700]);
        let defects = map(
            4,
            1,
            vec![
                DefectEntry::new(0, 0, DefectClass::Dead, Interpolation::Nearest),
                DefectEntry::new(1, 0, DefectClass::Dead, Interpolation::Nearest),
            ],
        );
        apply(&mut buffer.as_frame(), Some(&defects)).unwrap();
        assert_eq!(buffer.to_u16(), vec![500, 500, 500, 700]);
    }

    #[test]
    fn out_of_bounds_entries_are_skipped() {
        let mut buffer = frame_3x3(50);
        let before = buffer.clone();
        let defects = map(3, 3, vec![DefectEntry::new(1000, 1000, DefectClass::Hot, Interpolation::Bilinear)]);
        assert_eq!(apply(&mut buffer.as_frame(), Some(&defects)).unwrap(), 0);
        assert_eq!(buffer, before);
    }
}
