//! Display windowing.

use super::validate_frame;
use crate::frame::{quantize, Frame, PIXEL_MAX};
use crate::processing::{ErrorCode, Stage, StageError};

/// Check a window/level pair without touching any frame.
pub fn check(window: f32, level: f32) -> Result<(), StageError> {
    if !window.is_finite() || window <= 0.0 {
        return Err(StageError::new(
            ErrorCode::InvalidParameter,
            Stage::WindowLevel,
            format!("window must be strictly positive, got {window}"),
        ));
    }
    if !level.is_finite() {
        return Err(StageError::new(
            ErrorCode::InvalidParameter,
            Stage::WindowLevel,
            format!("level must be finite, got {level}"),
        ));
    }
    Ok(())
}

/// Map `[level - window/2, level + window/2]` linearly onto the full 16-bit range.
pub fn apply(frame: &mut Frame<'_>, window: f32, level: f32) -> Result<(), StageError> {
    validate_frame(frame, Stage::WindowLevel)?;
    check(window, level)?;
    let low = level - window / 2.0;
    frame.map_pixels(|_, value| {
        let t = ((f32::from(value) - low) / window).clamp(0.0, 1.0);
        quantize(t * PIXEL_MAX)
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuffer;

    #[test]
    fn maps_window_to_full_range() {
        let mut buffer = FrameBuffer::from_u16(4, 1, &[0, 1000, 2000, 3000]);
        apply(&mut buffer.as_frame(), 2000.0, 2000.0).unwrap();
        assert_eq!(buffer.to_u16(), vec![0, 0, 32768, u16::MAX]);
    }

    #[test]
    fn non_positive_window_leaves_frame_unchanged() {
        let mut buffer = FrameBuffer::gradient(8, 2, 0, 4000);
        let before = buffer.data.clone();
        for window in [0.0, -10.0, f32::NAN] {
            let err = apply(&mut buffer.as_frame(), window, 2000.0).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidParameter);
            assert_eq!(err.stage, Stage::WindowLevel);
        }
        assert_eq!(buffer.data, before);
    }
}
