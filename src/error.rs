//! Custom error types for the application.
//!
//! This module defines the primary error type, `XrayError`, for the whole crate.
//! Each component owns a narrower `thiserror` enum describing its own failure
//! modes, and `XrayError` consolidates them so the binary and orchestration
//! code can use `?` across component boundaries.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps `figment::Error` from loading the TOML file or the
//!   `RUST_XRAY_` environment overrides.
//! - **`Configuration`**: Values that parse but fail semantic validation
//!   (zero buffer depth, non-positive window, unknown filter name).
//! - **`Io`**: Plain `std::io::Error` from files outside the calibration store.
//! - **`Buffer`**: Frame ring buffer failures (size mismatch, empty, closed).
//! - **`Plugin`**: Detector plugin load, unload and capture failures.
//! - **`Calibration`**: Calibration file decoding and validation failures.
//! - **`Processing`**: A stage-tagged failure reported by the image processing
//!   engine.
//!
//! Stage calls on the engine do not raise: they return `Result<(), StageError>`
//! and additionally keep the failure as the engine's structured last error so an
//! orchestrator can decide to retry, skip or abort the frame.

use crate::calibration::CalibrationError;
use crate::data::ring_buffer::BufferError;
use crate::hardware::plugin::PluginError;
use crate::processing::StageError;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, XrayError>;

/// Primary error type for the X-ray data path.
#[derive(Error, Debug)]
pub enum XrayError {
    /// Configuration file or environment parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration validation failed.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame ring buffer error.
    #[error("Frame buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Detector plugin error.
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Calibration dataset error.
    #[error("Calibration error: {0}")]
    Calibration(#[from] CalibrationError),

    /// Image processing stage error.
    #[error("Processing error: {0}")]
    Processing(#[from] StageError),

    /// Shutdown of one or more worker threads failed.
    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<XrayError>),
}

impl From<figment::Error> for XrayError {
    fn from(value: figment::Error) -> Self {
        XrayError::Config(Box::new(value))
    }
}

impl XrayError {
    /// Whether the operator can recover by retrying or supplying new input
    /// without restarting the data path.
    pub fn can_recover(&self) -> bool {
        match self {
            XrayError::Config(_) | XrayError::Configuration(_) | XrayError::Io(_) => false,
            XrayError::Buffer(err) => !matches!(err, BufferError::Closed),
            XrayError::Plugin(_) => false,
            XrayError::Calibration(_) | XrayError::Processing(_) => true,
            XrayError::ShutdownFailed(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::{ErrorCode, Stage};

    #[test]
    fn processing_errors_are_recoverable() {
        let err: XrayError = StageError::new(
            ErrorCode::InvalidParameter,
            Stage::WindowLevel,
            "window must be positive",
        )
        .into();
        assert!(err.can_recover());
        assert!(err.to_string().contains("window-level"));
    }

    #[test]
    fn closed_buffer_is_not_recoverable() {
        let err: XrayError = BufferError::Closed.into();
        assert!(!err.can_recover());

        let err: XrayError = BufferError::Empty.into();
        assert!(err.can_recover());
    }

    #[test]
    fn shutdown_failure_lists_nothing_in_display() {
        let err = XrayError::ShutdownFailed(vec![XrayError::Configuration("x".into())]);
        assert_eq!(err.to_string(), "Shutdown failed with errors");
    }
}
