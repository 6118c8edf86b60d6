//! Calibration dataset lifecycle.
//!
//! Correction datasets (dark frame, gain map, defect map, scatter parameters)
//! are read from self-describing binary files ([`format`]), validated against
//! the configured frame dimensions and cached by the [`CalibrationManager`].
//! Processing calls read an immutable [`CalibrationSet`] snapshot; reloads
//! publish a new snapshot instead of mutating the one in use.
//!
//! [`acquisition`] builds new datasets from raw frames.

pub mod acquisition;
pub mod dataset;
pub mod format;
pub mod manager;

pub use dataset::{
    CalibrationDataset, CalibrationPayload, CalibrationType, DefectClass, DefectEntry,
    Interpolation, ScatterAlgorithm, ScatterParameters,
};
pub use format::CalibrationFile;
pub use manager::{CalibrationManager, CalibrationSet, CalibrationStatus};

use thiserror::Error;

/// Reasons a calibration file or dataset is rejected.
#[derive(Error, Debug)]
pub enum CalibrationError {
    /// Reading or writing the file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file does not start with the calibration magic.
    #[error("bad magic {0:02x?}, not a calibration file")]
    BadMagic([u8; 4]),

    /// The declared data type is not the one requested.
    #[error("declared type code {found} does not match requested {expected}")]
    TypeMismatch {
        /// Requested kind
        expected: CalibrationType,
        /// Type code found in the header
        found: u16,
    },

    /// The format version is not supported.
    #[error("unsupported format version {0}")]
    UnsupportedVersion(u16),

    /// Declared dimensions differ from the frame dimensions.
    #[error("declared dimensions {found:?} do not match frame dimensions {expected:?}")]
    DimensionMismatch {
        /// Configured (width, height)
        expected: (u32, u32),
        /// Declared (width, height)
        found: (u32, u32),
    },

    /// The payload is shorter or longer than declared.
    #[error("payload length {actual} does not match expected {expected}")]
    PayloadLength {
        /// Expected length in bytes
        expected: u64,
        /// Actual length in bytes
        actual: u64,
    },

    /// The payload digest does not match the header checksum.
    #[error("payload checksum mismatch")]
    ChecksumMismatch,

    /// The payload decodes to values outside their valid range.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
