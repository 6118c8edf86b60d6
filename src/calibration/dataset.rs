//! Calibration data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Kind of correction dataset. The discriminant is the on-disk type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationType {
    /// Per-pixel offset measured without exposure
    DarkFrame = 1,
    /// Per-pixel multiplicative sensitivity correction
    GainMap = 2,
    /// List of defective pixels and how to repair them
    DefectMap = 3,
    /// Frequency-domain scatter suppression settings
    ScatterParams = 4,
}

impl CalibrationType {
    /// All kinds in pipeline order.
    pub const ALL: [CalibrationType; 4] = [
        CalibrationType::DarkFrame,
        CalibrationType::GainMap,
        CalibrationType::DefectMap,
        CalibrationType::ScatterParams,
    ];

    /// On-disk type code.
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Parse an on-disk type code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(CalibrationType::DarkFrame),
            2 => Some(CalibrationType::GainMap),
            3 => Some(CalibrationType::DefectMap),
            4 => Some(CalibrationType::ScatterParams),
            _ => None,
        }
    }

    /// Conventional file name inside a calibration directory.
    pub fn file_name(self) -> &'static str {
        match self {
            CalibrationType::DarkFrame => "dark.xcal",
            CalibrationType::GainMap => "gain.xcal",
            CalibrationType::DefectMap => "defect.xcal",
            CalibrationType::ScatterParams => "scatter.xcal",
        }
    }
}

impl std::fmt::Display for CalibrationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            CalibrationType::DarkFrame => "dark-frame",
            CalibrationType::GainMap => "gain-map",
            CalibrationType::DefectMap => "defect-map",
            CalibrationType::ScatterParams => "scatter-params",
        };
        f.write_str(label)
    }
}

/// Why a pixel is defective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectClass {
    /// No response
    Dead = 0,
    /// Stuck high
    Hot = 1,
    /// Part of a group of adjacent defects
    Cluster = 2,
}

impl DefectClass {
    /// Parse an on-disk code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(DefectClass::Dead),
            1 => Some(DefectClass::Hot),
            2 => Some(DefectClass::Cluster),
            _ => None,
        }
    }
}

/// How a defective pixel is replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    /// Copy the closest non-defective direct neighbour
    Nearest = 0,
    /// Mean of the four direct neighbours
    Bilinear = 1,
    /// Median of the 3x3 neighbourhood excluding the pixel itself
    Median3x3 = 2,
}

impl Interpolation {
    /// Parse an on-disk code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Interpolation::Nearest),
            1 => Some(Interpolation::Bilinear),
            2 => Some(Interpolation::Median3x3),
            _ => None,
        }
    }
}

/// One entry of a defect map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectEntry {
    /// Column
    pub x: u32,
    /// Row
    pub y: u32,
    /// Defect class
    pub class: DefectClass,
    /// Repair strategy
    pub interpolation: Interpolation,
}

impl DefectEntry {
    /// Convenience constructor.
    pub fn new(x: u32, y: u32, class: DefectClass, interpolation: Interpolation) -> Self {
        Self {
            x,
            y,
            class,
            interpolation,
        }
    }
}

/// Frequency-domain filter used for scatter estimation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScatterAlgorithm {
    /// Gaussian low-pass transfer function
    GaussianLowPass = 0,
    /// Second-order Butterworth low-pass
    Butterworth = 1,
}

impl ScatterAlgorithm {
    /// Parse an on-disk code.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(ScatterAlgorithm::GaussianLowPass),
            1 => Some(ScatterAlgorithm::Butterworth),
            _ => None,
        }
    }
}

/// Scatter correction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScatterParameters {
    /// Correction runs only when set
    pub enabled: bool,
    /// Low-pass filter shape
    pub algorithm: ScatterAlgorithm,
    /// Cutoff as a fraction of the Nyquist frequency, in (0, 1]
    pub cutoff: f32,
    /// Fraction of the estimated scatter removed, in [0, 1]
    pub suppression_ratio: f32,
    /// Reserved vendor flags
    pub flags: u32,
}

impl Default for ScatterParameters {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: ScatterAlgorithm::GaussianLowPass,
            cutoff: 0.05,
            suppression_ratio: 0.5,
            flags: 0,
        }
    }
}

/// Decoded payload of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationPayload {
    /// Offset per pixel, row major
    DarkFrame(Vec<f32>),
    /// Gain per pixel, row major
    GainMap(Vec<f32>),
    /// Ordered defect list
    DefectMap(Vec<DefectEntry>),
    /// Scatter settings
    ScatterParams(ScatterParameters),
}

impl CalibrationPayload {
    /// Kind this payload belongs to.
    pub fn kind(&self) -> CalibrationType {
        match self {
            CalibrationPayload::DarkFrame(_) => CalibrationType::DarkFrame,
            CalibrationPayload::GainMap(_) => CalibrationType::GainMap,
            CalibrationPayload::DefectMap(_) => CalibrationType::DefectMap,
            CalibrationPayload::ScatterParams(_) => CalibrationType::ScatterParams,
        }
    }
}

/// A correction dataset, valid or explicitly invalid.
///
/// An invalid dataset never carries a payload; [`invalid_reason`](Self::invalid_reason)
/// says why it was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationDataset {
    /// Dataset kind
    pub kind: CalibrationType,
    /// Declared width in pixels
    pub width: u32,
    /// Declared height in pixels
    pub height: u32,
    /// SHA-256 of the encoded payload
    pub checksum: [u8; 32],
    /// When the calibration was acquired
    pub acquired_at: DateTime<Utc>,
    /// File the dataset was loaded from
    pub source: Option<PathBuf>,
    valid: bool,
    payload: Option<CalibrationPayload>,
    invalid_reason: Option<String>,
}

impl CalibrationDataset {
    /// Build a dataset, computing its checksum from the payload.
    ///
    /// A dark frame or gain map must hold exactly `width * height` values;
    /// otherwise the result is an invalid dataset without payload.
    pub fn new(
        width: u32,
        height: u32,
        acquired_at: DateTime<Utc>,
        payload: CalibrationPayload,
    ) -> Self {
        if let CalibrationPayload::DarkFrame(values) | CalibrationPayload::GainMap(values) = &payload {
            let expected = width as usize * height as usize;
            if values.len() != expected {
                let reason = format!(
                    "{} payload holds {} values, {width}x{height} needs {expected}",
                    payload.kind(),
                    values.len()
                );
                return Self {
                    width,
                    height,
                    acquired_at,
                    ..Self::invalid(payload.kind(), reason)
                };
            }
        }
        let checksum = payload_checksum(&super::format::encode_payload(&payload));
        Self {
            kind: payload.kind(),
            width,
            height,
            checksum,
            acquired_at,
            source: None,
            valid: true,
            payload: Some(payload),
            invalid_reason: None,
        }
    }

    /// An explicitly invalid dataset without payload.
    pub fn invalid(kind: CalibrationType, reason: impl Into<String>) -> Self {
        Self {
            kind,
            width: 0,
            height: 0,
            checksum: [0; 32],
            acquired_at: DateTime::<Utc>::UNIX_EPOCH,
            source: None,
            valid: false,
            payload: None,
            invalid_reason: Some(reason.into()),
        }
    }

    /// Record where the dataset came from.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.source = Some(path.into());
        self
    }

    /// Whether every load check passed.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Reason the dataset was rejected.
    pub fn invalid_reason(&self) -> Option<&str> {
        self.invalid_reason.as_deref()
    }

    /// Decoded payload, `None` for invalid datasets.
    pub fn payload(&self) -> Option<&CalibrationPayload> {
        self.payload.as_ref()
    }

    /// Whether the declared dimensions equal `width` x `height`.
    pub fn matches_dimensions(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Dark offsets, if this is a valid dark frame.
    pub fn dark_frame(&self) -> Option<&[f32]> {
        match &self.payload {
            Some(CalibrationPayload::DarkFrame(values)) if self.valid => Some(values),
            _ => None,
        }
    }

    /// Gain factors, if this is a valid gain map.
    pub fn gain_map(&self) -> Option<&[f32]> {
        match &self.payload {
            Some(CalibrationPayload::GainMap(values)) if self.valid => Some(values),
            _ => None,
        }
    }

    /// Defect entries, if this is a valid defect map.
    pub fn defect_map(&self) -> Option<&[DefectEntry]> {
        match &self.payload {
            Some(CalibrationPayload::DefectMap(entries)) if self.valid => Some(entries),
            _ => None,
        }
    }

    /// Scatter settings, if this is a valid scatter dataset.
    pub fn scatter_params(&self) -> Option<&ScatterParameters> {
        match &self.payload {
            Some(CalibrationPayload::ScatterParams(params)) if self.valid => Some(params),
            _ => None,
        }
    }

    /// Time since acquisition.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.acquired_at)
    }

    /// Checksum as lowercase hex.
    pub fn checksum_hex(&self) -> String {
        self.checksum.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// SHA-256 digest of an encoded payload.
pub fn payload_checksum(payload: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.finalize().into()
}
