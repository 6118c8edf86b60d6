//! Per-frame processing configuration.

use crate::calibration::{CalibrationDataset, CalibrationSet};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Which stages run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingMode {
    /// Every enabled correction
    #[default]
    Full,
    /// Offset, gain and window/level only
    Preview,
}

impl std::fmt::Display for ProcessingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingMode::Full => f.write_str("full"),
            ProcessingMode::Preview => f.write_str("preview"),
        }
    }
}

/// Spatial noise filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseFilter {
    /// Separable Gaussian blur
    Gaussian,
    /// 3x3 median
    Median,
    /// Edge-preserving bilateral filter
    Bilateral,
}

impl FromStr for NoiseFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gaussian" => Ok(NoiseFilter::Gaussian),
            "median" => Ok(NoiseFilter::Median),
            "bilateral" => Ok(NoiseFilter::Bilateral),
            other => Err(format!("unknown noise filter '{other}'")),
        }
    }
}

/// Noise reduction settings.
///
/// The filter stays a string so configuration files can name filters this
/// build does not know; the engine rejects those with `UnknownFilter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseReductionParams {
    /// "gaussian", "median" or "bilateral"
    pub filter: String,
    /// Spatial sigma in pixels (Gaussian and bilateral)
    pub sigma_spatial: f32,
    /// Intensity sigma in counts (bilateral)
    pub sigma_range: f32,
}

impl Default for NoiseReductionParams {
    fn default() -> Self {
        Self {
            filter: "gaussian".to_string(),
            sigma_spatial: 1.0,
            sigma_range: 300.0,
        }
    }
}

/// Background flattening settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatteningParams {
    /// Box radius of the background estimate, in pixels
    pub radius: u32,
}

impl Default for FlatteningParams {
    fn default() -> Self {
        Self { radius: 32 }
    }
}

/// Latency budgets per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingBudgets {
    /// Full pipeline budget
    #[serde(with = "humantime_serde")]
    pub full_pipeline: Duration,
    /// Preview budget
    #[serde(with = "humantime_serde")]
    pub preview: Duration,
}

impl Default for ProcessingBudgets {
    fn default() -> Self {
        Self {
            full_pipeline: Duration::from_secs(2),
            preview: Duration::from_millis(500),
        }
    }
}

impl ProcessingBudgets {
    /// Budget for `mode`.
    pub fn for_mode(&self, mode: ProcessingMode) -> Duration {
        match mode {
            ProcessingMode::Full => self.full_pipeline,
            ProcessingMode::Preview => self.preview,
        }
    }
}

/// Settings for one `process_frame` call.
///
/// The calibration references are not serialized; they are attached from a
/// [`CalibrationSet`] snapshot with [`with_calibration`](Self::with_calibration).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Stage selection
    pub mode: ProcessingMode,
    /// Display window width in counts, strictly positive
    pub window: f32,
    /// Display window centre in counts
    pub level: f32,
    /// Run defect repair (full mode)
    pub enable_defect_correction: bool,
    /// Run scatter correction (full mode)
    pub enable_scatter_correction: bool,
    /// Run noise reduction (full mode)
    pub enable_noise_reduction: bool,
    /// Run flattening (full mode)
    pub enable_flattening: bool,
    /// Copy the raw pixels before the first stage
    pub preserve_raw: bool,
    /// Noise filter settings
    pub noise: NoiseReductionParams,
    /// Flattening settings
    pub flattening: FlatteningParams,
    /// Dark frame to subtract
    #[serde(skip)]
    pub dark_frame: Option<Arc<CalibrationDataset>>,
    /// Gain map to apply
    #[serde(skip)]
    pub gain_map: Option<Arc<CalibrationDataset>>,
    /// Defect map to repair with
    #[serde(skip)]
    pub defect_map: Option<Arc<CalibrationDataset>>,
    /// Scatter parameters
    #[serde(skip)]
    pub scatter_params: Option<Arc<CalibrationDataset>>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Full,
            window: 4000.0,
            level: 2000.0,
            enable_defect_correction: true,
            enable_scatter_correction: false,
            enable_noise_reduction: true,
            enable_flattening: false,
            preserve_raw: true,
            noise: NoiseReductionParams::default(),
            flattening: FlatteningParams::default(),
            dark_frame: None,
            gain_map: None,
            defect_map: None,
            scatter_params: None,
        }
    }
}

impl ProcessingConfig {
    /// Preview settings with the given window.
    pub fn preview(window: f32, level: f32) -> Self {
        Self {
            mode: ProcessingMode::Preview,
            window,
            level,
            ..Self::default()
        }
    }

    /// Attach the datasets of a calibration snapshot.
    pub fn with_calibration(mut self, set: &CalibrationSet) -> Self {
        self.dark_frame = set.dark_frame.clone();
        self.gain_map = set.gain_map.clone();
        self.defect_map = set.defect_map.clone();
        self.scatter_params = set.scatter_params.clone();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_filter_names_are_case_insensitive() {
        assert_eq!("Gaussian".parse::<NoiseFilter>(), Ok(NoiseFilter::Gaussian));
        assert_eq!("MEDIAN".parse::<NoiseFilter>(), Ok(NoiseFilter::Median));
        assert_eq!("bilateral".parse::<NoiseFilter>(), Ok(NoiseFilter::Bilateral));
        assert!("wavelet".parse::<NoiseFilter>().is_err());
    }

    #[test]
    fn budgets_follow_mode() {
        let budgets = ProcessingBudgets::default();
        assert_eq!(budgets.for_mode(ProcessingMode::Full), Duration::from_secs(2));
        assert_eq!(budgets.for_mode(ProcessingMode::Preview), Duration::from_millis(500));
    }

    #[test]
    fn preview_keeps_other_defaults() {
        let config = ProcessingConfig::preview(1000.0, 500.0);
        assert_eq!(config.mode, ProcessingMode::Preview);
        assert_eq!((config.window, config.level), (1000.0, 500.0));
        assert!(config.preserve_raw);
        assert!(config.dark_frame.is_none());
    }

    #[test]
    fn toml_section_deserializes_with_defaults() {
        let config: ProcessingConfig = toml::from_str(
            r#"
            mode = "preview"
            window = 1200.0
            [noise]
            filter = "median"
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, ProcessingMode::Preview);
        assert_eq!(config.noise.filter, "median");
        assert_eq!(config.level, 2000.0);
        assert_eq!(config.flattening.radius, 32);
    }
}
