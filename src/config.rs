//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/default.toml` by default)
//! 2. environment variables prefixed with `RUST_XRAY_`, nested keys separated
//!    by a double underscore
//!
//! Every section has defaults, so an empty file is a valid configuration.
//!
//! # Example
//! ```no_run
//! use rust_xray::config::XrayConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // RUST_XRAY_BUFFER__DEPTH=16 overrides [buffer] depth
//! let config = XrayConfig::load_from("config/default.toml")?;
//! config.validate()?;
//! println!("Detector: {}x{}", config.detector.width, config.detector.height);
//! # Ok(())
//! # }
//! ```

use crate::data::ring_buffer::{OverwritePolicy, RingBufferConfig};
use crate::error::{AppResult, XrayError};
use crate::frame::BYTES_PER_PIXEL;
use crate::processing::stages::noise;
use crate::processing::{EngineConfig, ProcessingBudgets, ProcessingConfig};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "RUST_XRAY_";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XrayConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Detector geometry and driver
    pub detector: DetectorConfig,
    /// Frame ring buffer
    pub buffer: BufferConfig,
    /// Calibration store
    pub calibration: CalibrationConfig,
    /// Default per-frame processing
    pub processing: ProcessingConfig,
    /// Latency budgets
    pub budgets: ProcessingBudgets,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "rust_xray".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Detector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Driver module to load; the synthetic detector is used when unset
    pub plugin: Option<PathBuf>,
    /// Vendor settings handed to the driver as JSON
    pub vendor_config: serde_json::Value,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            plugin: None,
            vendor_config: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}

impl DetectorConfig {
    /// Bytes per frame at the configured geometry.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// Ring buffer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Number of frame slots
    pub depth: usize,
    /// Full-buffer behaviour
    pub policy: OverwritePolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            depth: 8,
            policy: OverwritePolicy::DropOldest,
        }
    }
}

/// Calibration store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Directory holding dark.xcal, gain.xcal, defect.xcal, scatter.xcal
    pub directory: PathBuf,
    /// Datasets older than this are reported stale
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("calibration"),
            max_age: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl XrayConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(XrayError::from)
    }

    /// The provider stack: defaults, then the file, then the environment.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(XrayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(XrayError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.detector.width == 0 || self.detector.height == 0 {
            return invalid(format!(
                "Invalid detector dimensions {}x{}",
                self.detector.width, self.detector.height
            ));
        }

        if self.buffer.depth == 0 {
            return invalid("Buffer depth must be at least 1".to_string());
        }

        if !(self.processing.window.is_finite() && self.processing.window > 0.0) {
            return invalid(format!(
                "Processing window must be strictly positive, got {}",
                self.processing.window
            ));
        }

        if let Err(e) = noise::check(&self.processing.noise) {
            return invalid(e.message);
        }

        if !self.processing.preserve_raw {
            tracing::warn!("Raw frame preservation is disabled in configuration");
        }

        Ok(())
    }

    /// Ring buffer settings for the configured detector.
    pub fn ring_buffer_config(&self) -> RingBufferConfig {
        RingBufferConfig {
            depth: self.buffer.depth,
            frame_size: self.detector.frame_size(),
            policy: self.buffer.policy,
        }
    }

    /// Engine settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            budgets: self.budgets,
        }
    }
}
