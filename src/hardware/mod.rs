//! Detector hardware access.
//!
//! - [`plugin`]: loading vendor driver modules through the C binary contract
//! - [`capture`]: frame sources and the producer thread feeding the ring buffer

pub mod capture;
pub mod plugin;

pub use capture::{
    CaptureAdapter, CaptureInfo, CaptureStats, FrameSource, SyntheticDetector,
    SyntheticDetectorConfig,
};
pub use plugin::{PluginDriver, PluginError, PluginHandle, PluginLoader, PluginState};
