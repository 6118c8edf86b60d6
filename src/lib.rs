//! # Rust X-ray Core Library
//!
//! The real-time data path of a digital X-ray console: raw detector frames are
//! captured through a vendor driver plugin, absorbed by a bounded ring buffer,
//! corrected with the active calibration set and handed downstream.
//!
//! ## Crate Structure
//!
//! - **`data`**: the frame ring buffer decoupling the capture thread from the
//!   processing consumers.
//! - **`hardware`**: the detector plugin loader (C binary contract, reference
//!   counted handles) and the capture adapter feeding the ring buffer.
//! - **`calibration`**: calibration file codec, the calibration manager with
//!   copy-on-replace snapshots, and dataset acquisition from raw frames.
//! - **`processing`**: the image processing engine and its correction stages.
//! - **`pipeline`**: the consumer worker wiring buffer, calibration and engine
//!   to a downstream sink.
//! - **`frame`**: the borrowed frame view every stage works on.
//! - **`config`**, **`logging`**, **`error`**: the ambient stack.
//!
//! ## Data flow
//!
//! ```text
//! PluginDriver / SyntheticDetector
//!        │  CaptureAdapter (producer thread)
//!        ▼
//! FrameRingBuffer ──► PipelineWorker ──► ImageProcessingEngine ──► FrameSink
//!                          ▲
//!                          └── CalibrationManager::snapshot()
//! ```

pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
pub mod frame;
pub mod hardware;
pub mod logging;
pub mod pipeline;
pub mod processing;

pub use calibration::{CalibrationManager, CalibrationSet, CalibrationType};
pub use data::{FrameRingBuffer, OverwritePolicy, RingBufferConfig};
pub use error::{AppResult, XrayError};
pub use frame::{Frame, FrameBuffer};
pub use hardware::plugin::{PluginHandle, PluginLoader};
pub use pipeline::{FrameSink, PipelineWorker};
pub use processing::{ImageProcessingEngine, ProcessingConfig, ProcessingMode};
