//! Detector plugin loading.
//!
//! Vendor drivers are shared libraries implementing the binary contract in
//! [`abi`]. The [`PluginLoader`] opens a module, resolves its entry points,
//! gates it on the ABI version and creates one driver instance inside a panic
//! boundary. The result is a reference-counted [`PluginHandle`]; when the last
//! clone is dropped the instance is destroyed through the module's own
//! destructor and only then is the module unloaded.
//!
//! # Architecture
//!
//! ```text
//! PluginLoader (registry + last error, admin lock)
//! ├── ModuleOpener ── NativeModuleOpener (libloading)
//! │                └─ StaticModuleOpener (in-process symbol tables)
//! └── PluginHandle ── Arc<PluginInstance>
//!                      ├── driver instance  (destroyed first)
//!                      └── Box<dyn ModuleLibrary> (unloaded last)
//! ```

#![allow(unsafe_code)] // Plugin loading crosses a C ABI

pub mod abi;
pub mod handle;
pub mod library;
pub mod loader;

pub use abi::{AbiVersion, PluginManifest, RawFrameInfo, RawPluginManifest};
pub use handle::{PluginDriver, PluginHandle};
pub use library::{
    is_plugin_library, ModuleLibrary, ModuleOpener, NativeModuleOpener, StaticModule,
    StaticModuleOpener,
};
pub use loader::PluginLoader;

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Lifecycle of a plugin handle.
///
/// `Loaded → Initialized` on successful instance creation, `Loaded → Error`
/// when creation fails, `Initialized → Error` when a driver call faults.
/// `Unloaded` is terminal and reached when the handle is destroyed. There is
/// no way back from `Error` except loading the module again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginState {
    /// Module opened and entry points resolved
    Loaded,
    /// Driver instance created
    Initialized,
    /// Instance creation or a driver call failed
    Error,
    /// Instance destroyed and module unloaded
    Unloaded,
}

impl std::fmt::Display for PluginState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PluginState::Loaded => "loaded",
            PluginState::Initialized => "initialized",
            PluginState::Error => "error",
            PluginState::Unloaded => "unloaded",
        };
        write!(f, "{label}")
    }
}

/// Plugin loading and driver call failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// The module file could not be opened.
    #[error("failed to load plugin {path}: {reason}")]
    LoadFailed {
        /// Module path
        path: PathBuf,
        /// Loader message
        reason: String,
    },
    /// A required entry point is not exported.
    #[error("plugin is missing required symbol '{symbol}'")]
    MissingSymbol {
        /// Name of the first unresolved symbol
        symbol: String,
    },
    /// The module was built against an incompatible contract.
    #[error("plugin ABI version {plugin} is incompatible with host version {host}")]
    VersionMismatch {
        /// Version declared in the manifest
        plugin: AbiVersion,
        /// Version implemented by the host
        host: AbiVersion,
    },
    /// Creating the driver instance failed or faulted.
    #[error("plugin initialization failed: {0}")]
    InitFailed(String),
    /// No registry entry under that name.
    #[error("plugin not found: {0}")]
    NotFound(String),
    /// A capture call into the driver failed.
    #[error("driver call failed: {0}")]
    Driver(String),
}

impl PluginError {
    /// Short code naming the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            PluginError::LoadFailed { .. } => "load-failed",
            PluginError::MissingSymbol { .. } => "missing-symbol",
            PluginError::VersionMismatch { .. } => "version-mismatch",
            PluginError::InitFailed(_) => "init-failed",
            PluginError::NotFound(_) => "not-found",
            PluginError::Driver(_) => "driver",
        }
    }
}

/// Best-effort message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown fault".to_string()
    }
}
