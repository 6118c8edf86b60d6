//! Binary contract between the host and detector driver modules.
//!
//! Every driver module exports four required C symbols:
//!
//! | symbol | signature |
//! |--------|-----------|
//! | `xray_plugin_create` | `fn(config_json: *const c_char) -> *mut c_void` |
//! | `xray_plugin_destroy` | `fn(instance: *mut c_void)` |
//! | `xray_plugin_manifest` | `fn() -> *const RawPluginManifest` |
//! | `xray_plugin_last_error` | `fn() -> *const c_char` |
//!
//! `xray_plugin_destroy` only ever receives a pointer previously returned by
//! `xray_plugin_create` of the same module. The manifest is static and lives
//! as long as the module; the last-error string is valid until the module's
//! next call.
//!
//! Capture-capable modules additionally export `xray_plugin_start`,
//! `xray_plugin_stop` and `xray_plugin_read_frame`. These are optional; a
//! module without them can still be loaded and inspected.

use serde::Serialize;
use std::ffi::{c_char, c_void, CStr};

/// Required: create a driver instance from a JSON configuration string.
pub const CREATE_INSTANCE_SYMBOL: &str = "xray_plugin_create";
/// Required: destroy a driver instance.
pub const DESTROY_INSTANCE_SYMBOL: &str = "xray_plugin_destroy";
/// Required: return the static manifest.
pub const GET_MANIFEST_SYMBOL: &str = "xray_plugin_manifest";
/// Required: return the last error message.
pub const GET_LAST_ERROR_SYMBOL: &str = "xray_plugin_last_error";

/// The four symbols every module must export, in resolution order.
pub const REQUIRED_SYMBOLS: [&str; 4] = [
    CREATE_INSTANCE_SYMBOL,
    DESTROY_INSTANCE_SYMBOL,
    GET_MANIFEST_SYMBOL,
    GET_LAST_ERROR_SYMBOL,
];

/// Optional: start acquisition on an instance.
pub const START_ACQUISITION_SYMBOL: &str = "xray_plugin_start";
/// Optional: stop acquisition on an instance.
pub const STOP_ACQUISITION_SYMBOL: &str = "xray_plugin_stop";
/// Optional: copy the next captured frame into a host buffer.
pub const READ_FRAME_SYMBOL: &str = "xray_plugin_read_frame";

/// Capture call succeeded.
pub const STATUS_OK: i32 = 0;
/// `read_frame` found no new frame; try again later.
pub const STATUS_NO_FRAME: i32 = 1;

/// Signature of `xray_plugin_create`.
pub type CreateInstanceFn = unsafe extern "C-unwind" fn(config_json: *const c_char) -> *mut c_void;
/// Signature of `xray_plugin_destroy`.
pub type DestroyInstanceFn = unsafe extern "C-unwind" fn(instance: *mut c_void);
/// Signature of `xray_plugin_manifest`.
pub type GetManifestFn = unsafe extern "C-unwind" fn() -> *const RawPluginManifest;
/// Signature of `xray_plugin_last_error`.
pub type GetLastErrorFn = unsafe extern "C-unwind" fn() -> *const c_char;
/// Signature of `xray_plugin_start` and `xray_plugin_stop`.
pub type AcquisitionControlFn = unsafe extern "C-unwind" fn(instance: *mut c_void) -> i32;
/// Signature of `xray_plugin_read_frame`.
///
/// Returns [`STATUS_OK`] with `info` filled in, [`STATUS_NO_FRAME`], or a
/// negative error code (details via `xray_plugin_last_error`).
pub type ReadFrameFn = unsafe extern "C-unwind" fn(
    instance: *mut c_void,
    buffer: *mut u8,
    len: usize,
    info: *mut RawFrameInfo,
) -> i32;

/// Version of the binary contract.
///
/// A module is loadable when its major version equals the host's and its minor
/// version is not newer than the host's.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AbiVersion {
    /// Incompatible contract revisions
    pub major: u16,
    /// Backwards compatible additions
    pub minor: u16,
}

impl AbiVersion {
    /// The contract revision implemented by this host.
    pub const CURRENT: AbiVersion = AbiVersion { major: 1, minor: 0 };

    /// Create a version.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether a module built against `self` can be driven by `host`.
    pub fn is_compatible_with(&self, host: &AbiVersion) -> bool {
        self.major == host.major && self.minor <= host.minor
    }
}

impl std::fmt::Display for AbiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Manifest layout returned by `xray_plugin_manifest`.
#[repr(C)]
#[derive(Debug)]
pub struct RawPluginManifest {
    /// NUL-terminated vendor name
    pub vendor: *const c_char,
    /// NUL-terminated plugin name
    pub plugin_name: *const c_char,
    /// NUL-terminated semantic version of the plugin
    pub version: *const c_char,
    /// Contract revision the module was built against
    pub abi_version: AbiVersion,
}

// SAFETY: the manifest only points at immutable static strings.
unsafe impl Sync for RawPluginManifest {}

/// Frame metadata filled in by `xray_plugin_read_frame`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawFrameInfo {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Driver frame counter
    pub frame_id: u64,
    /// Capture time, microseconds since the Unix epoch
    pub timestamp_us: u64,
}

/// Owned copy of a module manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginManifest {
    /// Detector vendor
    pub vendor: String,
    /// Plugin name, unique within the loader registry
    pub plugin_name: String,
    /// Plugin semantic version
    pub version: String,
    /// Contract revision
    pub abi_version: AbiVersion,
}

impl PluginManifest {
    /// Copy a raw manifest into owned strings.
    ///
    /// # Safety
    /// `raw` must be null or point at a valid [`RawPluginManifest`] whose
    /// string fields are null or NUL-terminated.
    pub unsafe fn from_raw(raw: *const RawPluginManifest) -> Option<Self> {
        let raw = raw.as_ref()?;
        Some(Self {
            vendor: c_string(raw.vendor),
            plugin_name: c_string(raw.plugin_name),
            version: c_string(raw.version),
            abi_version: raw.abi_version,
        })
    }
}

/// Copy a NUL-terminated string, treating null as empty.
///
/// # Safety
/// `ptr` must be null or point at a NUL-terminated string.
pub unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_compatibility() {
        let host = AbiVersion::new(1, 2);
        assert!(AbiVersion::new(1, 0).is_compatible_with(&host));
        assert!(AbiVersion::new(1, 2).is_compatible_with(&host));
        assert!(!AbiVersion::new(1, 3).is_compatible_with(&host));
        assert!(!AbiVersion::new(2, 0).is_compatible_with(&host));
        assert!(!AbiVersion::new(0, 9).is_compatible_with(&host));
    }

    #[test]
    fn manifest_from_raw() {
        let raw = RawPluginManifest {
            vendor: c"Acme Imaging".as_ptr(),
            plugin_name: c"acme-flatpanel".as_ptr(),
            version: std::ptr::null(),
            abi_version: AbiVersion::CURRENT,
        };
        let manifest = unsafe { PluginManifest::from_raw(&raw) }.unwrap();
        assert_eq!(manifest.vendor, "Acme Imaging");
        assert_eq!(manifest.plugin_name, "acme-flatpanel");
        assert_eq!(manifest.version, "");
        assert!(unsafe { PluginManifest::from_raw(std::ptr::null()) }.is_none());
    }
}
