//! Mock flat panel driver.
//!
//! Implements the host's plugin contract on top of the library's synthetic
//! detector so the full load → capture → unload path can be exercised without
//! vendor hardware. Configuration arrives as JSON:
//!
//! ```json
//! { "width": 512, "height": 512, "frame_interval_ms": 33, "seed": 7 }
//! ```
//!
//! Setting `"fail_init": true` makes instance creation fail with a message
//! retrievable through `xray_plugin_last_error`.

use rust_xray::hardware::plugin::abi::{
    AbiVersion, RawFrameInfo, RawPluginManifest, STATUS_NO_FRAME, STATUS_OK,
};
use rust_xray::hardware::{FrameSource, SyntheticDetector, SyntheticDetectorConfig};
use serde::Deserialize;
use std::cell::RefCell;
use std::ffi::{c_char, c_void, CStr, CString};
use std::time::Duration;

static MANIFEST: RawPluginManifest = RawPluginManifest {
    vendor: c"Rust X-ray".as_ptr(),
    plugin_name: c"mock-detector".as_ptr(),
    version: c"0.1.0".as_ptr(),
    abi_version: AbiVersion::CURRENT,
};

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn set_last_error(message: impl Into<String>) {
    let message = CString::new(message.into().replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = message);
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct MockConfig {
    width: u32,
    height: u32,
    frame_interval_ms: u64,
    seed: u64,
    fail_init: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            frame_interval_ms: 0,
            seed: 0x5EED,
            fail_init: false,
        }
    }
}

struct MockDetector {
    width: u32,
    height: u32,
    detector: SyntheticDetector,
}

impl MockDetector {
    fn from_json(json: &str) -> Result<Self, String> {
        let config: MockConfig = if json.trim().is_empty() {
            MockConfig::default()
        } else {
            serde_json::from_str(json).map_err(|e| format!("invalid configuration: {e}"))?
        };
        if config.fail_init {
            return Err("initialization refused by configuration".into());
        }
        if config.width == 0 || config.height == 0 {
            return Err(format!("invalid geometry {}x{}", config.width, config.height));
        }
        Ok(Self {
            width: config.width,
            height: config.height,
            detector: SyntheticDetector::new(SyntheticDetectorConfig {
                width: config.width,
                height: config.height,
                frame_interval: Duration::from_millis(config.frame_interval_ms),
                seed: config.seed,
                ..Default::default()
            }),
        })
    }
}

/// Create a driver instance.
///
/// # Safety
/// `config_json` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C-unwind" fn xray_plugin_create(config_json: *const c_char) -> *mut c_void {
    let json = if config_json.is_null() {
        String::new()
    } else {
        CStr::from_ptr(config_json).to_string_lossy().into_owned()
    };
    match MockDetector::from_json(&json) {
        Ok(instance) => Box::into_raw(Box::new(instance)).cast(),
        Err(message) => {
            set_last_error(message);
            std::ptr::null_mut()
        }
    }
}

/// Destroy a driver instance.
///
/// # Safety
/// `instance` must come from [`xray_plugin_create`] and not be used again.
#[no_mangle]
pub unsafe extern "C-unwind" fn xray_plugin_destroy(instance: *mut c_void) {
    if !instance.is_null() {
        drop(Box::from_raw(instance.cast::<MockDetector>()));
    }
}

/// The static manifest.
#[no_mangle]
pub extern "C-unwind" fn xray_plugin_manifest() -> *const RawPluginManifest {
    &MANIFEST
}

/// The calling thread's most recent error message.
#[no_mangle]
pub extern "C-unwind" fn xray_plugin_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

unsafe fn instance<'a>(ptr: *mut c_void) -> Option<&'a mut MockDetector> {
    ptr.cast::<MockDetector>().as_mut()
}

/// Begin acquisition.
///
/// # Safety
/// `instance_ptr` must come from [`xray_plugin_create`].
#[no_mangle]
pub unsafe extern "C-unwind" fn xray_plugin_start(instance_ptr: *mut c_void) -> i32 {
    let Some(mock) = instance(instance_ptr) else {
        set_last_error("null instance");
        return -1;
    };
    match mock.detector.start() {
        Ok(()) => STATUS_OK,
        Err(e) => {
            set_last_error(e.to_string());
            -1
        }
    }
}

/// End acquisition.
///
/// # Safety
/// `instance_ptr` must come from [`xray_plugin_create`].
#[no_mangle]
pub unsafe extern "C-unwind" fn xray_plugin_stop(instance_ptr: *mut c_void) -> i32 {
    let Some(mock) = instance(instance_ptr) else {
        set_last_error("null instance");
        return -1;
    };
    match mock.detector.stop() {
        Ok(()) => STATUS_OK,
        Err(e) => {
            set_last_error(e.to_string());
            -1
        }
    }
}

/// Copy the next frame into `buffer`.
///
/// # Safety
/// `instance_ptr` must come from [`xray_plugin_create`]; `buffer` must be valid
/// for `len` bytes and `info` for one write.
#[no_mangle]
pub unsafe extern "C-unwind" fn xray_plugin_read_frame(
    instance_ptr: *mut c_void,
    buffer: *mut u8,
    len: usize,
    info: *mut RawFrameInfo,
) -> i32 {
    let Some(mock) = instance(instance_ptr) else {
        set_last_error("null instance");
        return -1;
    };
    if buffer.is_null() || info.is_null() {
        set_last_error("null output buffer");
        return -2;
    }
    let out = std::slice::from_raw_parts_mut(buffer, len);
    match mock.detector.read_frame(out) {
        Ok(Some(capture)) => {
            *info = RawFrameInfo {
                width: mock.width,
                height: mock.height,
                frame_id: capture.frame_id,
                timestamp_us: u64::try_from(capture.timestamp.timestamp_micros()).unwrap_or(0),
            };
            STATUS_OK
        }
        Ok(None) => STATUS_NO_FRAME,
        Err(e) => {
            set_last_error(e.to_string());
            -3
        }
    }
}
