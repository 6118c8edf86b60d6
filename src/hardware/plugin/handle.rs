//! Owned binding of a driver module and the driver instance it created.

use super::abi::{
    c_string, AcquisitionControlFn, CreateInstanceFn, DestroyInstanceFn, GetLastErrorFn,
    GetManifestFn, PluginManifest, RawFrameInfo, ReadFrameFn, CREATE_INSTANCE_SYMBOL,
    DESTROY_INSTANCE_SYMBOL, GET_LAST_ERROR_SYMBOL, GET_MANIFEST_SYMBOL, READ_FRAME_SYMBOL,
    START_ACQUISITION_SYMBOL, STATUS_NO_FRAME, STATUS_OK, STOP_ACQUISITION_SYMBOL,
};
use super::library::ModuleLibrary;
use super::{panic_message, PluginError, PluginState};
use crate::hardware::capture::{CaptureInfo, FrameSource};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::ffi::{c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy)]
struct CaptureEntryPoints {
    start: AcquisitionControlFn,
    stop: AcquisitionControlFn,
    read_frame: ReadFrameFn,
}

#[derive(Clone, Copy)]
struct EntryPoints {
    create: CreateInstanceFn,
    destroy: DestroyInstanceFn,
    manifest: GetManifestFn,
    last_error: GetLastErrorFn,
    capture: Option<CaptureEntryPoints>,
}

impl EntryPoints {
    fn resolve(module: &dyn ModuleLibrary) -> Result<Self, PluginError> {
        let required = |name: &str| {
            module
                .symbol(name)
                .filter(|addr| !addr.is_null())
                .ok_or_else(|| PluginError::MissingSymbol {
                    symbol: name.to_string(),
                })
        };
        let optional = |name: &str| module.symbol(name).filter(|addr| !addr.is_null());

        let create = required(CREATE_INSTANCE_SYMBOL)?;
        let destroy = required(DESTROY_INSTANCE_SYMBOL)?;
        let manifest = required(GET_MANIFEST_SYMBOL)?;
        let last_error = required(GET_LAST_ERROR_SYMBOL)?;

        // SAFETY: the binary contract fixes the signature behind each symbol
        // name; the addresses were checked to be non-null above.
        unsafe {
            let capture = match (
                optional(START_ACQUISITION_SYMBOL),
                optional(STOP_ACQUISITION_SYMBOL),
                optional(READ_FRAME_SYMBOL),
            ) {
                (Some(start), Some(stop), Some(read_frame)) => Some(CaptureEntryPoints {
                    start: std::mem::transmute::<*const c_void, AcquisitionControlFn>(start),
                    stop: std::mem::transmute::<*const c_void, AcquisitionControlFn>(stop),
                    read_frame: std::mem::transmute::<*const c_void, ReadFrameFn>(read_frame),
                }),
                _ => None,
            };

            Ok(Self {
                create: std::mem::transmute::<*const c_void, CreateInstanceFn>(create),
                destroy: std::mem::transmute::<*const c_void, DestroyInstanceFn>(destroy),
                manifest: std::mem::transmute::<*const c_void, GetManifestFn>(manifest),
                last_error: std::mem::transmute::<*const c_void, GetLastErrorFn>(last_error),
                capture,
            })
        }
    }

    fn last_error(&self) -> String {
        let last_error = self.last_error;
        // SAFETY: contract signature; the returned string is copied before
        // the module is called again.
        catch_unwind(|| unsafe { c_string(last_error()) })
            .unwrap_or_else(|payload| format!("last-error call faulted: {}", panic_message(&*payload)))
    }
}

/// A module whose entry points resolved and whose manifest was read, but
/// which has no driver instance yet (state `Loaded`).
pub(crate) struct BoundModule {
    manifest: PluginManifest,
    entry: EntryPoints,
    module: Box<dyn ModuleLibrary>,
}

impl BoundModule {
    /// Resolve the required entry points and read the manifest. On failure the
    /// module is dropped, and thereby closed, before this returns.
    pub(crate) fn bind(module: Box<dyn ModuleLibrary>) -> Result<Self, PluginError> {
        let entry = EntryPoints::resolve(module.as_ref())?;

        let get_manifest = entry.manifest;
        // SAFETY: contract signature; the manifest is static for the module's lifetime.
        let manifest = catch_unwind(|| unsafe { PluginManifest::from_raw(get_manifest()) })
            .map_err(|payload| {
                PluginError::InitFailed(format!("manifest call faulted: {}", panic_message(&*payload)))
            })?
            .ok_or_else(|| PluginError::InitFailed("module returned a null manifest".into()))?;

        debug!(
            path = %module.path().display(),
            vendor = %manifest.vendor,
            plugin = %manifest.plugin_name,
            abi = %manifest.abi_version,
            state = %PluginState::Loaded,
            "Plugin module bound"
        );

        Ok(Self {
            manifest,
            entry,
            module,
        })
    }

    pub(crate) fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Create the driver instance inside a panic boundary.
    ///
    /// Any fault or a null instance is reported as `InitFailed`; the module is
    /// unloaded before this returns in that case.
    pub(crate) fn instantiate(self, id: u64, config_json: &str) -> Result<PluginHandle, PluginError> {
        let config = CString::new(config_json)
            .map_err(|_| PluginError::InitFailed("driver configuration contains a NUL byte".into()))?;

        let create = self.entry.create;
        let config_ptr = config.as_ptr();
        // SAFETY: contract signature; `config` outlives the call.
        let created = catch_unwind(AssertUnwindSafe(|| unsafe { create(config_ptr) }));

        let instance = match created {
            Ok(ptr) if !ptr.is_null() => ptr,
            Ok(_) => {
                let reason = self.entry.last_error();
                warn!(
                    plugin = %self.manifest.plugin_name,
                    state = %PluginState::Error,
                    %reason,
                    "Driver instance creation returned null"
                );
                return Err(PluginError::InitFailed(if reason.is_empty() {
                    "create-instance returned null".into()
                } else {
                    reason
                }));
            }
            Err(payload) => {
                let reason = panic_message(&*payload);
                error!(
                    plugin = %self.manifest.plugin_name,
                    state = %PluginState::Error,
                    %reason,
                    "Driver instance creation faulted"
                );
                return Err(PluginError::InitFailed(format!("create-instance faulted: {reason}")));
            }
        };

        info!(
            plugin = %self.manifest.plugin_name,
            vendor = %self.manifest.vendor,
            version = %self.manifest.version,
            state = %PluginState::Initialized,
            "Driver instance created"
        );

        Ok(PluginHandle {
            inner: Arc::new(PluginInstance {
                id,
                path: self.module.path().to_path_buf(),
                manifest: self.manifest,
                state: Mutex::new(PluginState::Initialized),
                instance,
                entry: self.entry,
                call_lock: Mutex::new(()),
                module: self.module,
            }),
        })
    }
}

pub(crate) struct PluginInstance {
    id: u64,
    path: PathBuf,
    manifest: PluginManifest,
    state: Mutex<PluginState>,
    instance: *mut c_void,
    entry: EntryPoints,
    /// Serializes calls into the module; its last-error string is only valid
    /// until the next call.
    call_lock: Mutex<()>,
    module: Box<dyn ModuleLibrary>,
}

// SAFETY: the instance pointer is only passed to the module's own functions,
// and every call goes through `call_lock`.
unsafe impl Send for PluginInstance {}
unsafe impl Sync for PluginInstance {}

impl Drop for PluginInstance {
    fn drop(&mut self) {
        {
            let _call = self.call_lock.lock();
            let destroy = self.entry.destroy;
            let instance = self.instance;
            // SAFETY: `instance` came from this module's create-instance and is
            // destroyed exactly once, here.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| unsafe { destroy(instance) })) {
                error!(
                    plugin = %self.manifest.plugin_name,
                    reason = %panic_message(&*payload),
                    "Driver destroy-instance faulted"
                );
            }
        }
        *self.state.lock() = PluginState::Unloaded;
        info!(
            plugin = %self.manifest.plugin_name,
            path = %self.module.path().display(),
            state = %PluginState::Unloaded,
            "Driver instance destroyed, unloading module"
        );
        // `module` is dropped after this body returns.
    }
}

/// Reference-counted handle to a loaded driver.
///
/// Clones share one driver instance. The instance is destroyed, and the
/// module unloaded, when the last clone is dropped, regardless of whether the
/// loader still lists the plugin.
#[derive(Clone)]
pub struct PluginHandle {
    inner: Arc<PluginInstance>,
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("id", &self.inner.id)
            .field("manifest", &self.inner.manifest)
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl PluginHandle {
    /// Loader-assigned id, unique per load.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Manifest copied at load time.
    pub fn manifest(&self) -> &PluginManifest {
        &self.inner.manifest
    }

    /// Module path.
    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PluginState {
        *self.inner.state.lock()
    }

    /// Whether the module exports the capture entry points.
    pub fn supports_capture(&self) -> bool {
        self.inner.entry.capture.is_some()
    }

    /// Whether two handles share the same driver instance.
    pub fn ptr_eq(&self, other: &PluginHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live clones of this handle, including the loader's own.
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// The module's most recent error message.
    pub fn last_driver_error(&self) -> String {
        let _call = self.inner.call_lock.lock();
        self.inner.entry.last_error()
    }

    /// Capture interface, if the module exports one.
    pub fn driver(&self) -> Option<PluginDriver> {
        self.supports_capture().then(|| PluginDriver {
            handle: self.clone(),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<PluginInstance> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_instance(inner: Arc<PluginInstance>) -> Self {
        Self { inner }
    }

    /// Run `f` against the instance under the call lock and panic boundary.
    fn call<R>(&self, operation: &str, f: impl FnOnce(*mut c_void) -> R) -> Result<R, PluginError> {
        let state = self.state();
        if state != PluginState::Initialized {
            return Err(PluginError::Driver(format!(
                "{operation}: plugin '{}' is {state}, reload required",
                self.inner.manifest.plugin_name
            )));
        }
        let _call = self.inner.call_lock.lock();
        let instance = self.inner.instance;
        catch_unwind(AssertUnwindSafe(|| f(instance))).map_err(|payload| {
            *self.inner.state.lock() = PluginState::Error;
            let reason = panic_message(&*payload);
            error!(
                plugin = %self.inner.manifest.plugin_name,
                operation,
                %reason,
                state = %PluginState::Error,
                "Driver call faulted"
            );
            PluginError::Driver(format!("{operation} faulted: {reason}"))
        })
    }

    fn check_status(&self, operation: &str, status: i32) -> Result<(), PluginError> {
        if status < 0 {
            let reason = self.last_driver_error();
            return Err(PluginError::Driver(format!(
                "{operation} returned {status}: {reason}"
            )));
        }
        Ok(())
    }
}

/// Capture interface of a plugin driver instance.
#[derive(Debug, Clone)]
pub struct PluginDriver {
    handle: PluginHandle,
}

impl PluginDriver {
    /// The underlying handle.
    pub fn handle(&self) -> &PluginHandle {
        &self.handle
    }

    fn capture(&self) -> Result<CaptureEntryPoints, PluginError> {
        self.handle
            .inner
            .entry
            .capture
            .ok_or_else(|| PluginError::Driver("module does not export capture entry points".into()))
    }
}

impl FrameSource for PluginDriver {
    fn describe(&self) -> String {
        let manifest = self.handle.manifest();
        format!("{} {} {}", manifest.vendor, manifest.plugin_name, manifest.version)
    }

    fn start(&mut self) -> anyhow::Result<()> {
        let start = self.capture()?.start;
        // SAFETY: contract signature, instance owned by this module.
        let status = self.handle.call("start", |instance| unsafe { start(instance) })?;
        self.handle.check_status("start", status)?;
        Ok(())
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        let stop = self.capture()?.stop;
        // SAFETY: contract signature, instance owned by this module.
        let status = self.handle.call("stop", |instance| unsafe { stop(instance) })?;
        self.handle.check_status("stop", status)?;
        Ok(())
    }

    fn read_frame(&mut self, buffer: &mut [u8]) -> anyhow::Result<Option<CaptureInfo>> {
        let read_frame = self.capture()?.read_frame;
        let mut info = RawFrameInfo::default();
        let (ptr, len) = (buffer.as_mut_ptr(), buffer.len());
        // SAFETY: contract signature; `buffer` and `info` outlive the call and
        // the module writes at most `len` bytes.
        let status = self.handle.call("read_frame", |instance| unsafe {
            read_frame(instance, ptr, len, &mut info)
        })?;
        self.handle.check_status("read_frame", status)?;
        match status {
            STATUS_OK => Ok(Some(CaptureInfo {
                frame_id: info.frame_id,
                timestamp: DateTime::<Utc>::from_timestamp_micros(info.timestamp_us as i64)
                    .unwrap_or_else(Utc::now),
            })),
            STATUS_NO_FRAME => Ok(None),
            other => Err(PluginError::Driver(format!("read_frame returned unknown status {other}")).into()),
        }
    }
}
