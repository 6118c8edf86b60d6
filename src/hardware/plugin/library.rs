//! Opening driver modules and resolving their exported symbols.
//!
//! The loader talks to modules through [`ModuleLibrary`] so the symbol
//! resolution, version gate and teardown ordering can be exercised against
//! in-process symbol tables as well as real shared libraries.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};

/// An opened module. Dropping it unloads the module.
pub trait ModuleLibrary: Send + Sync {
    /// Resolve an exported symbol to its address.
    fn symbol(&self, name: &str) -> Option<*const c_void>;

    /// Where the module was opened from.
    fn path(&self) -> &Path;
}

/// Opens modules by path.
pub trait ModuleOpener: Send + Sync {
    /// Open the module at `path`.
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleLibrary>, String>;
}

/// Opens platform shared libraries (`.so`, `.dylib`, `.dll`) with `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeModuleOpener;

impl ModuleOpener for NativeModuleOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleLibrary>, String> {
        // SAFETY: loading a library runs its initializers. Driver modules are
        // installed by the site administrator, the same trust level as the
        // host binary itself.
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|e| format!("failed to open {}: {e}", path.display()))?;
        Ok(Box::new(NativeModule {
            library,
            path: path.to_path_buf(),
        }))
    }
}

struct NativeModule {
    library: libloading::Library,
    path: PathBuf,
}

impl ModuleLibrary for NativeModule {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        // SAFETY: the symbol is only read as an address here; callers cast it
        // to the signature documented in the binary contract.
        unsafe {
            self.library
                .get::<*const c_void>(name.as_bytes())
                .ok()
                .map(|symbol| *symbol)
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether `path` looks like a shared library for this platform.
pub fn is_plugin_library(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }

    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    #[cfg(target_os = "macos")]
    {
        extension == "dylib"
    }
    #[cfg(target_os = "linux")]
    {
        extension == "so"
    }
    #[cfg(target_os = "windows")]
    {
        extension == "dll"
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        false
    }
}

/// A module assembled from function addresses in the current process.
///
/// Used to exercise the loader against drivers that are statically linked
/// into the host (simulators, tests).
pub struct StaticModule {
    path: PathBuf,
    symbols: HashMap<String, usize>,
    on_unload: Option<Box<dyn Fn() + Send + Sync>>,
}

impl StaticModule {
    /// Create an empty symbol table reported as opened from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            symbols: HashMap::new(),
            on_unload: None,
        }
    }

    /// Export `address` under `name`.
    pub fn with_symbol(mut self, name: &str, address: *const c_void) -> Self {
        self.symbols.insert(name.to_string(), address as usize);
        self
    }

    /// Run `hook` when the module is unloaded.
    pub fn on_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_unload = Some(Box::new(hook));
        self
    }
}

impl ModuleLibrary for StaticModule {
    fn symbol(&self, name: &str) -> Option<*const c_void> {
        self.symbols.get(name).map(|&addr| addr as *const c_void)
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StaticModule {
    fn drop(&mut self) {
        if let Some(hook) = &self.on_unload {
            hook();
        }
    }
}

type ModuleFactory = Box<dyn Fn() -> StaticModule + Send + Sync>;

/// A [`ModuleOpener`] serving [`StaticModule`]s registered by path.
#[derive(Default)]
pub struct StaticModuleOpener {
    modules: HashMap<PathBuf, ModuleFactory>,
}

impl StaticModuleOpener {
    /// Create an opener with no modules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve the module built by `factory` when `path` is opened.
    pub fn register<F>(mut self, path: impl Into<PathBuf>, factory: F) -> Self
    where
        F: Fn() -> StaticModule + Send + Sync + 'static,
    {
        self.modules.insert(path.into(), Box::new(factory));
        self
    }
}

impl ModuleOpener for StaticModuleOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ModuleLibrary>, String> {
        self.modules
            .get(path)
            .map(|factory| Box::new(factory()) as Box<dyn ModuleLibrary>)
            .ok_or_else(|| format!("no module registered at {}", path.display()))
    }
}
