//! Plugin registry and load/unload/reload operations.

use super::abi::{AbiVersion, PluginManifest};
use super::handle::{BoundModule, PluginHandle, PluginInstance};
use super::library::{is_plugin_library, ModuleOpener, NativeModuleOpener};
use super::{PluginError, PluginState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use tracing::{info, warn};

#[derive(Default)]
struct Registry {
    /// Loader-owned handles by plugin name
    entries: HashMap<String, PluginHandle>,
    /// Every instance ever created, held weakly
    live: Vec<Weak<PluginInstance>>,
}

impl Registry {
    fn live_handles(&mut self) -> Vec<PluginHandle> {
        self.live.retain(|weak| weak.strong_count() > 0);
        self.live
            .iter()
            .filter_map(Weak::upgrade)
            .map(PluginHandle::from_instance)
            .collect()
    }
}

/// Loads detector driver modules and keeps a registry of them by plugin name.
///
/// Load, unload and reload run under the registry lock; discovery calls
/// (`find_plugin`, `loaded_plugins`) wait for an in-progress load but never
/// touch the frame path.
///
/// # Example
///
/// ```rust,ignore
/// let loader = PluginLoader::new();
/// let handle = loader.load_plugin("/opt/xray/drivers/libacme_flatpanel.so")?;
/// println!("{} by {}", handle.manifest().plugin_name, handle.manifest().vendor);
/// ```
pub struct PluginLoader {
    opener: Box<dyn ModuleOpener>,
    host_abi: AbiVersion,
    driver_config: String,
    registry: Mutex<Registry>,
    last_error: Mutex<Option<PluginError>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("host_abi", &self.host_abi)
            .field("plugins", &self.registry.lock().entries.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginLoader {
    /// Create a loader for platform shared libraries.
    pub fn new() -> Self {
        Self::with_opener(Box::new(NativeModuleOpener))
    }

    /// Create a loader using a custom module opener.
    pub fn with_opener(opener: Box<dyn ModuleOpener>) -> Self {
        Self {
            opener,
            host_abi: AbiVersion::CURRENT,
            driver_config: "{}".to_string(),
            registry: Mutex::new(Registry::default()),
            last_error: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Override the contract version the host implements.
    pub fn with_host_abi(mut self, version: AbiVersion) -> Self {
        self.host_abi = version;
        self
    }

    /// Configuration passed to every driver's create-instance, as JSON.
    pub fn with_driver_config(mut self, config: &serde_json::Value) -> Self {
        self.driver_config = config.to_string();
        self
    }

    /// Contract version the host implements.
    pub fn host_abi(&self) -> AbiVersion {
        self.host_abi
    }

    /// Open the module at `path`, verify it and create its driver instance.
    ///
    /// Loading a path that is already registered returns the existing handle
    /// while it is `Initialized`. A registered handle in any other state is
    /// evicted and the module is loaded afresh. No registry entry is created
    /// unless every step succeeds.
    pub fn load_plugin<P: AsRef<Path>>(&self, path: P) -> Result<PluginHandle, PluginError> {
        let path = path.as_ref();
        let mut registry = self.registry.lock();

        if let Some(existing) = registry.entries.values().find(|h| h.path() == path) {
            let state = existing.state();
            let name = existing.manifest().plugin_name.clone();
            if state == PluginState::Initialized {
                info!(path = %path.display(), plugin = %name, "Plugin already loaded");
                return Ok(existing.clone());
            }
            warn!(path = %path.display(), plugin = %name, %state, "Evicting faulted plugin before reload");
            registry.entries.remove(&name);
        }

        let result = self.load_unlocked(path);
        match result {
            Ok(handle) => {
                let name = handle.manifest().plugin_name.clone();
                registry.live.push(handle.downgrade());
                if let Some(previous) = registry.entries.insert(name.clone(), handle.clone()) {
                    warn!(
                        plugin = %name,
                        previous = %previous.path().display(),
                        "Replaced registry entry; previous instance lives until its handles are released"
                    );
                }
                Ok(handle)
            }
            Err(err) => {
                warn!(path = %path.display(), code = err.code(), error = %err, "Plugin load failed");
                *self.last_error.lock() = Some(err.clone());
                Err(err)
            }
        }
    }

    fn load_unlocked(&self, path: &Path) -> Result<PluginHandle, PluginError> {
        let module = self.opener.open(path).map_err(|reason| PluginError::LoadFailed {
            path: path.to_path_buf(),
            reason,
        })?;

        let bound = BoundModule::bind(module)?;

        let plugin_abi = bound.manifest().abi_version;
        if !plugin_abi.is_compatible_with(&self.host_abi) {
            return Err(PluginError::VersionMismatch {
                plugin: plugin_abi,
                host: self.host_abi,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = bound.instantiate(id, &self.driver_config)?;
        info!(
            id,
            path = %path.display(),
            plugin = %handle.manifest().plugin_name,
            "Loaded plugin"
        );
        Ok(handle)
    }

    /// Remove the loader's registry entry for `plugin_name`.
    ///
    /// The driver instance stays alive until every outstanding handle is
    /// dropped.
    pub fn unload_plugin(&self, plugin_name: &str) -> Result<(), PluginError> {
        let removed = self.registry.lock().entries.remove(plugin_name);
        match removed {
            Some(handle) => {
                info!(
                    plugin = plugin_name,
                    outstanding = handle.reference_count() - 1,
                    "Unloaded plugin from registry"
                );
                Ok(())
            }
            None => {
                let err = PluginError::NotFound(plugin_name.to_string());
                *self.last_error.lock() = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Unload `plugin_name` and load it again from the same path.
    ///
    /// Driver state is not preserved: the new handle has a fresh instance.
    pub fn reload_plugin(&self, plugin_name: &str) -> Result<PluginHandle, PluginError> {
        let path = {
            let registry = self.registry.lock();
            registry.entries.get(plugin_name).map(|h| h.path().to_path_buf())
        };
        let Some(path) = path else {
            let err = PluginError::NotFound(plugin_name.to_string());
            *self.last_error.lock() = Some(err.clone());
            return Err(err);
        };
        self.unload_plugin(plugin_name)?;
        self.load_plugin(path)
    }

    /// First live driver instance from `vendor`, including instances already
    /// removed from the registry but still held elsewhere.
    pub fn find_plugin(&self, vendor: &str) -> Option<PluginHandle> {
        self.registry
            .lock()
            .live_handles()
            .into_iter()
            .find(|h| h.manifest().vendor == vendor)
    }

    /// Registry handle for `plugin_name`.
    pub fn get_plugin(&self, plugin_name: &str) -> Option<PluginHandle> {
        self.registry.lock().entries.get(plugin_name).cloned()
    }

    /// Manifests of all registered plugins, sorted by name.
    pub fn loaded_plugins(&self) -> Vec<PluginManifest> {
        let mut manifests: Vec<_> = self
            .registry
            .lock()
            .entries
            .values()
            .map(|h| h.manifest().clone())
            .collect();
        manifests.sort_by(|a, b| a.plugin_name.cmp(&b.plugin_name));
        manifests
    }

    /// Number of driver instances still alive, registered or not.
    pub fn live_instance_count(&self) -> usize {
        self.registry.lock().live_handles().len()
    }

    /// Most recent load, unload or reload failure.
    pub fn last_error(&self) -> Option<PluginError> {
        self.last_error.lock().clone()
    }

    /// Load every shared library in `dir`.
    ///
    /// Failures are logged and recorded but do not stop the scan.
    pub fn discover<P: AsRef<Path>>(&self, dir: P) -> std::io::Result<Vec<PluginHandle>> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir.as_ref())?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_plugin_library(path))
            .collect();
        paths.sort();

        let mut loaded = Vec::new();
        for path in paths {
            match self.load_plugin(&path) {
                Ok(handle) => loaded.push(handle),
                Err(e) => warn!("Failed to load plugin {:?}: {}", path, e),
            }
        }
        Ok(loaded)
    }
}
