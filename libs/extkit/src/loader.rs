//! Plugin loader: discovers extensions from the compiled-in registry or a
//! plugin directory, filters them, and installs them into a manager.
//!
//! Per-plugin load order: security validation, resource admission, plugin
//! ceiling, then opening the shared object (or taking the built-in entry).
//! An admission is handed back to the monitor whenever a later step fails.
//!
//! File mode resolves the exported `Instance` symbol from each shared
//! object. Loaded libraries are kept alive for the life of the loader;
//! unloading an extension never unmaps its code pages.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;

use crate::config::{ExtensionConfig, ExtensionMode};
use crate::contracts::Extension;
use crate::errors::ExtensionError;
use crate::manager::{ExtensionManager, ExtensionStatus};
use crate::registry;
use crate::task::run_caught;

/// Validates plugin paths before anything is opened.
pub trait SecurityPolicy: Send + Sync {
    fn validate(&self, path: &std::path::Path) -> Result<(), String>;
}

/// Per-plugin resource admission (memory/handle budgets live outside).
///
/// Every successful `admit` is paired with a `release` when the plugin
/// fails to install or is unloaded.
pub trait ResourceMonitor: Send + Sync {
    fn admit(&self, name: &str) -> Result<(), String>;

    fn release(&self, _name: &str) {}
}

/// Where a named plugin was found.
enum PluginSource {
    Builtin,
    File(PathBuf),
}

pub struct PluginLoader {
    config: ExtensionConfig,
    security: RwLock<Option<Arc<dyn SecurityPolicy>>>,
    monitor: RwLock<Option<Arc<dyn ResourceMonitor>>>,
    #[cfg(feature = "dynamic-loading")]
    libraries: parking_lot::Mutex<Vec<libloading::Library>>,
}

impl PluginLoader {
    pub fn new(config: ExtensionConfig) -> Self {
        Self {
            config,
            security: RwLock::new(None),
            monitor: RwLock::new(None),
            #[cfg(feature = "dynamic-loading")]
            libraries: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn set_security_policy(&self, policy: Option<Arc<dyn SecurityPolicy>>) {
        *self.security.write() = policy;
    }

    pub fn set_resource_monitor(&self, monitor: Option<Arc<dyn ResourceMonitor>>) {
        *self.monitor.write() = monitor;
    }

    /// Include/exclude filtering. A non-empty include list is authoritative.
    pub fn allowed(&self, name: &str) -> bool {
        if !self.config.includes.is_empty() {
            return self.config.includes.iter().any(|n| n == name);
        }
        !self.config.excludes.iter().any(|n| n == name)
    }

    /// Names discoverable in the active mode, unfiltered.
    pub fn discover(&self) -> Vec<String> {
        match self.config.mode {
            ExtensionMode::Builtin => registry::builtin_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            ExtensionMode::File => self
                .discover_files()
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
        }
    }

    /// Scan the plugin directory and its nested `plugins/` directory for
    /// files carrying the platform dynamic-library extension.
    fn discover_files(&self) -> Vec<(String, PathBuf)> {
        let Some(base) = self.config.path.clone() else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for dir in [base.clone(), base.join("plugins")] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_dylib = path
                    .extension()
                    .is_some_and(|e| e == std::env::consts::DLL_EXTENSION);
                if !is_dylib {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    let name = stem.strip_prefix("lib").unwrap_or(stem).to_string();
                    found.push((name, path));
                }
            }
        }
        found.sort();
        found
    }

    /// Instances for startup registration: every discovered extension that
    /// passes the filters. Missing include names are skipped quietly.
    pub fn resolve_startup_instances(&self) -> Result<Vec<Arc<dyn Extension>>, ExtensionError> {
        match self.config.mode {
            ExtensionMode::Builtin => Ok(registry::builtin_extensions()
                .into_iter()
                .filter(|e| self.allowed(e.name()))
                .collect()),
            ExtensionMode::File => {
                let mut out = Vec::new();
                for (name, path) in self.discover_files() {
                    if !self.allowed(&name) {
                        continue;
                    }
                    self.validate_path(&path)?;
                    out.push(self.instantiate_file(&path)?);
                }
                Ok(out)
            }
        }
    }

    fn locate(&self, name: &str) -> Result<PluginSource, ExtensionError> {
        match self.config.mode {
            ExtensionMode::Builtin => {
                if registry::builtin_names().contains(&name) {
                    Ok(PluginSource::Builtin)
                } else {
                    Err(ExtensionError::NotFound(format!("built-in plugin '{name}'")))
                }
            }
            ExtensionMode::File => self
                .discover_files()
                .into_iter()
                .find(|(n, _)| n == name)
                .map(|(_, path)| PluginSource::File(path))
                .ok_or_else(|| ExtensionError::NotFound(format!("plugin file '{name}'"))),
        }
    }

    fn validate_path(&self, path: &std::path::Path) -> Result<(), ExtensionError> {
        if let Some(policy) = self.security.read().as_ref() {
            policy
                .validate(path)
                .map_err(|reason| ExtensionError::SecurityRejected {
                    path: path.display().to_string(),
                    reason,
                })?;
        }
        Ok(())
    }

    fn instantiate(
        &self,
        name: &str,
        source: &PluginSource,
    ) -> Result<Arc<dyn Extension>, ExtensionError> {
        match source {
            PluginSource::Builtin => registry::builtin_by_name(name)
                .ok_or_else(|| ExtensionError::NotFound(format!("built-in plugin '{name}'"))),
            PluginSource::File(path) => self.instantiate_file(path),
        }
    }

    #[cfg(feature = "dynamic-loading")]
    fn instantiate_file(&self, path: &std::path::Path) -> Result<Arc<dyn Extension>, ExtensionError> {
        type PluginEntry = unsafe extern "Rust" fn() -> Arc<dyn Extension>;

        // SAFETY: the plugin contract requires `Instance` to be an
        // `extern "Rust" fn() -> Arc<dyn Extension>` built against the same
        // extkit version as the host.
        let instance = unsafe {
            let library = libloading::Library::new(path).map_err(|e| {
                ExtensionError::PluginSymbolMissing {
                    path: path.display().to_string(),
                    source: anyhow::Error::from(e),
                }
            })?;
            let entry: PluginEntry = *library.get::<PluginEntry>(b"Instance").map_err(|e| {
                ExtensionError::PluginSymbolMissing {
                    path: path.display().to_string(),
                    source: anyhow::Error::from(e),
                }
            })?;
            let instance = entry();
            // Keep the library mapped; dropping it would invalidate the vtable.
            self.libraries.lock().push(library);
            instance
        };

        if instance.name().is_empty() {
            return Err(ExtensionError::IncompatibleInstance {
                path: path.display().to_string(),
            });
        }
        Ok(instance)
    }

    #[cfg(not(feature = "dynamic-loading"))]
    fn instantiate_file(&self, path: &std::path::Path) -> Result<Arc<dyn Extension>, ExtensionError> {
        Err(ExtensionError::IncompatibleInstance {
            path: format!(
                "{} (host built without the 'dynamic-loading' feature)",
                path.display()
            ),
        })
    }

    fn release_admission(&self, name: &str) {
        if let Some(monitor) = self.monitor.read().as_ref() {
            monitor.release(name);
        }
    }

    /// Load one plugin into a running manager and drive it through the
    /// single-node `pre_init -> init -> post_init` sequence.
    pub async fn load(
        &self,
        manager: &Arc<ExtensionManager>,
        name: &str,
    ) -> Result<(), ExtensionError> {
        if !self.allowed(name) {
            tracing::warn!(plugin = %name, "plugin filtered out by includes/excludes");
            return Ok(());
        }

        // Security validation comes before any resource accounting.
        let source = self.locate(name)?;
        if let PluginSource::File(path) = &source {
            self.validate_path(path)?;
        }

        let admitted = match self.monitor.read().as_ref() {
            Some(monitor) => {
                monitor
                    .admit(name)
                    .map_err(|reason| ExtensionError::ResourceLimit {
                        name: name.to_string(),
                        reason,
                    })?;
                true
            }
            None => false,
        };

        let result = self.install(manager, name, &source).await;
        if result.is_err() && admitted {
            self.release_admission(name);
        }
        result
    }

    /// Ceiling check, instantiation and bring-up. Runs after admission;
    /// the caller releases the admission when this fails.
    async fn install(
        &self,
        manager: &Arc<ExtensionManager>,
        name: &str,
        source: &PluginSource,
    ) -> Result<(), ExtensionError> {
        if self.config.max_plugins > 0 && manager.extension_count() >= self.config.max_plugins {
            return Err(ExtensionError::ResourceLimit {
                name: name.to_string(),
                reason: format!("plugin ceiling {} reached", self.config.max_plugins),
            });
        }

        let instance = self.instantiate(name, source)?;
        self.await_dependencies(manager, &instance).await?;

        let wrapper = manager.insert_loaded(instance)?;
        wrapper_phases(manager, &wrapper, &self.config).await.map_err(|e| {
            manager.remove_wrapper(name);
            e
        })?;

        manager.wire_extension(&wrapper);
        manager.metrics().incr("plugins_loaded_total");
        manager
            .events()
            .publish(&format!("exts.{name}.ready"), json!({"name": name}))
            .await;
        tracing::info!(plugin = %name, "plugin loaded");
        Ok(())
    }

    /// Wait until every declared dependency reports Active.
    async fn await_dependencies(
        &self,
        manager: &Arc<ExtensionManager>,
        instance: &Arc<dyn Extension>,
    ) -> Result<(), ExtensionError> {
        let deadline = Instant::now() + self.config.dependency_timeout;
        for dep in instance.dependencies() {
            loop {
                match manager.get_status(dep) {
                    Some(ExtensionStatus::Active) => break,
                    Some(_) if Instant::now() < deadline => {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                    _ => {
                        return Err(ExtensionError::MissingDependency {
                            module: instance.name().to_string(),
                            depends_on: dep.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Unload: `pre_cleanup` failures only warn, `cleanup` failures are
    /// fatal and leave the wrapper in place marked Error.
    pub async fn unload(
        &self,
        manager: &Arc<ExtensionManager>,
        name: &str,
    ) -> Result<(), ExtensionError> {
        let wrapper = manager
            .get_wrapper(name)
            .ok_or_else(|| ExtensionError::NotFound(name.to_string()))?;

        wrapper.set_status(ExtensionStatus::Stopping);

        let inst = wrapper.instance().clone();
        if let Err(e) = run_caught(async move { inst.pre_cleanup().await }).await {
            tracing::warn!(plugin = %name, error = %e, "pre_cleanup failed");
        }

        let inst = wrapper.instance().clone();
        if let Err(source) = run_caught(async move { inst.cleanup().await }).await {
            wrapper.set_status(ExtensionStatus::Error);
            return Err(ExtensionError::Cleanup {
                module: name.to_string(),
                source,
            });
        }

        manager.remove_wrapper(name);
        manager.deregister_extension_facets(name).await;
        wrapper.set_status(ExtensionStatus::Stopped);
        self.release_admission(name);
        manager.metrics().incr("plugins_unloaded_total");
        tracing::info!(plugin = %name, "plugin unloaded; code pages stay mapped");
        Ok(())
    }

    /// Unload then load; a failure leaves the post-unload state.
    pub async fn reload(
        &self,
        manager: &Arc<ExtensionManager>,
        name: &str,
    ) -> Result<(), ExtensionError> {
        self.unload(manager, name).await?;
        self.load(manager, name).await
    }
}

/// Single-node three-phase bring-up for a freshly loaded plugin.
async fn wrapper_phases(
    manager: &Arc<ExtensionManager>,
    wrapper: &Arc<crate::manager::ExtensionWrapper>,
    config: &ExtensionConfig,
) -> Result<(), ExtensionError> {
    use crate::task::with_timeout;

    let name = wrapper.metadata().name.clone();
    wrapper.set_status(ExtensionStatus::Initializing);

    let inst = wrapper.instance().clone();
    with_timeout(
        "plugin pre_init",
        config.load_timeout,
        run_caught(async move { inst.pre_init().await }),
    )
    .await?
    .map_err(|source| {
        wrapper.set_status(ExtensionStatus::Error);
        ExtensionError::PreInit {
            module: name.clone(),
            source,
        }
    })?;

    let inst = wrapper.instance().clone();
    let ctx = manager.extension_ctx(&name);
    with_timeout(
        "plugin init",
        config.init_timeout,
        run_caught(async move { inst.init(&ctx).await }),
    )
    .await?
    .map_err(|source| {
        wrapper.set_status(ExtensionStatus::Error);
        ExtensionError::Init {
            module: name.clone(),
            source,
        }
    })?;

    let inst = wrapper.instance().clone();
    with_timeout(
        "plugin post_init",
        config.load_timeout,
        run_caught(async move { inst.post_init().await }),
    )
    .await?
    .map_err(|source| {
        wrapper.set_status(ExtensionStatus::Error);
        ExtensionError::PostInit {
            module: name,
            source,
        }
    })?;

    wrapper.set_status(ExtensionStatus::Active);
    Ok(())
}
