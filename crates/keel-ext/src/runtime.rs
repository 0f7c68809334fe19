use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use keel_config::ExtensionsConfig;
use keel_core::{Event, EventBus, HOST_VERSION, KeelError, LifecycleState, Result};

use crate::commands::{CommandInfo, CommandInvocation, CommandOutput, CommandTable};
use crate::context::{ContextParts, ExtensionContext, ExtensionIdentity};
use crate::guard::{self, PathGuard};
use crate::hooks::{self, DispatchReport, HookBus};
use crate::loader::{ExtensionModule, LoadRequest, ModuleLoader};
use crate::manifest::{self, ExtensionManifest, MANIFEST_FILE};
use crate::permission::{self, Disposition, PermissionSet};
use crate::services::HostServices;
use crate::storage::{StorageBackend, StorageLimits, StorageSandbox};

/// Runtime knobs, usually derived from `[extensions]` in `keel.toml`.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Primary root. Installs go here and uninstall only deletes under it.
    pub extensions_dir: PathBuf,
    pub dev_dir: Option<PathBuf>,
    pub load_timeout: Duration,
    pub activation_timeout: Duration,
    pub storage: StorageLimits,
    /// Version compared against manifest `hostCompatibility`.
    pub host_version: String,
}

impl RuntimeSettings {
    pub fn new(extensions_dir: impl Into<PathBuf>) -> Self {
        Self {
            extensions_dir: extensions_dir.into(),
            dev_dir: None,
            load_timeout: Duration::from_secs(5),
            activation_timeout: Duration::from_secs(10),
            storage: StorageLimits::default(),
            host_version: HOST_VERSION.to_string(),
        }
    }

    pub fn from_config(config: &ExtensionsConfig) -> Self {
        Self {
            extensions_dir: config.dir.clone(),
            dev_dir: config.dev_dir.clone(),
            load_timeout: Duration::from_millis(config.load_timeout_ms),
            activation_timeout: Duration::from_millis(config.activation_timeout_ms),
            storage: StorageLimits::from(config),
            host_version: HOST_VERSION.to_string(),
        }
    }

    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = Some(dev_dir.into());
        self
    }

    pub fn with_timeouts(mut self, load: Duration, activation: Duration) -> Self {
        self.load_timeout = load;
        self.activation_timeout = activation;
        self
    }

    /// Roots the path guard accepts, primary first.
    pub fn roots(&self) -> Vec<PathBuf> {
        std::iter::once(self.extensions_dir.clone())
            .chain(self.dev_dir.clone())
            .collect()
    }
}

/// Registry record for an extension that made it through activation.
struct LoadedExtension {
    manifest: Arc<ExtensionManifest>,
    module: Arc<dyn ExtensionModule>,
    context: ExtensionContext,
    path: PathBuf,
    grants: PermissionSet,
    active: bool,
    loaded_at: DateTime<Utc>,
}

impl LoadedExtension {
    fn state(&self) -> LifecycleState {
        if self.active {
            LifecycleState::Active
        } else {
            LifecycleState::Disabled
        }
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub state: LifecycleState,
    pub permissions: Vec<String>,
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct DiscoveryFailure {
    pub path: PathBuf,
    pub error: KeelError,
}

/// Outcome of a directory scan. One bad extension never aborts the scan.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    pub loaded: Vec<String>,
    pub failed: Vec<DiscoveryFailure>,
}

enum Outcome<T> {
    Done(Result<T>),
    Panicked(String),
    TimedOut,
}

/// Run `fut` on its own task and stop waiting at `deadline`.
///
/// On timeout the task is aborted. Code that never yields may keep running
/// on its worker; its result is dropped either way.
async fn time_boxed<T, F>(deadline: Duration, fut: F) -> Outcome<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let mut handle = tokio::spawn(fut);
    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(result)) => Outcome::Done(result),
        Ok(Err(join)) => Outcome::Panicked(join.to_string()),
        Err(_) => {
            handle.abort();
            Outcome::TimedOut
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into())
}

fn read_manifest(dir: &Path) -> Result<ExtensionManifest> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = std::fs::read(&path).map_err(|e| KeelError::ManifestInvalid {
        field: MANIFEST_FILE.into(),
        reason: format!("cannot read {}: {e}", path.display()),
    })?;
    ExtensionManifest::parse(&bytes)
}

pub struct RuntimeBuilder {
    settings: RuntimeSettings,
    services: HostServices,
    loaders: Vec<Arc<dyn ModuleLoader>>,
    backend: Option<Arc<dyn StorageBackend>>,
    events: EventBus,
}

impl RuntimeBuilder {
    pub fn services(mut self, services: HostServices) -> Self {
        self.services = services;
        self
    }

    /// Loaders are consulted in the order they were added.
    pub fn loader(mut self, loader: Arc<dyn ModuleLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn storage_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> ExtensionRuntime {
        // Accept both the configured and the canonical spelling of each root,
        // since entry files are checked again after canonicalization. A root
        // that does not exist yet still resolves through its ancestors.
        let mut roots = Vec::new();
        for root in self.settings.roots() {
            let root = std::path::absolute(&root).unwrap_or(root);
            if let Some(canonical) = guard::canonicalize_existing(&root) {
                if canonical != root {
                    roots.push(canonical);
                }
            }
            roots.push(root);
        }

        let storage = match self.backend {
            Some(backend) => StorageSandbox::with_backend(
                self.settings.extensions_dir.clone(),
                self.settings.storage,
                backend,
            ),
            None => StorageSandbox::new(self.settings.extensions_dir.clone(), self.settings.storage),
        };

        ExtensionRuntime {
            guard: PathGuard::new(roots),
            settings: self.settings,
            loaders: self.loaders,
            services: self.services,
            storage: Arc::new(storage),
            commands: Arc::new(CommandTable::new()),
            hooks: Arc::new(HookBus::new()),
            registry: RwLock::new(HashMap::new()),
            name_locks: DashMap::new(),
            dispatch: tokio::sync::Mutex::new(()),
            events: self.events,
        }
    }
}

/// Owns every extension, command and hook registration in the host.
///
/// Construct one at startup and pass it by reference to whatever needs to
/// list or invoke commands.
pub struct ExtensionRuntime {
    settings: RuntimeSettings,
    guard: PathGuard,
    loaders: Vec<Arc<dyn ModuleLoader>>,
    services: HostServices,
    storage: Arc<StorageSandbox>,
    commands: Arc<CommandTable>,
    hooks: Arc<HookBus>,
    registry: RwLock<HashMap<String, LoadedExtension>>,
    /// Serializes lifecycle transitions per extension name.
    name_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Serializes command and hook dispatch.
    dispatch: tokio::sync::Mutex<()>,
    events: EventBus,
}

impl ExtensionRuntime {
    pub fn builder(settings: RuntimeSettings) -> RuntimeBuilder {
        RuntimeBuilder {
            settings,
            services: HostServices::default(),
            loaders: Vec::new(),
            backend: None,
            events: EventBus::default(),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<StorageSandbox> {
        &self.storage
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to host lifecycle notifications.
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.name_locks.entry(name.to_string()).or_default().value())
    }

    fn context_parts(&self) -> ContextParts {
        ContextParts {
            services: self.services.clone(),
            commands: Arc::clone(&self.commands),
            hooks: Arc::clone(&self.hooks),
            storage: Arc::clone(&self.storage),
        }
    }

    fn reject(&self, source: &str, error: KeelError) -> KeelError {
        warn!(source = %source, kind = error.kind(), error = %error, "extension rejected");
        self.events.publish(Event::ExtensionRejected {
            source: source.to_string(),
            error_kind: error.kind().to_string(),
            error: error.to_string(),
        });
        error
    }

    // ── Discovery & loading ────────────────────────────────────

    /// Scan the primary and dev roots and load every extension found.
    pub async fn discover(&self) -> DiscoveryReport {
        let mut report = DiscoveryReport::default();

        for root in self.settings.roots() {
            if !root.exists() {
                info!(root = ?root, "extensions directory does not exist, skipping discovery");
                continue;
            }
            let entries = match std::fs::read_dir(&root) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(root = ?root, error = %e, "failed to read extensions directory");
                    report.failed.push(DiscoveryFailure {
                        path: root.clone(),
                        error: e.into(),
                    });
                    continue;
                }
            };

            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_dir())
                .collect();
            dirs.sort();

            for dir in dirs {
                match self.load_from_dir(&dir).await {
                    Ok(name) => report.loaded.push(name),
                    Err(error) => report.failed.push(DiscoveryFailure { path: dir, error }),
                }
            }
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "extension discovery complete"
        );
        report
    }

    /// Run the full load sequence for one extension directory.
    pub async fn load_from_dir(&self, dir: &Path) -> Result<String> {
        let manifest =
            read_manifest(dir).map_err(|e| self.reject(&dir.display().to_string(), e))?;
        let name = manifest.name.clone();

        let lock = self.name_lock(&name);
        let _held = lock.lock().await;
        self.load_locked(dir, manifest)
            .await
            .map_err(|e| self.reject(&name, e))
    }

    async fn load_locked(&self, dir: &Path, manifest: ExtensionManifest) -> Result<String> {
        let name = manifest.name.clone();

        if self.registry.read().contains_key(&name) {
            return Err(KeelError::AlreadyLoaded(name));
        }
        debug!(extension = %name, state = %LifecycleState::Validated, "manifest accepted");

        manifest.check_compatibility(&self.settings.host_version)?;

        let classification = permission::classify(&manifest.permissions).into_result(&name)?;
        if classification.disposition == Disposition::GrantedWithWarning {
            let elevated: Vec<&str> = classification.elevated.iter().map(|p| p.token()).collect();
            warn!(extension = %name, permissions = ?elevated, "granting elevated permissions");
        }
        let grants = classification.granted();
        debug!(extension = %name, state = %LifecycleState::PermissionChecked, "permissions granted");

        let dir = std::path::absolute(dir)?;
        let entry = guard::normalize(&dir.join(&manifest.entry_point));
        self.guard.check(&name, &entry)?;
        if !entry.is_file() {
            return Err(KeelError::LoadFailed {
                extension: name,
                reason: format!("entry file not found: {}", entry.display()),
            });
        }
        // A symlink must not lead out of the roots.
        let entry = std::fs::canonicalize(&entry)?;
        self.guard.check(&name, &entry)?;

        if manifest.checksum.is_some() && !manifest.verify_checksum(&std::fs::read(&entry)?) {
            return Err(KeelError::LoadRejected {
                extension: name,
                reason: "entry file checksum mismatch".into(),
            });
        }

        let manifest = Arc::new(manifest);
        let module = self.load_module(&manifest, entry).await?;
        debug!(extension = %name, state = %LifecycleState::Loaded, "module loaded");

        let context = self.new_context(&manifest, &grants)?;
        self.activate(&name, &module, &context).await?;

        self.registry.write().insert(
            name.clone(),
            LoadedExtension {
                manifest: Arc::clone(&manifest),
                module,
                context,
                path: dir,
                grants,
                active: true,
                loaded_at: Utc::now(),
            },
        );

        info!(extension = %name, version = %manifest.version, "extension active");
        self.announce_activated(&manifest).await;
        Ok(name)
    }

    async fn load_module(
        &self,
        manifest: &Arc<ExtensionManifest>,
        entry_path: PathBuf,
    ) -> Result<Arc<dyn ExtensionModule>> {
        let name = manifest.name.clone();
        let request = LoadRequest {
            manifest: Arc::clone(manifest),
            entry_path,
        };
        let loader = self
            .loaders
            .iter()
            .find(|l| l.can_load(&request))
            .cloned()
            .ok_or_else(|| KeelError::LoadFailed {
                extension: name.clone(),
                reason: format!("no loader accepts {}", request.entry_path.display()),
            })?;
        debug!(extension = %name, loader = loader.kind(), "loading entry file");

        let deadline = self.settings.load_timeout;
        let module = match time_boxed(deadline, async move { loader.load(request).await }).await {
            Outcome::Done(Ok(module)) => module,
            Outcome::Done(Err(e @ KeelError::LoadFailed { .. })) => return Err(e),
            Outcome::Done(Err(e)) => {
                return Err(KeelError::LoadFailed {
                    extension: name,
                    reason: e.to_string(),
                });
            }
            Outcome::Panicked(reason) => {
                return Err(KeelError::LoadFailed {
                    extension: name,
                    reason: format!("loader panicked: {reason}"),
                });
            }
            Outcome::TimedOut => {
                return Err(KeelError::LoadFailed {
                    extension: name,
                    reason: format!("load timed out after {}ms", deadline.as_millis()),
                });
            }
        };

        if module.name() != name {
            return Err(KeelError::LoadFailed {
                reason: format!("module reports name '{}', manifest says '{name}'", module.name()),
                extension: name,
            });
        }
        Ok(module)
    }

    fn new_context(
        &self,
        manifest: &ExtensionManifest,
        grants: &PermissionSet,
    ) -> Result<ExtensionContext> {
        let data_dir = self.storage.namespace_dir(&manifest.name)?;
        std::fs::create_dir_all(&data_dir)?;
        let identity = ExtensionIdentity {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            data_dir,
        };
        Ok(ExtensionContext::new(identity, grants.clone(), &self.context_parts()))
    }

    /// Run activation under the deadline. On any failure the context is
    /// revoked and whatever it registered is removed.
    async fn activate(
        &self,
        name: &str,
        module: &Arc<dyn ExtensionModule>,
        context: &ExtensionContext,
    ) -> Result<()> {
        let deadline = self.settings.activation_timeout;
        let task_module = Arc::clone(module);
        let task_context = context.clone();
        let outcome =
            time_boxed(deadline, async move { task_module.activate(task_context).await }).await;

        let reason = match outcome {
            Outcome::Done(Ok(())) => return Ok(()),
            Outcome::Done(Err(e)) => e.to_string(),
            Outcome::Panicked(reason) => format!("activation panicked: {reason}"),
            Outcome::TimedOut => format!("activation timed out after {}ms", deadline.as_millis()),
        };

        context.revoke();
        let commands = self.commands.remove_owned(name);
        let subscriptions = self.hooks.remove_owned(name);
        debug!(
            extension = name,
            commands = commands.len(),
            subscriptions,
            "rolled back partial registrations"
        );
        Err(KeelError::ActivationFailed {
            extension: name.to_string(),
            reason,
        })
    }

    async fn announce_activated(&self, manifest: &ExtensionManifest) {
        self.publish(
            hooks::EXTENSION_ACTIVATED,
            json!({ "name": manifest.name, "version": manifest.version }),
        )
        .await;
        self.events.publish(Event::ExtensionActivated {
            name: manifest.name.clone(),
            version: manifest.version.clone(),
        });
    }

    // ── Install & removal ──────────────────────────────────────

    /// Copy an extension from `source` into the primary root and load it.
    ///
    /// The copy is removed again if the load fails.
    pub async fn install(&self, source: &Path) -> Result<String> {
        let manifest =
            read_manifest(source).map_err(|e| self.reject(&source.display().to_string(), e))?;
        let name = manifest.name.clone();

        let lock = self.name_lock(&name);
        let _held = lock.lock().await;

        let target = self.settings.extensions_dir.join(&name);
        self.copy_into_root(source, &manifest, &target)
            .map_err(|e| self.reject(&name, e))?;

        match self.load_locked(&target, manifest).await {
            Ok(name) => {
                info!(extension = %name, path = ?target, "extension installed");
                Ok(name)
            }
            Err(e) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&target) {
                    warn!(extension = %name, error = %cleanup, "failed to remove partial install");
                }
                Err(self.reject(&name, e))
            }
        }
    }

    fn copy_into_root(&self, source: &Path, manifest: &ExtensionManifest, target: &Path) -> Result<()> {
        let name = &manifest.name;
        if self.registry.read().contains_key(name) {
            return Err(KeelError::AlreadyLoaded(name.clone()));
        }
        if target.exists() {
            return Err(KeelError::LoadRejected {
                extension: name.clone(),
                reason: format!("already installed at {}", target.display()),
            });
        }

        let source = std::path::absolute(source)?;
        let entry = guard::normalize(&source.join(&manifest.entry_point));
        let relative = guard::relative_to(&source, &entry).ok_or_else(|| KeelError::LoadRejected {
            extension: name.clone(),
            reason: "entry point escapes the extension directory".into(),
        })?;
        if !PathGuard::is_safe_entry_file(&entry) {
            return Err(KeelError::LoadRejected {
                extension: name.clone(),
                reason: format!("unsafe entry file type: {}", entry.display()),
            });
        }
        if !entry.is_file() {
            return Err(KeelError::LoadFailed {
                extension: name.clone(),
                reason: format!("entry file not found: {}", entry.display()),
            });
        }

        let entry_target = target.join(&relative);
        if let Some(parent) = entry_target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir_all(target.join("data"))?;
        std::fs::copy(source.join(MANIFEST_FILE), target.join(MANIFEST_FILE))?;
        std::fs::copy(&entry, &entry_target)?;
        Ok(())
    }

    /// Deactivate an extension and drop it from the registry, leaving its
    /// files in place.
    pub async fn unload(&self, name: &str) -> Result<()> {
        let lock = self.name_lock(name);
        let _held = lock.lock().await;
        self.unload_locked(name).await?;
        self.events.publish(Event::ExtensionUnloaded {
            name: name.to_string(),
            files_removed: false,
        });
        Ok(())
    }

    async fn unload_locked(&self, name: &str) -> Result<LoadedExtension> {
        let loaded = self
            .registry
            .write()
            .remove(name)
            .ok_or_else(|| KeelError::ExtensionNotFound(name.to_string()))?;

        if loaded.active {
            self.teardown(name, &loaded.module, &loaded.context).await;
        }
        info!(extension = name, state = %LifecycleState::Unloaded, "extension unloaded");
        Ok(loaded)
    }

    /// Unload an extension and delete its directory.
    ///
    /// Only directories under the primary root are deleted; an extension
    /// loaded from the dev root is unloaded and left on disk. An installed
    /// but not loaded extension is deleted directly.
    pub async fn uninstall(&self, name: &str) -> Result<bool> {
        if !manifest::is_valid_name(name) {
            return Err(KeelError::ExtensionNotFound(name.to_string()));
        }
        let lock = self.name_lock(name);
        let _held = lock.lock().await;

        let path = match self.unload_locked(name).await {
            Ok(loaded) => loaded.path,
            Err(KeelError::ExtensionNotFound(_)) => {
                let candidate = self.settings.extensions_dir.join(name);
                if !candidate.is_dir() {
                    return Err(KeelError::ExtensionNotFound(name.to_string()));
                }
                candidate
            }
            Err(e) => return Err(e),
        };

        let in_primary = std::path::absolute(&self.settings.extensions_dir)
            .ok()
            .and_then(|root| guard::relative_to(&root, &path))
            .is_some_and(|rel| rel.components().count() == 1);

        let files_removed = if in_primary && path.exists() {
            std::fs::remove_dir_all(&path)?;
            info!(extension = name, path = ?path, "extension files removed");
            true
        } else {
            warn!(extension = name, path = ?path, "extension is outside the primary root, leaving files in place");
            false
        };

        self.events.publish(Event::ExtensionUnloaded {
            name: name.to_string(),
            files_removed,
        });
        Ok(files_removed)
    }

    // ── Enable / disable ───────────────────────────────────────

    pub async fn disable(&self, name: &str) -> Result<()> {
        let lock = self.name_lock(name);
        let _held = lock.lock().await;

        let (module, context) = {
            let mut registry = self.registry.write();
            let loaded = registry
                .get_mut(name)
                .ok_or_else(|| KeelError::ExtensionNotFound(name.to_string()))?;
            if !loaded.active {
                return Ok(());
            }
            loaded.active = false;
            (Arc::clone(&loaded.module), loaded.context.clone())
        };

        self.teardown(name, &module, &context).await;
        info!(extension = name, state = %LifecycleState::Disabled, "extension disabled");
        self.events.publish(Event::ExtensionDisabled {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Re-run activation with a fresh context. On failure the extension
    /// stays disabled.
    pub async fn enable(&self, name: &str) -> Result<()> {
        let lock = self.name_lock(name);
        let _held = lock.lock().await;

        let (manifest, module, grants) = {
            let registry = self.registry.read();
            let loaded = registry
                .get(name)
                .ok_or_else(|| KeelError::ExtensionNotFound(name.to_string()))?;
            if loaded.active {
                return Ok(());
            }
            (
                Arc::clone(&loaded.manifest),
                Arc::clone(&loaded.module),
                loaded.grants.clone(),
            )
        };

        let context = self.new_context(&manifest, &grants)?;
        self.activate(name, &module, &context).await?;

        if let Some(loaded) = self.registry.write().get_mut(name) {
            loaded.context = context;
            loaded.active = true;
        }
        info!(extension = name, state = %LifecycleState::Active, "extension enabled");
        self.announce_activated(&manifest).await;
        Ok(())
    }

    /// Drop every registration the extension owns, then run its
    /// deactivation routine best-effort.
    ///
    /// Registrations go first so nothing is dispatched to the extension
    /// while a slow deactivation is still running.
    async fn teardown(
        &self,
        name: &str,
        module: &Arc<dyn ExtensionModule>,
        context: &ExtensionContext,
    ) {
        context.revoke();
        let commands = self.commands.remove_owned(name);
        let subscriptions = self.hooks.remove_owned(name);
        debug!(extension = name, commands = commands.len(), subscriptions, "registrations removed");

        match AssertUnwindSafe(module.deactivate()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(extension = name, error = %e, "deactivation failed"),
            Err(p) => warn!(extension = name, panic = %panic_message(&*p), "deactivation panicked"),
        }

        self.publish(hooks::EXTENSION_DEACTIVATED, json!({ "name": name }))
            .await;
    }

    // ── Introspection ──────────────────────────────────────────

    /// All registered extensions, sorted by name.
    pub fn list_extensions(&self) -> Vec<ExtensionInfo> {
        let mut infos: Vec<ExtensionInfo> = self
            .registry
            .read()
            .values()
            .map(|l| ExtensionInfo {
                name: l.manifest.name.clone(),
                version: l.manifest.version.clone(),
                description: l.manifest.description.clone(),
                state: l.state(),
                permissions: l.grants.tokens().into_iter().map(String::from).collect(),
                path: l.path.clone(),
                loaded_at: l.loaded_at,
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// `Active` or `Disabled` for registered extensions, `None` otherwise.
    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.registry.read().get(name).map(LoadedExtension::state)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.state(name) == Some(LifecycleState::Active)
    }

    pub fn manifest(&self, name: &str) -> Option<Arc<ExtensionManifest>> {
        self.registry.read().get(name).map(|l| Arc::clone(&l.manifest))
    }

    pub fn extension_dir(&self, name: &str) -> Option<PathBuf> {
        if let Some(loaded) = self.registry.read().get(name) {
            return Some(loaded.path.clone());
        }
        let candidate = self.settings.extensions_dir.join(name);
        (manifest::is_valid_name(name) && candidate.is_dir()).then_some(candidate)
    }

    // ── Dispatch ───────────────────────────────────────────────

    /// Commands of active extensions, sorted by name.
    pub fn list_commands(&self) -> Vec<CommandInfo> {
        self.commands
            .list()
            .into_iter()
            .filter(|c| self.is_active(&c.owning_extension))
            .collect()
    }

    /// Invoke a command, surrounded by `command:before` / `command:after`
    /// hooks. Dispatch is serialized; a panicking handler becomes
    /// `CommandFailed`.
    pub async fn invoke(&self, name: &str, invocation: CommandInvocation) -> Result<CommandOutput> {
        let _dispatch = self.dispatch.lock().await;

        let (info, handler) = self
            .commands
            .lookup(name)
            .filter(|(info, _)| self.is_active(&info.owning_extension))
            .ok_or_else(|| KeelError::CommandNotFound(name.to_string()))?;
        let owner = info.owning_extension;

        self.hooks
            .publish(
                hooks::COMMAND_BEFORE,
                json!({ "command": name, "extension": owner, "args": invocation.args }),
                None,
            )
            .await;

        let result = match AssertUnwindSafe(handler.call(invocation)).catch_unwind().await {
            Ok(result) => result,
            Err(p) => Err(KeelError::CommandFailed {
                command: name.to_string(),
                reason: format!("handler panicked: {}", panic_message(&*p)),
            }),
        };
        if let Err(e) = &result {
            warn!(command = name, extension = %owner, error = %e, "command failed");
        }

        let error: Value = match &result {
            Ok(_) => Value::Null,
            Err(e) => Value::String(e.to_string()),
        };
        self.hooks
            .publish(
                hooks::COMMAND_AFTER,
                json!({ "command": name, "extension": owner, "ok": result.is_ok(), "error": error }),
                None,
            )
            .await;

        self.events.publish(Event::CommandInvoked {
            command: name.to_string(),
            extension: owner,
            is_error: result.is_err(),
            at: Utc::now(),
        });
        result
    }

    /// Publish a hook event from the host.
    pub async fn publish(&self, event: &str, payload: Value) -> DispatchReport {
        let _dispatch = self.dispatch.lock().await;
        self.hooks.publish(event, payload, None).await
    }
}
