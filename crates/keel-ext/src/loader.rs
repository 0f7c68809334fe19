use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use keel_core::{KeelError, Result};

use crate::context::ExtensionContext;
use crate::manifest::ExtensionManifest;

/// A loaded extension code object.
///
/// `activate` receives the extension's capability context and registers its
/// commands and hooks through it. The runtime time-boxes it and rolls back
/// any registrations if it fails.
#[async_trait]
pub trait ExtensionModule: Send + Sync {
    /// Name reported by the code itself. Must match the manifest name.
    fn name(&self) -> &str;

    async fn activate(&self, ctx: ExtensionContext) -> Result<()>;

    /// Optional teardown, run on disable and unload. Errors are logged only.
    async fn deactivate(&self) -> Result<()> {
        Ok(())
    }
}

/// What a loader needs to produce a module.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub manifest: Arc<ExtensionManifest>,
    /// Resolved, guard-checked path of the entry file.
    pub entry_path: PathBuf,
}

/// Turns an entry file into an [`ExtensionModule`].
#[async_trait]
pub trait ModuleLoader: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Whether this loader handles the request. The first loader that says
    /// yes is used.
    fn can_load(&self, request: &LoadRequest) -> bool;

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn ExtensionModule>>;
}

pub type ModuleFactory = Arc<dyn Fn() -> Arc<dyn ExtensionModule> + Send + Sync>;

/// Extensions compiled into the host.
///
/// A builtin still ships as an installed directory with a manifest and an
/// entry file, so it goes through the same validation, permission and path
/// checks as any other extension; only the code comes from the factory.
/// The entry file must exist (and match any checksum) but its contents are
/// never read.
#[derive(Default)]
pub struct BuiltinLoader {
    factories: RwLock<HashMap<String, ModuleFactory>>,
}

impl BuiltinLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for the extension whose manifest is named `name`.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Arc<dyn ExtensionModule> + Send + Sync + 'static,
    {
        self.factories
            .write()
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ModuleLoader for BuiltinLoader {
    fn kind(&self) -> &'static str {
        "builtin"
    }

    fn can_load(&self, request: &LoadRequest) -> bool {
        self.factories.read().contains_key(&request.manifest.name)
    }

    async fn load(&self, request: LoadRequest) -> Result<Arc<dyn ExtensionModule>> {
        let factory = self
            .factories
            .read()
            .get(&request.manifest.name)
            .cloned()
            .ok_or_else(|| KeelError::LoadFailed {
                extension: request.manifest.name.clone(),
                reason: "no builtin factory registered".into(),
            })?;
        Ok(factory())
    }
}
