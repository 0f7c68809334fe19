use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::schema::KeelConfig;

/// Loads and reloads the Keel configuration.
pub struct ConfigLoader {
    config: Arc<RwLock<KeelConfig>>,
    config_path: PathBuf,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > KEEL_CONFIG env > ~/.keel/keel.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("KEEL_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".keel")
            .join("keel.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> keel_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::read_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            KeelConfig::default()
        };

        let config = Self::apply_env_overrides(config, |key| std::env::var(key).ok());
        Self::check(&config)?;

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
        })
    }

    /// Get a read snapshot of the current config.
    pub fn get(&self) -> KeelConfig {
        self.config.read().clone()
    }

    /// Get a shared reference for subscription.
    pub fn shared(&self) -> Arc<RwLock<KeelConfig>> {
        Arc::clone(&self.config)
    }

    /// Path the config was (or would have been) loaded from.
    pub fn path(&self) -> &Path {
        &self.config_path
    }

    /// Reload the config from disk. The current config is kept if the new
    /// one fails to parse or validate.
    pub fn reload(&self) -> keel_core::Result<()> {
        if !self.config_path.exists() {
            return Err(keel_core::KeelError::Config(format!(
                "config file not found: {}",
                self.config_path.display()
            )));
        }
        let new_config = Self::read_file(&self.config_path)?;
        let new_config = Self::apply_env_overrides(new_config, |key| std::env::var(key).ok());
        Self::check(&new_config)?;
        *self.config.write() = new_config;
        info!("configuration reloaded");
        Ok(())
    }

    fn read_file(path: &Path) -> keel_core::Result<KeelConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<KeelConfig>(&raw).map_err(|e| {
            keel_core::KeelError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate config: log warnings, fail on errors.
    fn check(config: &KeelConfig) -> keel_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(keel_core::KeelError::Config(e)),
        }
    }

    /// Apply env var overrides (KEEL_EXTENSIONS_DIR, KEEL_LOG_LEVEL, etc.).
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env_overrides<F>(mut config: KeelConfig, lookup: F) -> KeelConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("KEEL_EXTENSIONS_DIR") {
            config.extensions.dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("KEEL_DEV_EXTENSIONS_DIR") {
            config.extensions.dev_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("KEEL_LOAD_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => config.extensions.load_timeout_ms = ms,
                Err(_) => warn!(value = %v, "ignoring non-numeric KEEL_LOAD_TIMEOUT_MS"),
            }
        }
        if let Some(v) = lookup("KEEL_ACTIVATION_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => config.extensions.activation_timeout_ms = ms,
                Err(_) => warn!(value = %v, "ignoring non-numeric KEEL_ACTIVATION_TIMEOUT_MS"),
            }
        }
        if let Some(v) = lookup("KEEL_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }
}
