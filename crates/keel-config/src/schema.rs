use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration: maps to `keel.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeelConfig {
    pub extensions: ExtensionsConfig,
    pub services: ServicesConfig,
    pub logging: LoggingConfig,
}

// ── Extensions ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtensionsConfig {
    /// Primary extensions root. Each extension lives in `<dir>/<name>/`.
    pub dir: PathBuf,
    /// Optional development root. Extensions here can be loaded but are
    /// never deleted by uninstall.
    pub dev_dir: Option<PathBuf>,
    /// Deadline for loading an extension's entry file, in milliseconds.
    pub load_timeout_ms: u64,
    /// Deadline for an extension's activation routine, in milliseconds.
    pub activation_timeout_ms: u64,
    /// Maximum serialized size of a single storage value.
    pub storage_quota_bytes: usize,
    /// Maximum length of a storage key.
    pub max_key_length: usize,
    /// Discover and load installed extensions on startup.
    pub autoload: bool,
}

impl Default for ExtensionsConfig {
    fn default() -> Self {
        Self {
            dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".keel")
                .join("extensions"),
            dev_dir: None,
            load_timeout_ms: 5_000,
            activation_timeout_ms: 10_000,
            storage_quota_bytes: 1024 * 1024,
            max_key_length: 128,
            autoload: true,
        }
    }
}

// ── Services ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Timeout for outbound HTTP requests made on behalf of extensions.
    pub http_timeout_secs: u64,
    /// Responses larger than this are cut off before being handed to an extension.
    pub max_response_bytes: usize,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            http_timeout_secs: 30,
            max_response_bytes: 4 * 1024 * 1024,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl KeelConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();
        let ext = &self.extensions;

        // ── Timeouts ───
        if ext.load_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "extensions.load_timeout_ms".into(),
                message: "load timeout is 0 — no extension could ever load".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 5000".into()),
            });
        }
        if ext.activation_timeout_ms == 0 {
            warnings.push(ConfigWarning {
                field: "extensions.activation_timeout_ms".into(),
                message: "activation timeout is 0 — no extension could ever activate".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 10000".into()),
            });
        } else if ext.activation_timeout_ms > 120_000 {
            warnings.push(ConfigWarning {
                field: "extensions.activation_timeout_ms".into(),
                message: format!(
                    "activation timeout is {}s — a hung extension will stall startup that long",
                    ext.activation_timeout_ms / 1000
                ),
                severity: WarningSeverity::Warning,
                hint: Some("Values above two minutes are rarely useful".into()),
            });
        }

        // ── Storage ───
        if ext.storage_quota_bytes == 0 {
            warnings.push(ConfigWarning {
                field: "extensions.storage_quota_bytes".into(),
                message: "storage quota is 0 — every write would be rejected".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 1048576 (1 MiB)".into()),
            });
        }
        if ext.max_key_length == 0 {
            warnings.push(ConfigWarning {
                field: "extensions.max_key_length".into(),
                message: "max key length is 0 — every key would be rejected".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. 128".into()),
            });
        } else if ext.max_key_length > 200 {
            warnings.push(ConfigWarning {
                field: "extensions.max_key_length".into(),
                message: format!("max key length {} may exceed filesystem name limits", ext.max_key_length),
                severity: WarningSeverity::Warning,
                hint: Some("Most filesystems cap names at 255 bytes".into()),
            });
        }

        // ── Roots ───
        if let Some(dev) = &ext.dev_dir {
            if dev == &ext.dir {
                warnings.push(ConfigWarning {
                    field: "extensions.dev_dir".into(),
                    message: "dev_dir is the same as dir".into(),
                    severity: WarningSeverity::Info,
                    hint: None,
                });
            }
        }

        // ── Services ───
        if self.services.http_timeout_secs == 0 {
            warnings.push(ConfigWarning {
                field: "services.http_timeout_secs".into(),
                message: "http timeout is 0 — outbound requests will fail immediately".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Set to e.g. 30".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
