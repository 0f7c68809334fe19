use thiserror::Error;

/// Unified error type for the Keel runtime.
///
/// Every variant is recoverable from the host's point of view: a failure is
/// isolated to the extension (or command) that caused it.
#[derive(Error, Debug)]
pub enum KeelError {
    // ── Manifest / policy errors ───────────────────────────────
    #[error("manifest invalid: {field}: {reason}")]
    ManifestInvalid { field: String, reason: String },

    #[error("permission denied: {extension}: {reason}")]
    PermissionDenied { extension: String, reason: String },

    // ── Load lifecycle errors ──────────────────────────────────
    #[error("load rejected: {extension}: {reason}")]
    LoadRejected { extension: String, reason: String },

    #[error("load failed: {extension}: {reason}")]
    LoadFailed { extension: String, reason: String },

    #[error("activation failed: {extension}: {reason}")]
    ActivationFailed { extension: String, reason: String },

    #[error("extension already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("extension not found: {0}")]
    ExtensionNotFound(String),

    // ── Command errors ─────────────────────────────────────────
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command name conflict: '{command}' is already registered by {owner}")]
    CommandNameConflict { command: String, owner: String },

    #[error("command failed: {command}: {reason}")]
    CommandFailed { command: String, reason: String },

    // ── Storage errors ─────────────────────────────────────────
    #[error("storage violation: {namespace}: {reason}")]
    StorageViolation { namespace: String, reason: String },

    // ── Host collaborator errors ───────────────────────────────
    #[error("service error: {service}: {reason}")]
    Service { service: String, reason: String },

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl KeelError {
    /// Short machine-readable kind, used in logs and host events.
    pub fn kind(&self) -> &'static str {
        match self {
            KeelError::ManifestInvalid { .. } => "manifest_invalid",
            KeelError::PermissionDenied { .. } => "permission_denied",
            KeelError::LoadRejected { .. } => "load_rejected",
            KeelError::LoadFailed { .. } => "load_failed",
            KeelError::ActivationFailed { .. } => "activation_failed",
            KeelError::AlreadyLoaded(_) => "already_loaded",
            KeelError::ExtensionNotFound(_) => "extension_not_found",
            KeelError::CommandNotFound(_) => "command_not_found",
            KeelError::CommandNameConflict { .. } => "command_name_conflict",
            KeelError::CommandFailed { .. } => "command_failed",
            KeelError::StorageViolation { .. } => "storage_violation",
            KeelError::Service { .. } => "service",
            KeelError::Config(_) | KeelError::ConfigValidation { .. } => "config",
            KeelError::Io(_) => "io",
            KeelError::Serialization(_) => "serialization",
            KeelError::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, KeelError>;
