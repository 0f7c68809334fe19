use serde::{Deserialize, Serialize};

/// Unique identifier for an extension (its manifest `name`).
pub type ExtensionId = String;

/// Name of a command registered by an extension.
pub type CommandName = String;

/// Lifecycle stage of an extension inside the runtime.
///
/// `Discovered` through `Activated` are transient stages of a single load
/// sequence; only `Active` and `Disabled` are ever stored in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Discovered,
    Validated,
    PermissionChecked,
    Loaded,
    Activated,
    Active,
    Disabled,
    Unloaded,
}

impl LifecycleState {
    /// Whether an extension in this state counts as loaded for the duplicate guard.
    pub fn is_resident(&self) -> bool {
        matches!(self, LifecycleState::Active | LifecycleState::Disabled)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Discovered => "discovered",
            LifecycleState::Validated => "validated",
            LifecycleState::PermissionChecked => "permission_checked",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Activated => "activated",
            LifecycleState::Active => "active",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

/// Version of the host application, compared against extension
/// `hostCompatibility` ranges.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");
