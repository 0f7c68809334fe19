//! # keel-ext
//!
//! Capability-scoped extension runtime. Extensions are discovered on disk,
//! validated, permission-checked and path-checked, then loaded and activated
//! under deadlines. An extension touches host state only through the
//! [`ExtensionContext`] it is handed at activation.
//!
//! ## Extension Manifest
//!
//! Each extension ships with an `extension.toml` next to its entry file:
//!
//! ```toml
//! name = "demo"
//! version = "1.0.0"
//! description = "Echo arguments back"
//! author = "Keel Contributors"
//! entryPoint = "demo.wasm"
//! permissions = ["commands", "storage:read", "storage:write"]
//!
//! [hostCompatibility]
//! minVersion = "0.1.0"
//! ```

pub mod commands;
pub mod context;
pub mod guard;
pub mod hooks;
pub mod loader;
pub mod manifest;
pub mod permission;
pub mod runtime;
pub mod services;
pub mod storage;
#[cfg(feature = "wasm")]
pub mod wasm;

pub use commands::{CommandHandler, CommandInfo, CommandInvocation, CommandOutput, CommandTable};
pub use context::{ExtensionContext, ExtensionIdentity};
pub use guard::PathGuard;
pub use hooks::{DispatchReport, HookBus, HookEvent, HookHandler};
pub use loader::{BuiltinLoader, ExtensionModule, LoadRequest, ModuleLoader};
pub use manifest::ExtensionManifest;
pub use permission::{Classification, Disposition, Permission, PermissionSet, Tier};
pub use runtime::{DiscoveryReport, ExtensionInfo, ExtensionRuntime, RuntimeSettings};
pub use services::HostServices;
pub use storage::{StorageLimits, StorageSandbox};
#[cfg(feature = "wasm")]
pub use wasm::WasmLoader;
