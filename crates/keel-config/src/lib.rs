//! # keel-config
//!
//! Configuration system for Keel. Reads from `keel.toml` and environment
//! variables, with env taking precedence over the file.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::KeelConfig;
pub use schema::{ConfigWarning, ExtensionsConfig, LoggingConfig, ServicesConfig, WarningSeverity};
