//! # keel-cli
//!
//! Command-line interface for Keel.
//!
//! ## Commands
//!
//! - `keel ext`: Install, inspect and remove extensions
//! - `keel commands`: List commands contributed by extensions
//! - `keel run`: Invoke an extension command
//! - `keel shell`: Interactive session with a long-lived extension runtime
//! - `keel config`: Show configuration
//! - `keel doctor`: Audit configuration

pub mod commands;

pub use commands::Cli;
