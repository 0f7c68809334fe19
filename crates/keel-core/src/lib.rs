//! # keel-core
//!
//! Core types and primitives shared by every crate in the Keel workspace:
//! the error taxonomy, host lifecycle events, and the identifiers used to
//! talk about extensions and their commands.

pub mod error;
pub mod event;
pub mod types;

pub use error::{KeelError, Result};
pub use event::{Event, EventBus};
pub use types::*;
