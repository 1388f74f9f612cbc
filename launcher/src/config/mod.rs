//! Configuration management for the launcher: the persisted lifecycle stage and the node,
//! registry, supervisor, update and IPC settings.
//!
//! This module provides a unified interface to all configuration-related functionality,
//! including data types and loading/saving utilities.

mod loader;
mod types;

pub use loader::*;
pub use types::*;
