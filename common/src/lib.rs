//! Common utilities shared by the launcher binary and its integration tests.
//!
//! This crate provides:
//! - The singleton channel's wire vocabulary
//! - OS-specific service installation helpers
//! - Build version information
#![expect(
    clippy::missing_errors_doc,
    reason = "The situation it maps to errors should be obvious."
)]

mod protocol;
mod service_install;
mod version;

pub use protocol::*;
pub use service_install::*;
pub use version::*;

/// Extension traits for error handling to improve code coverage.
pub trait ResultMapErrExt<T> {
    fn map_err_to_string(self, prefix: &str) -> Result<T, String>;
}

impl<T, E: core::fmt::Display> ResultMapErrExt<T> for Result<T, E> {
    fn map_err_to_string(self, prefix: &str) -> Result<T, String> {
        self.map_err(|e| format!("{prefix}: {e}"))
    }
}
