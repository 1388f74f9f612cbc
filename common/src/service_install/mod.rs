//! Utilities to detect service management capabilities on the host system and to
//! (un)register the launcher with them.

#[cfg(target_os = "linux")]
pub mod systemd;

use std::path::Path;

/// Returns `true` if the current process is running as superuser (root).
#[must_use]
pub fn is_superuser() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Returns `true` if the system uses systemd (detects `/run/systemd/system`).
#[must_use]
pub fn is_systemd() -> bool {
    Path::new("/run/systemd/system").exists()
}

/// Returns `true` if `program` resolves to an executable somewhere on `PATH`.
#[must_use]
pub fn is_on_path(program: &str) -> bool {
    std::env::var_os("PATH").is_some_and(|paths| {
        std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    })
}
