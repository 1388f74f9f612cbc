//! Common utilities for integration tests: scratch directories with a launcher config
//! and helpers to run the launcher binary against them.

use std::{
    env, fs,
    path::{Path, PathBuf},
    process::{self, Output},
};

use tokio::process::Command;

pub(crate) const fn launcher_bin_path() -> &'static str {
    env!("CARGO_BIN_EXE_node_launcher")
}

/// A temp directory holding a config file whose socket path points inside it.
pub(crate) struct Scratch {
    dir: PathBuf,
}

impl Scratch {
    /// Creates the directory and writes `extra_toml` plus the socket path as config.
    /// `extra_toml` must only contain top-level keys and complete sections.
    pub(crate) fn new(name: &str, extra_toml: &str) -> Self {
        let dir = env::temp_dir().join(format!("launcher_it_{name}_{}", process::id()));
        drop(fs::remove_dir_all(&dir));
        fs::create_dir_all(&dir).unwrap();
        let scratch = Self { dir };
        let config = format!(
            "{extra_toml}\n[ipc]\nsocket_path = \"{}\"\n",
            scratch.socket_path().display()
        );
        fs::write(scratch.config_path(), config).unwrap();
        scratch
    }

    /// Replaces the config file with `toml` as is.
    pub(crate) fn overwrite_config(&self, toml: &str) {
        fs::write(self.config_path(), toml).unwrap();
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        self.dir.join("config.toml")
    }

    pub(crate) fn socket_path(&self) -> PathBuf {
        self.dir.join("launcher.sock")
    }

    pub(crate) fn data_dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        drop(fs::remove_dir_all(&self.dir));
    }
}

/// Runs the launcher binary with `args` and the scratch config, keeping its data
/// (logs, staged updates) inside the scratch directory.
pub(crate) async fn run_launcher(scratch: &Scratch, args: &[&str]) -> Output {
    Command::new(launcher_bin_path())
        .args(args)
        .arg("--config")
        .arg(scratch.config_path())
        .env("XDG_DATA_HOME", scratch.data_dir())
        .env_remove("NODE_LAUNCHER_CONFIG")
        .output()
        .await
        .unwrap()
}
