//! Configuration loading and persisting utilities for the launcher.
//!
//! This module provides functions for reading, parsing and atomically
//! writing the configuration file, and for locating the launcher's directories.

use std::{
    env,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use eyre::WrapErr as _;
use tokio::fs;
use tracing::{info, warn};

use crate::config::{APP_NAME, LauncherConfig};

/// Reads and parses the launcher config from a TOML file.
///
/// # Arguments
///
/// * `path` - File path to the TOML configuration file.
///
/// # Errors
///
/// Returns an error if the config file cannot be read or parsed.
pub async fn load<P: AsRef<Path>>(path: P) -> eyre::Result<LauncherConfig> {
    let path_ref = path.as_ref();
    let content = fs::read_to_string(path_ref).await.wrap_err(format!(
        "Failed to read config file at: {}",
        path_ref.display()
    ))?;
    let config: LauncherConfig = toml::from_str(&content).wrap_err(format!(
        "Failed to parse config as TOML at: {}",
        path_ref.display()
    ))?;
    Ok(config)
}

/// Loads the config, falling back to the fresh-install defaults when the file is missing
/// or unusable.
pub async fn load_or_default<P: AsRef<Path>>(path: P) -> LauncherConfig {
    let path_ref = path.as_ref();
    match fs::try_exists(path_ref).await {
        Ok(true) => {}
        Ok(false) => {
            info!("No config at {}, starting with defaults", path_ref.display());
            return LauncherConfig::default();
        }
        Err(e) => warn!("Cannot check for config at {}: {e}", path_ref.display()),
    }
    match load(path_ref).await {
        Ok(config) => config,
        Err(e) => {
            warn!("{e:#}; starting with defaults");
            LauncherConfig::default()
        }
    }
}

/// Writes the config to `path`, creating parent directories as needed.
///
/// The content goes to a sibling temp file first and is renamed into place.
///
/// # Errors
///
/// Returns an error if serialization or any filesystem step fails.
pub async fn save<P: AsRef<Path>>(path: P, config: &LauncherConfig) -> eyre::Result<()> {
    let path_ref = path.as_ref();
    let content = toml::to_string_pretty(config).wrap_err("Failed to serialize config")?;

    if let Some(parent) = path_ref.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await.wrap_err(format!(
            "Failed to create config directory: {}",
            parent.display()
        ))?;
    }

    let mut tmp_name = path_ref.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    fs::write(&tmp_path, content)
        .await
        .wrap_err(format!("Failed to write {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path_ref)
        .await
        .wrap_err(format!("Failed to move config into place at {}", path_ref.display()))?;
    Ok(())
}

/// Removes the config file. A missing file counts as removed.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be deleted.
pub async fn remove<P: AsRef<Path>>(path: P) -> eyre::Result<()> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).wrap_err(format!("Failed to remove {}", path.as_ref().display())),
    }
}

/// `$XDG_CONFIG_HOME/node_launcher/config.toml`, or `~/.config/...` without XDG.
#[must_use]
pub fn default_config_path() -> PathBuf {
    base_dir("XDG_CONFIG_HOME", ".config")
        .join(APP_NAME)
        .join("config.toml")
}

/// `$XDG_DATA_HOME/node_launcher`, or `~/.local/share/...` without XDG. Holds the log file
/// and staged launcher updates.
#[must_use]
pub fn data_dir() -> PathBuf {
    base_dir("XDG_DATA_HOME", ".local/share").join(APP_NAME)
}

fn base_dir(xdg_var: &str, home_relative: &str) -> PathBuf {
    env::var_os(xdg_var)
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| env::var_os("HOME").map(|home| PathBuf::from(home).join(home_relative)))
        .unwrap_or_else(|| env::temp_dir().join(home_relative))
}

#[cfg(test)]
mod tests {
    use std::{env, fs};

    use super::*;
    use crate::config::{InitialState, RuntimeKind, StopPolicy};

    fn temp_config(name: &str, content: &str) -> PathBuf {
        let tmp = env::temp_dir().join(format!("launcher_{name}_{}.toml", std::process::id()));
        fs::write(&tmp, content).unwrap();
        tmp
    }

    #[tokio::test]
    async fn load_launcher_config_file() {
        let tmp = temp_config(
            "full",
            r#"
            initial_state = "running"
            auto_start = false
            stop_grace_secs = 3

            [node]
            image = "example/node:latest"
            container_name = "node"
            ports = ["1234:1234"]
            auto_upgrade = true

            [node.env]
            LOG_LEVEL = "debug"

            [supervisor]
            runtime = "podman"
            stop_policy = "stop"
        "#,
        );
        let cfg = load(&tmp).await.unwrap();
        assert_eq!(cfg.initial_state, InitialState::Running);
        assert!(!cfg.auto_start);
        assert_eq!(cfg.stop_grace_secs, 3);
        assert_eq!(cfg.node.image, "example/node:latest");
        assert_eq!(cfg.node.ports, vec!["1234:1234".to_owned()]);
        assert_eq!(cfg.node.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
        assert!(cfg.node.auto_upgrade);
        // untouched fields keep their defaults
        assert_eq!(cfg.node.restart_policy, "unless-stopped");
        assert_eq!(cfg.supervisor.runtime, RuntimeKind::Podman);
        assert_eq!(cfg.supervisor.stop_policy, StopPolicy::Stop);
        assert_eq!(cfg.registry.page_size, 10);
    }

    #[tokio::test]
    async fn unknown_stage_falls_back_to_stage1() {
        let tmp = temp_config("unknown_stage", "initial_state = \"stage42\"\nauto_start = false\n");
        let cfg = load(&tmp).await.unwrap();
        assert_eq!(cfg.initial_state, InitialState::Stage1);
        assert!(!cfg.auto_start, "other fields must survive a corrupt stage");

        let tmp = temp_config("numeric_stage", "initial_state = 7\n");
        let cfg = load(&tmp).await.unwrap();
        assert_eq!(cfg.initial_state, InitialState::Stage1);
    }

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let tmp = env::temp_dir().join("launcher_does_not_exist.toml");
        assert!(load(&tmp).await.is_err(), "Expected error for missing file");
        assert_eq!(load_or_default(&tmp).await, LauncherConfig::default());
    }

    #[tokio::test]
    async fn invalid_toml_yields_defaults() {
        let tmp = temp_config("invalid", "not valid toml [[[");
        assert!(load(&tmp).await.is_err(), "Expected error for invalid TOML");
        assert_eq!(load_or_default(&tmp).await, LauncherConfig::default());
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = env::temp_dir().join(format!("launcher_save_{}", std::process::id()));
        drop(fs::remove_dir_all(&dir));
        let path = dir.join("nested").join("config.toml");

        let mut cfg = LauncherConfig::default();
        cfg.initial_state = InitialState::Stage2;
        cfg.node.env.insert("KEY".to_owned(), "value".to_owned());
        save(&path, &cfg).await.unwrap();

        assert_eq!(load(&path).await.unwrap(), cfg);
        assert!(
            !dir.join("nested").join("config.toml.tmp").exists(),
            "temp file must be renamed away"
        );

        remove(&path).await.unwrap();
        remove(&path).await.unwrap();
        drop(fs::remove_dir_all(&dir));
    }
}
