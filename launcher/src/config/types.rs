//! Configuration data types for the launcher.
//!
//! Every field carries a serde default, so an empty or partial file is a valid
//! configuration.

use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

/// Name used for the installed binary, service, config and data directories.
pub const APP_NAME: &str = "node_launcher";

/// The lifecycle stage the next start resumes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialState {
    /// Fresh install: elevated initial setup is still pending.
    #[default]
    Stage1,
    /// Initial setup done, elevated continuation pending.
    Stage2,
    /// Setup complete; start straight into supervision.
    Running,
}

impl InitialState {
    /// Whether the stage's logic may only run in an elevated process.
    #[must_use]
    pub const fn needs_elevation(self) -> bool {
        matches!(self, Self::Stage1 | Self::Stage2)
    }
}

/// Accepts any value for `initial_state` and falls back to the default for anything
/// that is not a known stage name.
fn lenient_initial_state<'de, D>(deserializer: D) -> Result<InitialState, D::Error>
where
    D: Deserializer<'de>,
{
    let value = toml::Value::deserialize(deserializer)?;
    Ok(match value.as_str() {
        Some("stage2") => InitialState::Stage2,
        Some("running") => InitialState::Running,
        _ => InitialState::Stage1,
    })
}

/// Persisted launcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Stage the next start resumes from.
    #[serde(deserialize_with = "lenient_initial_state")]
    pub initial_state: InitialState,
    /// Whether a start by the system (`--autorun`) should actually launch.
    pub auto_start: bool,
    /// Minimum time the `stop` command blocks, giving the runtime time to settle.
    pub stop_grace_secs: u64,
    pub node: NodeConfig,
    pub registry: RegistryConfig,
    pub supervisor: SupervisorConfig,
    pub update: UpdateConfig,
    pub ipc: IpcConfig,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            initial_state: InitialState::default(),
            auto_start: true,
            stop_grace_secs: 10,
            node: NodeConfig::default(),
            registry: RegistryConfig::default(),
            supervisor: SupervisorConfig::default(),
            update: UpdateConfig::default(),
            ipc: IpcConfig::default(),
        }
    }
}

/// The node workload container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Image reference, including the tag that is followed for updates.
    pub image: String,
    pub container_name: String,
    /// `host:container[/proto]` publish specs.
    pub ports: Vec<String>,
    /// `source:target` volume specs.
    pub volumes: Vec<String>,
    pub cap_add: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub restart_policy: String,
    /// Arguments passed to the image's entrypoint.
    pub command: Vec<String>,
    /// `port/proto` entries opened by `install-firewall` and initial setup.
    pub firewall_ports: Vec<String>,
    /// Recreate the container from a fresh pull whenever the registry reports it outdated.
    pub auto_upgrade: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            image: "mysteriumnetwork/myst:latest".to_owned(),
            container_name: "myst".to_owned(),
            ports: vec!["4449:4449".to_owned()],
            volumes: vec!["myst-data:/var/lib/mysterium-node".to_owned()],
            cap_add: vec!["NET_ADMIN".to_owned()],
            env: BTreeMap::new(),
            restart_policy: "unless-stopped".to_owned(),
            command: vec![
                "service".to_owned(),
                "--agreed-terms-and-conditions".to_owned(),
            ],
            firewall_ports: vec!["4449/tcp".to_owned()],
            auto_upgrade: false,
        }
    }
}

/// Where and how often the image registry is asked for new node versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Tag listing endpoint of the node image's repository.
    pub tags_url: String,
    pub page_size: u32,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tags_url: "https://registry.hub.docker.com/v2/repositories/mysteriumnetwork/myst/tags"
                .to_owned(),
            page_size: 10,
            poll_interval_secs: 600,
            timeout_secs: 10,
        }
    }
}

/// Supported container runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Podman,
}

impl RuntimeKind {
    /// Name of the runtime's CLI executable.
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// What happens to the container when the launcher is asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopPolicy {
    /// Force-remove the container.
    #[default]
    Uninstall,
    /// Stop it and keep it for the next start.
    Stop,
}

/// Container runtime access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub runtime: RuntimeKind,
    /// Overrides the runtime executable looked up on `PATH`.
    pub program: Option<PathBuf>,
    pub stop_policy: StopPolicy,
    /// Upper bound for any single runtime invocation.
    pub command_timeout_secs: u64,
    /// Pause between two successful reconciliations.
    pub reconcile_interval_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::default(),
            program: None,
            stop_policy: StopPolicy::default(),
            command_timeout_secs: 120,
            reconcile_interval_secs: 30,
        }
    }
}

/// Launcher self-update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// JSON manifest `{ version, url, sha256 }` describing the newest launcher build.
    /// Self-update is disabled when absent.
    pub manifest_url: Option<String>,
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            poll_interval_secs: 6 * 60 * 60,
            timeout_secs: 120,
        }
    }
}

/// Singleton channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Machine-wide socket path shared by elevated and unelevated instances.
    pub socket_path: PathBuf,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(format!("/tmp/{APP_NAME}.sock")),
        }
    }
}
