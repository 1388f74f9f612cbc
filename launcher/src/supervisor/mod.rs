//! Node container supervision.
//!
//! [`ContainerSupervisor`] is the seam between the lifecycle controller and the
//! container runtime. The only implementation drives the runtime's CLI; tests and
//! the controller's unit tests substitute their own.

mod cli_runtime;

use alloc::sync::Arc;
use core::time::Duration;
use std::{collections::BTreeMap, io, path::PathBuf};

use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error as ThisError;

pub use cli_runtime::CliRuntime;

use crate::config::{NodeConfig, SupervisorConfig};

/// Everything needed to create the node container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub ports: Vec<String>,
    pub volumes: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cap_add: Vec<String>,
    pub restart_policy: String,
    /// Arguments for the image's entrypoint.
    pub command: Vec<String>,
}

impl From<&NodeConfig> for ContainerSpec {
    fn from(node: &NodeConfig) -> Self {
        Self {
            image: node.image.clone(),
            name: node.container_name.clone(),
            ports: node.ports.clone(),
            volumes: node.volumes.clone(),
            env: node.env.clone(),
            cap_add: node.cap_add.clone(),
            restart_policy: node.restart_policy.clone(),
            command: node.command.clone(),
        }
    }
}

/// Observed state of the node container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerStatus {
    pub exists: bool,
    pub running: bool,
    /// Registry digest (`sha256:...`) of the image the container runs, if the image was
    /// pulled from a registry.
    pub image_digest: Option<String>,
}

#[derive(Debug, ThisError)]
pub enum SupervisorError {
    #[error("container runtime `{0}` is not installed")]
    RuntimeMissing(PathBuf),
    #[error("container runtime daemon is unreachable: {0}")]
    DaemonUnreachable(String),
    #[error("not permitted to use the container runtime: {0}")]
    PermissionDenied(String),
    #[error("`{args}` failed: {stderr}")]
    CommandFailed { args: String, stderr: String },
    #[error("`{args}` did not finish within {timeout:?}")]
    Timeout { args: String, timeout: Duration },
    #[error("failed to run the container runtime: {0}")]
    Io(#[from] io::Error),
}

impl SupervisorError {
    /// Whether the runtime itself is unusable, as opposed to a single command failing.
    #[must_use]
    pub const fn runtime_unavailable(&self) -> bool {
        matches!(
            self,
            Self::RuntimeMissing(_) | Self::DaemonUnreachable(_) | Self::PermissionDenied(_)
        )
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// Keeps the node container in the desired state.
///
/// All operations are idempotent.
pub trait ContainerSupervisor: Send + Sync {
    /// Running container: nothing to do. Stopped container: start it. No container:
    /// pull the image when `pull` is set, then create and start it.
    fn install_or_ensure_running<'a>(
        &'a self,
        spec: &'a ContainerSpec,
        pull: bool,
    ) -> BoxFuture<'a, SupervisorResult<()>>;

    /// Force-removes the container. An absent container counts as removed.
    fn uninstall_container(&self) -> BoxFuture<'_, SupervisorResult<()>>;

    /// Stops the container but keeps it. An absent container counts as stopped.
    fn stop_container(&self) -> BoxFuture<'_, SupervisorResult<()>>;

    /// Inspects the container and the image it runs.
    fn status(&self) -> BoxFuture<'_, SupervisorResult<ContainerStatus>>;
}

/// The runtime CLI supervisor described by `config`, managing `container_name`.
#[must_use]
pub fn from_config(config: &SupervisorConfig, container_name: &str) -> Arc<dyn ContainerSupervisor> {
    Arc::new(CliRuntime::new(
        config
            .program
            .clone()
            .unwrap_or_else(|| PathBuf::from(config.runtime.program())),
        container_name,
        Duration::from_secs(config.command_timeout_secs),
    ))
}
