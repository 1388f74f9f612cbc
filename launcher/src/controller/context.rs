//! Everything the controller works with, owned in one place.

use alloc::sync::Arc;
use std::{ffi::OsString, path::PathBuf};

use eyre::WrapErr as _;

use crate::{
    config::{self, LauncherConfig},
    events::EventBus,
    native::{NativeOs, UnixNative},
    supervisor::{self, ContainerSupervisor},
    update::SelfUpdater,
};

/// The launcher's state and its seams to the outside world.
pub struct LauncherContext {
    /// Mutated only by the controller, persisted on every change.
    pub config: LauncherConfig,
    pub config_path: PathBuf,
    pub events: EventBus,
    pub supervisor: Arc<dyn ContainerSupervisor>,
    pub native: Arc<dyn NativeOs>,
    pub updater: SelfUpdater,
    pub http: reqwest::Client,
    /// Arguments that make a relaunched process continue this start.
    pub relaunch_args: Vec<OsString>,
}

impl LauncherContext {
    /// Builds the context with the real runtime CLI and host integration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the running executable
    /// cannot be located.
    pub fn new(
        config: LauncherConfig,
        config_path: PathBuf,
        events: EventBus,
        relaunch_args: Vec<OsString>,
    ) -> eyre::Result<Self> {
        let supervisor = supervisor::from_config(&config.supervisor, &config.node.container_name);
        let native = Arc::new(UnixNative::new(config_path.clone()));
        let updater = SelfUpdater::for_current_exe(&config::data_dir())
            .wrap_err("Failed to locate the launcher executable")?;
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .wrap_err("Failed to build HTTP client")?;
        Ok(Self {
            config,
            config_path,
            events,
            supervisor,
            native,
            updater,
            http,
            relaunch_args,
        })
    }
}
