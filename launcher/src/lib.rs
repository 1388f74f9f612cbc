//! Library entry for the launcher.
//!
//! Exposes `inner_main` so a workspace-level shim binary and the integration tests can
//! call into the launcher logic.
//!
//! Either runs a one-shot command (install, uninstall, stop, install-firewall) or starts
//! the lifecycle controller that supervises the node container.
#![cfg_attr(
    test,
    expect(clippy::indexing_slicing, reason = "This is not problematic in tests",)
)]

extern crate alloc;
extern crate core;

pub mod cli;
pub mod config;
pub mod controller;
pub mod dispatch;
pub mod events;
pub mod ipc;
pub mod logging;
pub mod native;
pub mod oneshot;
pub mod registry;
pub mod supervisor;
pub mod update;

use std::{
    io::{self, BufRead as _, Write as _},
    path::PathBuf,
};

use eyre::{Result, WrapErr as _};
use launcher_common::product_version;
use tracing::info;

use cli::{Cli, GlobalOptions};
use config::LauncherConfig;
use controller::{AppController, LauncherContext};
use dispatch::Dispatch;
use events::EventBus;

/// The launcher's main function; can be called from a shim binary.
///
/// # Errors
///
/// Returns an error if a one-shot command fails or the controller cannot start.
pub async fn inner_main(invocation: Cli) -> Result<()> {
    let mut options = invocation.options.clone();
    let events = EventBus::default();
    let config_path = options
        .config
        .clone()
        .unwrap_or_else(config::default_config_path);
    // a relaunched process, possibly under another user's home, must read the same file
    options.config = Some(config_path.clone());

    logging::init(&options, &events, &config::data_dir());
    info!(
        version = %product_version(),
        pid = std::process::id(),
        ?config_path,
        "Starting {}",
        config::APP_NAME
    );

    let launcher_config = config::load_or_default(&config_path).await;

    let result = match dispatch::plan(
        invocation.command,
        options.autorun,
        launcher_config.auto_start,
    ) {
        Dispatch::OneShot(command) => oneshot::run(command, &launcher_config, &config_path).await,
        Dispatch::Skip => {
            info!("Started by autorun with auto_start disabled, exiting");
            Ok(())
        }
        Dispatch::Launch => launch(launcher_config, config_path, events, &options).await,
    };

    if options.debug {
        wait_for_enter();
    }

    result
}

async fn launch(
    launcher_config: LauncherConfig,
    config_path: PathBuf,
    events: EventBus,
    options: &GlobalOptions,
) -> Result<()> {
    let ctx = LauncherContext::new(launcher_config, config_path, events, options.relaunch_args())
        .wrap_err("Failed to set up the launcher")?;
    let outcome = AppController::new(ctx).run().await?;
    info!(?outcome, "Launcher finished");
    Ok(())
}

/// Keeps a debug console open until the user acknowledges the output.
fn wait_for_enter() {
    println!("Press 'Enter' to continue...");
    drop(io::stdout().flush());
    let mut line = String::new();
    drop(io::stdin().lock().read_line(&mut line));
}
