//! One-shot commands: run one action and exit.

use core::time::Duration;
use std::path::Path;

use eyre::{WrapErr as _, bail};
use tokio::time::{self, Instant};
use tracing::{info, warn};

use crate::{
    cli::Command,
    config::{self, LauncherConfig},
    ipc::{self, StopOutcome},
    native::{NativeOs, UnixNative},
    supervisor,
};

/// Runs `command` against the host.
///
/// # Errors
///
/// Returns an error if `install` or `install-firewall` fail. `uninstall` and `stop`
/// report problems but always succeed.
pub async fn run(command: Command, config: &LauncherConfig, config_path: &Path) -> eyre::Result<()> {
    let native = UnixNative::new(config_path.to_path_buf());
    match command {
        Command::Install => install(&native).await,
        Command::Uninstall => {
            uninstall(&native, config, config_path).await;
            Ok(())
        }
        Command::Stop => {
            stop(config).await;
            Ok(())
        }
        Command::InstallFirewall => native
            .install_firewall_rules(&config.node.firewall_ports)
            .await
            .wrap_err("Failed to install firewall rules"),
    }
}

async fn install(native: &dyn NativeOs) -> eyre::Result<()> {
    if !native.is_elevated() {
        bail!("Installing requires root, run it with sudo");
    }
    let installed = native
        .install_binary()
        .await
        .wrap_err("Failed to install the launcher")?;
    println!("Installed launcher to {}", installed.display());
    Ok(())
}

/// Asks a running launcher to stop and waits for its confirmation, but never returns
/// before the configured grace period passed.
async fn stop(config: &LauncherConfig) {
    let grace = Duration::from_secs(config.stop_grace_secs);
    let started = Instant::now();
    let outcome = ipc::send_stop_app(&config.ipc.socket_path, grace).await;
    time::sleep_until(started + grace).await;
    match outcome {
        StopOutcome::NotRunning => println!("No running launcher found"),
        StopOutcome::Stopped => println!("Launcher stopped"),
        StopOutcome::Unconfirmed => {
            println!("Stop requested, the launcher did not confirm within {grace:?}");
        }
    }
}

/// Removes every trace of the launcher. Each step runs even if an earlier one failed.
async fn uninstall(native: &dyn NativeOs, config: &LauncherConfig, config_path: &Path) {
    let grace = Duration::from_secs(config.stop_grace_secs);
    let outcome = ipc::send_stop_app(&config.ipc.socket_path, grace).await;
    info!(?outcome, "Stop request before uninstall");

    if let Err(e) = native.uninstall_binary().await {
        eprintln!("Failed to uninstall the launcher: {e}");
    }
    if let Err(e) = native.kill_previous_launcher().await {
        eprintln!("Failed to terminate running launchers: {e}");
    }
    let supervisor = supervisor::from_config(&config.supervisor, &config.node.container_name);
    if let Err(e) = supervisor.uninstall_container().await {
        eprintln!("Failed to remove the node container: {e}");
    }
    if let Err(e) = config::remove(config_path).await {
        warn!("{e:#}");
    }
    println!("Uninstalled");
}
