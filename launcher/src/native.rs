//! Host OS integration: privileges, process management, firewall and installation.

use std::{
    env,
    ffi::OsString,
    fs,
    io::{self, ErrorKind, IsTerminal as _},
    path::{Path, PathBuf},
    process::Stdio,
};

use futures::{FutureExt as _, future::BoxFuture};
use launcher_common::{is_on_path, is_superuser};
#[cfg(target_os = "linux")]
use launcher_common::is_systemd;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};
use thiserror::Error as ThisError;
use tokio::{process::Command, task};
use tracing::{debug, info, warn};

use crate::config::APP_NAME;

/// systemd unit registered by `install`.
const SERVICE_FILE_TEMPLATE: &str = include_str!("node_launcher.service.ini");

#[derive(Debug, ThisError)]
pub enum NativeError {
    #[error("{0} requires root privileges")]
    NotElevated(&'static str),
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{program}` exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("{0}")]
    Install(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything the launcher needs from the operating system.
pub trait NativeOs: Send + Sync {
    /// Whether this process runs with root privileges.
    fn is_elevated(&self) -> bool;

    /// Starts a privileged copy of this executable with `args` and returns without
    /// waiting for it.
    ///
    /// # Errors
    ///
    /// Returns an error if neither `sudo` nor `pkexec` could be spawned.
    fn relaunch_elevated(&self, args: &[OsString]) -> Result<(), NativeError>;

    /// Starts `exe` with `args` and returns without waiting. `exe` must be a path
    /// resolved before the executable was replaced.
    ///
    /// # Errors
    ///
    /// Returns an error if the executable could not be spawned.
    fn relaunch(&self, exe: &Path, args: &[OsString]) -> Result<(), NativeError>;

    /// Terminates other running launcher processes. None running is success.
    fn kill_previous_launcher(&self) -> BoxFuture<'_, Result<(), NativeError>>;

    /// Opens `ports` (`port/proto`) in the host firewall. Idempotent.
    fn install_firewall_rules<'a>(
        &'a self,
        ports: &'a [String],
    ) -> BoxFuture<'a, Result<(), NativeError>>;

    /// Installs this executable and registers it to start on boot. Returns the installed
    /// binary's path.
    fn install_binary(&self) -> BoxFuture<'_, Result<PathBuf, NativeError>>;

    /// Reverts [`NativeOs::install_binary`]. Missing pieces are skipped.
    fn uninstall_binary(&self) -> BoxFuture<'_, Result<(), NativeError>>;
}

/// Host firewall front ends, in order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FirewallTool {
    Ufw,
    FirewallCmd,
}

impl FirewallTool {
    fn detect() -> Option<Self> {
        if is_on_path("ufw") {
            Some(Self::Ufw)
        } else if is_on_path("firewall-cmd") {
            Some(Self::FirewallCmd)
        } else {
            None
        }
    }

    /// The invocations opening `ports`, as `(program, args)`.
    fn commands(self, ports: &[String]) -> Vec<(&'static str, Vec<String>)> {
        match self {
            Self::Ufw => ports
                .iter()
                .map(|port| ("ufw", vec!["allow".to_owned(), port.clone()]))
                .collect(),
            Self::FirewallCmd => {
                let mut commands: Vec<_> = ports
                    .iter()
                    .map(|port| {
                        (
                            "firewall-cmd",
                            vec!["--permanent".to_owned(), format!("--add-port={port}")],
                        )
                    })
                    .collect();
                commands.push(("firewall-cmd", vec!["--reload".to_owned()]));
                commands
            }
        }
    }
}

/// Extracts the pids from `pgrep` output, leaving out `own_pid`.
fn other_pids(pgrep_output: &str, own_pid: u32) -> Vec<i32> {
    pgrep_output
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .filter(|&pid| pid != own_pid)
        .filter_map(|pid| i32::try_from(pid).ok())
        .collect()
}

fn render_unit(binary: &str, config_path: &Path) -> String {
    SERVICE_FILE_TEMPLATE
        .replace("{description}", env!("CARGO_PKG_DESCRIPTION"))
        .replace("{config}", &config_path.to_string_lossy())
        .replace("{binary}", binary)
}

async fn run(program: &str, args: &[String]) -> Result<String, NativeError> {
    debug!(program, ?args, "Running");
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| NativeError::Spawn {
            program: program.to_owned(),
            source,
        })?;
    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }
    Err(NativeError::CommandFailed {
        program: program.to_owned(),
        code: output.status.code(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    })
}

fn spawn_detached(program: &Path, args: &[OsString]) -> Result<(), NativeError> {
    debug!(?program, ?args, "Spawning detached");
    // the child outlives this process; the runtime reaps it if we are still around
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .spawn()
        .map(drop)
        .map_err(|source| NativeError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })
}

/// [`NativeOs`] for Linux and other Unix hosts.
#[derive(Debug, Clone)]
pub struct UnixNative {
    config_path: PathBuf,
    install_dir: PathBuf,
}

impl UnixNative {
    /// `config_path` is baked into the service unit so the installed launcher reads the
    /// same configuration.
    #[must_use]
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            install_dir: PathBuf::from("/usr/local/bin"),
        }
    }

    fn require_elevation(&self, operation: &'static str) -> Result<(), NativeError> {
        if self.is_elevated() {
            Ok(())
        } else {
            Err(NativeError::NotElevated(operation))
        }
    }
}

impl NativeOs for UnixNative {
    fn is_elevated(&self) -> bool {
        is_superuser()
    }

    fn relaunch_elevated(&self, args: &[OsString]) -> Result<(), NativeError> {
        let exe = env::current_exe()?;
        let mut elevated_args = Vec::with_capacity(args.len() + 2);
        // pkexec brings its own graphical prompt, sudo needs a terminal
        let elevator = if !io::stdin().is_terminal() && is_on_path("pkexec") {
            "pkexec"
        } else {
            elevated_args.push(OsString::from("-E"));
            "sudo"
        };
        elevated_args.push(exe.into_os_string());
        elevated_args.extend(args.iter().cloned());
        info!("Relaunching with {elevator} to finish setup");
        spawn_detached(Path::new(elevator), &elevated_args)
    }

    fn relaunch(&self, exe: &Path, args: &[OsString]) -> Result<(), NativeError> {
        info!("Relaunching {}", exe.display());
        spawn_detached(exe, args)
    }

    fn kill_previous_launcher(&self) -> BoxFuture<'_, Result<(), NativeError>> {
        async move {
            let output = match run("pgrep", &["-x".to_owned(), APP_NAME.to_owned()]).await {
                Ok(output) => output,
                // no process matched
                Err(NativeError::CommandFailed { code: Some(1), .. }) => return Ok(()),
                Err(e) => return Err(e),
            };
            for pid in other_pids(&output, std::process::id()) {
                match signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
                    Ok(()) => info!(pid, "Terminated previous launcher"),
                    Err(e) => warn!(pid, "Failed to terminate previous launcher: {e}"),
                }
            }
            Ok(())
        }
        .boxed()
    }

    fn install_firewall_rules<'a>(
        &'a self,
        ports: &'a [String],
    ) -> BoxFuture<'a, Result<(), NativeError>> {
        async move {
            self.require_elevation("Installing firewall rules")?;
            let Some(tool) = FirewallTool::detect() else {
                warn!("Neither ufw nor firewall-cmd found, leaving the firewall untouched");
                return Ok(());
            };
            for (program, args) in tool.commands(ports) {
                run(program, &args).await?;
            }
            info!(?ports, "Firewall rules installed");
            Ok(())
        }
        .boxed()
    }

    fn install_binary(&self) -> BoxFuture<'_, Result<PathBuf, NativeError>> {
        async move {
            self.require_elevation("Installing the launcher")?;
            let install_dir = self.install_dir.clone();
            let config_path = self.config_path.clone();
            task::spawn_blocking(move || install_blocking(&install_dir, &config_path))
                .await
                .map_err(|e| NativeError::Install(e.to_string()))?
        }
        .boxed()
    }

    fn uninstall_binary(&self) -> BoxFuture<'_, Result<(), NativeError>> {
        async move {
            self.require_elevation("Uninstalling the launcher")?;
            let install_dir = self.install_dir.clone();
            task::spawn_blocking(move || uninstall_blocking(&install_dir))
                .await
                .map_err(|e| NativeError::Install(e.to_string()))?
        }
        .boxed()
    }
}

#[cfg(target_os = "linux")]
fn install_blocking(install_dir: &Path, config_path: &Path) -> Result<PathBuf, NativeError> {
    use launcher_common::systemd;

    if is_systemd() {
        let unit = render_unit("{binary}", config_path);
        let binary = systemd::install_self_as_service(APP_NAME, &unit, install_dir)
            .map_err(NativeError::Install)?;
        systemd::start_and_enable_self_as_service(APP_NAME).map_err(NativeError::Install)?;
        return Ok(binary);
    }
    copy_self(install_dir)
}

#[cfg(not(target_os = "linux"))]
fn install_blocking(install_dir: &Path, _config_path: &Path) -> Result<PathBuf, NativeError> {
    copy_self(install_dir)
}

/// Installs only the binary, for hosts without a supported service manager.
fn copy_self(install_dir: &Path) -> Result<PathBuf, NativeError> {
    use std::os::unix::fs::PermissionsExt as _;

    let exe = env::current_exe()?;
    let target = install_dir.join(APP_NAME);
    if exe != target {
        fs::create_dir_all(install_dir)?;
        fs::copy(&exe, &target)?;
        fs::set_permissions(&target, fs::Permissions::from_mode(0o755))?;
    }
    warn!(
        "No service manager found; installed {} but it will not start on boot",
        target.display()
    );
    Ok(target)
}

#[cfg(target_os = "linux")]
fn uninstall_blocking(install_dir: &Path) -> Result<(), NativeError> {
    if is_systemd() {
        return launcher_common::systemd::uninstall_self_as_service(APP_NAME, install_dir)
            .map_err(NativeError::Install);
    }
    remove_binary(install_dir)
}

#[cfg(not(target_os = "linux"))]
fn uninstall_blocking(install_dir: &Path) -> Result<(), NativeError> {
    remove_binary(install_dir)
}

fn remove_binary(install_dir: &Path) -> Result<(), NativeError> {
    let target = install_dir.join(APP_NAME);
    match fs::remove_file(&target) {
        Ok(()) => {
            info!("Removed {}", target.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
