//! Command-line interface definitions for the launcher.
//!
//! This module contains the CLI argument parsing structures and enums
//! used by the launcher binary.

use std::{ffi::OsString, path::PathBuf};

use clap::{Args, Parser, Subcommand, ValueEnum};

/// Top-level command-line interface definition.
#[derive(Debug, Parser)]
#[command(name = env!("CARGO_PKG_NAME"))]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Cli {
    /// One-shot command; without one the launcher starts supervising the node.
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub options: GlobalOptions,
}

/// One-shot commands. Each runs its action and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Install the launcher binary and register it as a service.
    Install,

    /// Stop a running launcher, remove the binary and the node container.
    Uninstall,

    /// Ask a running launcher to stop the node and exit.
    Stop,

    /// Open the node's ports in the host firewall.
    InstallFirewall,
}

/// Modifiers accepted together with any command.
#[derive(Debug, Clone, Args)]
pub struct GlobalOptions {
    /// Log at debug level, echo logs to the console and wait for Enter before exiting.
    #[arg(long, global = true)]
    pub debug: bool,

    /// Started by the system on login/boot: exit right away unless auto start is enabled.
    #[arg(long, global = true)]
    pub autorun: bool,

    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "NODE_LAUNCHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,
}

impl GlobalOptions {
    /// Arguments that make a relaunched process continue with the same settings.
    ///
    /// `--autorun` is dropped on purpose: a relaunch always continues an already
    /// decided start.
    #[must_use]
    pub fn relaunch_args(&self) -> Vec<OsString> {
        let mut args = Vec::new();
        if let Some(ref config) = self.config {
            args.push(OsString::from("--config"));
            args.push(config.clone().into_os_string());
        }
        if self.debug {
            args.push(OsString::from("--debug"));
        }
        if let Some(format) = self.log_format.to_possible_value() {
            args.push(OsString::from("--log-format"));
            args.push(OsString::from(format.get_name()));
        }
        args
    }
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}
