//! Uses the single integration test approach.
//!
//! Drives the built launcher binary and `inner_main` against temp configs and sockets.
#![expect(
    clippy::tests_outside_test_module,
    reason = "This is the integration test binary, so it's expected that tests are outside of a test module"
)]
#![expect(clippy::unwrap_used, reason = "Using unwrap in tests is fine")]

extern crate alloc;
extern crate core;

mod common;
mod lifecycle;

use core::time::Duration;
use std::{
    process::{self, Stdio},
    time::Instant,
};

use clap::Parser as _;
use launcher_core::cli::Cli;
use tokio::{io::AsyncWriteExt as _, process::Command};

use common::{Scratch, run_launcher};

#[tokio::test]
async fn stop_without_running_launcher_waits_for_grace() {
    let scratch = Scratch::new("stop_idle", "stop_grace_secs = 1\n");

    let started = Instant::now();
    let output = run_launcher(&scratch, &["stop"]).await;

    assert!(output.status.success(), "{output:?}");
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(
        String::from_utf8_lossy(&output.stdout).contains("No running launcher found"),
        "{output:?}"
    );
}

#[tokio::test]
async fn autorun_respects_disabled_auto_start() {
    let scratch = Scratch::new("autorun", "auto_start = false\ninitial_state = \"stage1\"\n");

    let cli = Cli::parse_from([
        "node_launcher",
        "--autorun",
        "--config",
        scratch.config_path().to_str().unwrap(),
    ]);
    launcher_core::inner_main(cli).await.unwrap();

    // nothing was set up, so the socket never existed
    assert!(!scratch.socket_path().exists());
}

#[tokio::test]
async fn debug_failure_still_waits_for_enter() {
    let scratch = Scratch::new("debug_failure", "");
    // the socket directory does not exist, so claiming the singleton fails
    scratch.overwrite_config(&format!(
        "initial_state = \"running\"\n[ipc]\nsocket_path = \"{}\"\n",
        scratch.data_dir().join("missing").join("launcher.sock").display()
    ));

    let mut child = Command::new(common::launcher_bin_path())
        .arg("--debug")
        .arg("--config")
        .arg(scratch.config_path())
        .env("XDG_DATA_HOME", scratch.data_dir())
        .env_remove("NODE_LAUNCHER_CONFIG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"\n").await.unwrap();
    drop(stdin);
    let output = child.wait_with_output().await.unwrap();

    assert!(!output.status.success(), "{output:?}");
    assert!(
        String::from_utf8_lossy(&output.stdout).contains("Press 'Enter' to continue"),
        "{output:?}"
    );
}

#[test]
fn unknown_command_is_rejected() {
    let output = process::Command::new(env!("CARGO_BIN_EXE_node_launcher"))
        .arg("reboot")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
