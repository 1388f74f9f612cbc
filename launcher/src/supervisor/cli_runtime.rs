//! [`ContainerSupervisor`] on top of the `docker`/`podman` command line.

use core::time::Duration;
use std::{
    io::ErrorKind,
    path::PathBuf,
    process::Stdio,
};

use futures::{FutureExt as _, future::BoxFuture};
use tokio::{process::Command, time};
use tracing::{debug, info};

use super::{ContainerSpec, ContainerStatus, ContainerSupervisor, SupervisorError, SupervisorResult};

/// Drives one named container through the runtime CLI. Both docker and podman accept
/// the same subset of commands used here.
#[derive(Debug, Clone)]
pub struct CliRuntime {
    program: PathBuf,
    container: String,
    timeout: Duration,
}

/// Maps a failed invocation's stderr to an error kind.
fn classify_failure(args: String, stderr: String) -> SupervisorError {
    let lower = stderr.to_lowercase();
    if lower.contains("cannot connect to the docker daemon")
        || lower.contains("is the docker daemon running")
        || lower.contains("failed to connect to the docker api")
        || lower.contains("error during connect")
        || lower.contains("unable to connect to podman")
    {
        return SupervisorError::DaemonUnreachable(stderr);
    }
    if lower.contains("permission denied") {
        return SupervisorError::PermissionDenied(stderr);
    }
    SupervisorError::CommandFailed { args, stderr }
}

/// Whether the runtime reported that the container (or object) does not exist.
fn is_missing(error: &SupervisorError) -> bool {
    match *error {
        SupervisorError::CommandFailed { ref stderr, .. } => {
            let lower = stderr.to_lowercase();
            lower.contains("no such container")
                || lower.contains("no such object")
                || lower.contains("no container with name or id")
        }
        _ => false,
    }
}

/// Extracts `sha256:...` from the first `repo@sha256:...` entry.
fn parse_repo_digest(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .find_map(|entry| entry.split_once('@'))
        .map(|(_, digest)| digest.to_owned())
}

fn run_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_owned(),
        "-d".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
    ];
    if !spec.restart_policy.is_empty() {
        args.extend(["--restart".to_owned(), spec.restart_policy.clone()]);
    }
    for cap in &spec.cap_add {
        args.extend(["--cap-add".to_owned(), cap.clone()]);
    }
    for port in &spec.ports {
        args.extend(["-p".to_owned(), port.clone()]);
    }
    for volume in &spec.volumes {
        args.extend(["-v".to_owned(), volume.clone()]);
    }
    for (key, value) in &spec.env {
        args.extend(["-e".to_owned(), format!("{key}={value}")]);
    }
    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

impl CliRuntime {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, container: &str, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            container: container.to_owned(),
            timeout,
        }
    }

    /// Runs the runtime with `args` and returns its stdout.
    async fn run<S: AsRef<str>>(&self, args: &[S]) -> SupervisorResult<String> {
        let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
        let rendered = args.join(" ");
        debug!(program = ?self.program, args = %rendered, "Running container runtime");

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match time::timeout(self.timeout, command.output()).await {
            Err(_) => {
                return Err(SupervisorError::Timeout {
                    args: rendered,
                    timeout: self.timeout,
                });
            }
            Ok(Err(e)) if e.kind() == ErrorKind::NotFound => {
                return Err(SupervisorError::RuntimeMissing(self.program.clone()));
            }
            Ok(Err(e)) if e.kind() == ErrorKind::PermissionDenied => {
                return Err(SupervisorError::PermissionDenied(e.to_string()));
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(output)) => output,
        };

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        Err(classify_failure(rendered, stderr))
    }

    /// `Some((running, image id))`, or `None` when the container does not exist.
    async fn inspect(&self) -> SupervisorResult<Option<(bool, String)>> {
        let result = self
            .run(&[
                "container",
                "inspect",
                "--format",
                "{{.State.Running}}|{{.Image}}",
                self.container.as_str(),
            ])
            .await;
        match result {
            Ok(output) => {
                let (running, image) = output.trim().split_once('|').unwrap_or((output.trim(), ""));
                Ok(Some((running == "true", image.to_owned())))
            }
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn repo_digest(&self, image_id: &str) -> Option<String> {
        if image_id.is_empty() {
            return None;
        }
        match self
            .run(&[
                "image",
                "inspect",
                "--format",
                "{{range .RepoDigests}}{{.}} {{end}}",
                image_id,
            ])
            .await
        {
            Ok(output) => parse_repo_digest(&output),
            Err(e) => {
                debug!("No repo digest for image {image_id}: {e}");
                None
            }
        }
    }

    async fn ensure_running(&self, spec: &ContainerSpec, pull: bool) -> SupervisorResult<()> {
        match self.inspect().await? {
            Some((true, _)) => {
                debug!(container = %self.container, "Container already running");
                Ok(())
            }
            Some((false, _)) => {
                info!(container = %self.container, "Starting stopped container");
                self.run(&["start", self.container.as_str()]).await.map(drop)
            }
            None => {
                if pull {
                    info!(image = %spec.image, "Pulling node image");
                    self.run(&["pull", spec.image.as_str()]).await?;
                }
                info!(container = %spec.name, image = %spec.image, "Creating node container");
                self.run(&run_args(spec)).await.map(drop)
            }
        }
    }

    /// Runs `args`, treating a missing container as success.
    async fn run_tolerating_missing(&self, args: &[&str]) -> SupervisorResult<()> {
        match self.run(args).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => {
                debug!(container = %self.container, "Container does not exist");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl ContainerSupervisor for CliRuntime {
    fn install_or_ensure_running<'a>(
        &'a self,
        spec: &'a ContainerSpec,
        pull: bool,
    ) -> BoxFuture<'a, SupervisorResult<()>> {
        self.ensure_running(spec, pull).boxed()
    }

    fn uninstall_container(&self) -> BoxFuture<'_, SupervisorResult<()>> {
        async move {
            info!(container = %self.container, "Removing node container");
            self.run_tolerating_missing(&["rm", "-f", self.container.as_str()])
                .await
        }
        .boxed()
    }

    fn stop_container(&self) -> BoxFuture<'_, SupervisorResult<()>> {
        async move {
            info!(container = %self.container, "Stopping node container");
            self.run_tolerating_missing(&["stop", self.container.as_str()]).await
        }
        .boxed()
    }

    fn status(&self) -> BoxFuture<'_, SupervisorResult<ContainerStatus>> {
        async move {
            let Some((running, image_id)) = self.inspect().await? else {
                return Ok(ContainerStatus::default());
            };
            Ok(ContainerStatus {
                exists: true,
                running,
                image_digest: self.repo_digest(&image_id).await,
            })
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::{env, fs, os::unix::fs::PermissionsExt as _, path::Path};

    use super::*;
    use crate::config::NodeConfig;

    /// Writes an executable shell script standing in for the runtime CLI and returns its
    /// path. Every invocation's arguments are appended to `<dir>/calls`.
    fn fake_runtime(name: &str, body: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("launcher_rt_{name}_{}", std::process::id()));
        drop(fs::remove_dir_all(&dir));
        fs::create_dir_all(&dir).unwrap();
        let script = dir.join("runtime");
        let calls = dir.join("calls");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> \"{}\"\n{body}\n", calls.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        script
    }

    /// A runtime that keeps the container's running flag in `<dir>/state`.
    fn stateful_runtime(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("launcher_rt_{name}_{}", std::process::id()));
        let state = dir.join("state");
        let body = format!(
            r#"STATE="{}"
case "$1" in
  container)
    [ -f "$STATE" ] || {{ echo "Error: No such container: myst" >&2; exit 1; }}
    echo "$(cat "$STATE")|sha256:imageid" ;;
  image) echo "example/node@sha256:d1 " ;;
  pull) ;;
  run|start) echo true > "$STATE" ;;
  stop)
    [ -f "$STATE" ] || {{ echo "Error response from daemon: No such container: myst" >&2; exit 1; }}
    echo false > "$STATE" ;;
  rm)
    [ -f "$STATE" ] || {{ echo "Error: No such container: myst" >&2; exit 1; }}
    rm -f "$STATE" ;;
  *) echo "unknown command $1" >&2; exit 2 ;;
esac"#,
            state.display()
        );
        fake_runtime(name, &body)
    }

    fn calls(script: &Path) -> Vec<String> {
        let calls = script.with_file_name("calls");
        fs::read_to_string(calls)
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    fn runtime(program: PathBuf) -> CliRuntime {
        CliRuntime::new(program, "myst", Duration::from_secs(10))
    }

    fn spec() -> ContainerSpec {
        ContainerSpec::from(&NodeConfig::default())
    }

    #[test]
    fn run_args_cover_the_spec() {
        let mut spec = spec();
        spec.env.insert("A".to_owned(), "1".to_owned());
        let args = run_args(&spec).join(" ");
        assert_eq!(
            args,
            "run -d --name myst --restart unless-stopped --cap-add NET_ADMIN -p 4449:4449 \
             -v myst-data:/var/lib/mysterium-node -e A=1 mysteriumnetwork/myst:latest \
             service --agreed-terms-and-conditions"
        );
    }

    #[test]
    fn stderr_is_classified() {
        assert!(matches!(
            classify_failure(
                "ps".to_owned(),
                "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?".to_owned()
            ),
            SupervisorError::DaemonUnreachable(_)
        ));
        assert!(matches!(
            classify_failure(
                "ps".to_owned(),
                "permission denied while trying to connect to the Docker daemon socket".to_owned()
            ),
            SupervisorError::PermissionDenied(_)
        ));
        let missing = classify_failure("rm myst".to_owned(), "Error: No such container: myst".to_owned());
        assert!(is_missing(&missing));
    }

    #[test]
    fn repo_digest_is_taken_from_first_entry() {
        assert_eq!(
            parse_repo_digest("mysteriumnetwork/myst@sha256:abc other/repo@sha256:def \n"),
            Some("sha256:abc".to_owned())
        );
        assert_eq!(parse_repo_digest("\n"), None);
    }

    #[tokio::test]
    async fn ensure_running_creates_once() {
        let script = stateful_runtime("create");
        let rt = runtime(script.clone());

        rt.install_or_ensure_running(&spec(), true).await.unwrap();
        rt.install_or_ensure_running(&spec(), true).await.unwrap();

        let calls = calls(&script);
        assert_eq!(calls.iter().filter(|c| c.starts_with("pull ")).count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("run ")).count(), 1);
        let status = rt.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.image_digest.as_deref(), Some("sha256:d1"));
    }

    #[tokio::test]
    async fn stopped_container_is_started() {
        let script = stateful_runtime("restart");
        let rt = runtime(script.clone());
        rt.install_or_ensure_running(&spec(), false).await.unwrap();
        rt.stop_container().await.unwrap();
        assert!(!rt.status().await.unwrap().running);

        rt.install_or_ensure_running(&spec(), false).await.unwrap();
        assert!(calls(&script).iter().any(|c| c == "start myst"));
        assert!(rt.status().await.unwrap().running);
    }

    #[tokio::test]
    async fn uninstall_is_idempotent() {
        let script = stateful_runtime("uninstall");
        let rt = runtime(script);
        rt.install_or_ensure_running(&spec(), false).await.unwrap();

        rt.uninstall_container().await.unwrap();
        rt.uninstall_container().await.unwrap();
        rt.stop_container().await.unwrap();
        assert_eq!(rt.status().await.unwrap(), ContainerStatus::default());
    }

    #[tokio::test]
    async fn unreachable_daemon_is_reported() {
        let script = fake_runtime(
            "daemon_down",
            "echo 'Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?' >&2\nexit 1",
        );
        let rt = runtime(script);
        assert!(matches!(
            rt.uninstall_container().await,
            Err(SupervisorError::DaemonUnreachable(_))
        ));
        assert!(matches!(
            rt.status().await,
            Err(SupervisorError::DaemonUnreachable(_))
        ));
    }

    #[tokio::test]
    async fn missing_binary_is_reported() {
        let rt = runtime(env::temp_dir().join("launcher_no_such_runtime"));
        assert!(matches!(
            rt.uninstall_container().await,
            Err(SupervisorError::RuntimeMissing(_))
        ));
    }

    #[tokio::test]
    async fn slow_runtime_times_out() {
        let script = fake_runtime("slow", "sleep 5");
        let rt = CliRuntime::new(script, "myst", Duration::from_millis(200));
        assert!(matches!(
            rt.status().await,
            Err(SupervisorError::Timeout { .. })
        ));
    }
}
