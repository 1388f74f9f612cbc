//! Long-lived activities of the `Running` stage.

use alloc::sync::Arc;
use core::time::Duration;

use tokio::{
    signal::{self, unix::SignalKind},
    sync::{mpsc, watch},
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::{RegistryConfig, UpdateConfig},
    events::{EventBus, LauncherEvent},
    registry,
    supervisor::{ContainerSpec, ContainerStatus, ContainerSupervisor, SupervisorResult},
    update::SelfUpdater,
};

pub(crate) const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub(crate) const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Doubles `current`, capped at [`MAX_BACKOFF`].
pub(crate) fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}

/// Requests the registry poller sends to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconcileCommand {
    /// Recreate the container from a freshly pulled image.
    Upgrade,
}

/// Channels and settings of the reconciler.
pub(crate) struct Reconciler {
    pub supervisor: Arc<dyn ContainerSupervisor>,
    pub spec: ContainerSpec,
    pub interval: Duration,
    pub events: EventBus,
    pub status: watch::Sender<ContainerStatus>,
    pub commands: mpsc::Receiver<ReconcileCommand>,
}

impl Reconciler {
    async fn reconcile_once(&self) -> SupervisorResult<()> {
        self.supervisor
            .install_or_ensure_running(&self.spec, true)
            .await?;
        let status = self.supervisor.status().await?;
        let changed = self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status.clone();
            true
        });
        if changed {
            debug!(?status, "Node container status changed");
            self.events.publish(LauncherEvent::ContainerStatus(status));
        }
        Ok(())
    }

    /// Recreates the container from a fresh pull. `unchanged` holds the digest a previous
    /// upgrade could not move away from; no upgrade runs while the container still runs it.
    async fn upgrade(&self, unchanged: &mut Option<String>) {
        let before = self.status.borrow().image_digest.clone();
        if before.is_some() && before == *unchanged {
            debug!(digest = ?before, "Registry still reports an update the last pull did not bring");
            return;
        }

        info!(image = %self.spec.image, "Upgrading node container");
        self.events.status("Upgrading node");
        let result = match self.supervisor.uninstall_container().await {
            Ok(()) => {
                self.supervisor
                    .install_or_ensure_running(&self.spec, true)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Node upgrade failed: {e}");
            self.events.status(format!("Node upgrade failed: {e}"));
            return;
        }

        let after = match self.supervisor.status().await {
            Ok(status) => status.image_digest,
            Err(e) => {
                warn!("Cannot inspect the upgraded node container: {e}");
                None
            }
        };
        if after.is_some() && after == before {
            info!(
                digest = ?after,
                "Fresh pull yields the running image, no further upgrades until it changes"
            );
            *unchanged = after;
        } else {
            *unchanged = None;
        }
    }

    /// Keeps the container running until the task is aborted. Failures back off
    /// exponentially; success resets the backoff and waits `interval`.
    pub(crate) async fn run(mut self) {
        let mut backoff = INITIAL_BACKOFF;
        let mut healthy = true;
        let mut commands_open = true;
        let mut unchanged_by_upgrade = None;
        loop {
            let pause = match self.reconcile_once().await {
                Ok(()) => {
                    if !healthy {
                        info!("Node container recovered");
                        self.events.status("Node is running");
                        healthy = true;
                    }
                    backoff = INITIAL_BACKOFF;
                    self.interval.max(Duration::from_secs(1))
                }
                Err(e) => {
                    warn!(retry_in = ?backoff, "Reconciling node container failed: {e}");
                    self.events.status(format!("Node unavailable: {e}"));
                    healthy = false;
                    let pause = backoff;
                    backoff = next_backoff(backoff);
                    pause
                }
            };

            tokio::select! {
                () = time::sleep(pause) => {}
                command = self.commands.recv(), if commands_open => match command {
                    Some(ReconcileCommand::Upgrade) => {
                        self.upgrade(&mut unchanged_by_upgrade).await;
                    }
                    None => commands_open = false,
                },
            }
        }
    }
}

/// Checks the registry for a newer node image every poll interval, once the running
/// image's digest is known. Outdated verdicts trigger an upgrade when `upgrades` is set.
pub(crate) async fn poll_registry(
    http: reqwest::Client,
    config: RegistryConfig,
    events: EventBus,
    mut status: watch::Receiver<ContainerStatus>,
    upgrades: Option<mpsc::Sender<ReconcileCommand>>,
) {
    let mut ticker = time::interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let digest = loop {
            let current = status.borrow_and_update().image_digest.clone();
            if let Some(digest) = current {
                break digest;
            }
            if status.changed().await.is_err() {
                debug!("Container status channel closed, stopping registry poll");
                return;
            }
        };

        let verdict = registry::check_updates(&http, &config, &digest).await;
        events.publish(LauncherEvent::UpdateVerdict(verdict.clone()));
        if verdict.up_to_date {
            continue;
        }
        info!(
            current = %verdict.current_version,
            latest = %verdict.latest_version,
            "Newer node image available"
        );
        if let Some(ref upgrades) = upgrades
            && upgrades.try_send(ReconcileCommand::Upgrade).is_err()
        {
            debug!("Node upgrade already pending");
        }
    }
}

/// Stages newer launcher builds in the background; they are applied on the next start.
pub(crate) async fn poll_launcher_updates(
    updater: SelfUpdater,
    http: reqwest::Client,
    config: UpdateConfig,
    events: EventBus,
) {
    if config.manifest_url.is_none() {
        debug!("No launcher update manifest configured");
        return;
    }
    let mut ticker = time::interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match updater.fetch_if_newer(&http, &config).await {
            Ok(Some(version)) => events.publish(LauncherEvent::LauncherUpdateStaged { version }),
            Ok(None) => {}
            Err(e) => warn!("Launcher update check failed: {e}"),
        }
    }
}

/// Resolves on SIGTERM or Ctrl-C.
pub(crate) async fn shutdown_signal() {
    match signal::unix::signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                _ = signal::ctrl_c() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            drop(signal::ctrl_c().await);
        }
    }
}
