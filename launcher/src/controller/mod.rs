//! The lifecycle controller: boot sequence, stage transitions, steady state and
//! controlled shutdown.
//!
//! Boot order is fixed. Elevation is settled first, then a staged launcher update is
//! applied, then the singleton socket is claimed, and only then does anything touch
//! the container runtime.

mod context;
mod runtime;
mod stage;

use alloc::sync::Arc;
use core::{pin::pin, time::Duration};

use eyre::WrapErr as _;
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{info, instrument, warn};

pub use context::LauncherContext;
use launcher_common::SingletonMessage;
use runtime::Reconciler;
pub use stage::{LifecycleStage, StageEvent, TransitionError};

use crate::{
    config::{self, StopPolicy},
    events::LauncherEvent,
    ipc::{self, IpcError, IpcRequest, Responder, SingletonListener},
    supervisor::{ContainerSpec, ContainerStatus},
};

/// How a launcher process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Setup needs root; a privileged copy was started to continue.
    RelaunchedElevated,
    /// A staged launcher update was installed and the new build started.
    UpdatedAndRelaunched,
    /// Another launcher already runs and was asked to show itself.
    HandedOver,
    /// A stop request released the node.
    Stopped,
    /// SIGTERM or Ctrl-C; the node container was left running.
    Interrupted,
}

/// Drives one launcher process through its lifecycle.
pub struct AppController {
    ctx: LauncherContext,
    stage: LifecycleStage,
}

impl AppController {
    #[must_use]
    pub fn new(ctx: LauncherContext) -> Self {
        let stage = LifecycleStage::from(ctx.config.initial_state);
        Self { ctx, stage }
    }

    /// Runs the launcher until it is stopped, interrupted or hands over to another
    /// process.
    ///
    /// # Errors
    ///
    /// Returns an error if relaunching fails, the singleton socket cannot be claimed,
    /// setup of the current stage fails, or a stage cannot be persisted.
    #[instrument(skip_all, fields(stage = ?self.stage))]
    pub async fn run(mut self) -> eyre::Result<Outcome> {
        self.ctx.events.publish(LauncherEvent::StageChanged(self.stage));
        let setup_pending = self.ctx.config.initial_state.needs_elevation();

        if setup_pending && !self.ctx.native.is_elevated() {
            info!("Setup is incomplete and needs root privileges");
            self.ctx
                .native
                .relaunch_elevated(&self.ctx.relaunch_args)
                .wrap_err("Failed to relaunch with root privileges")?;
            return Ok(Outcome::RelaunchedElevated);
        }

        // setup stages run mid-installation, updates wait until it is finished
        if !setup_pending && self.apply_launcher_update().await? {
            return Ok(Outcome::UpdatedAndRelaunched);
        }

        let socket_path = self.ctx.config.ipc.socket_path.clone();
        let (singleton, requests) = match SingletonListener::bind(&socket_path).await {
            Ok(listener) => listener.listen(),
            Err(IpcError::AlreadyBound(path)) => {
                info!("Another launcher is already running, asking it to show itself");
                if !ipc::send_show_main(&path).await {
                    warn!("The running launcher did not acknowledge");
                }
                return Ok(Outcome::HandedOver);
            }
            Err(e) => return Err(e).wrap_err("Failed to claim the singleton socket"),
        };

        self.run_setup().await?;
        let outcome = self.steady_state(requests).await;
        drop(singleton);
        outcome
    }

    /// Applies a staged launcher update and relaunches into it. A failed apply keeps
    /// this build running.
    async fn apply_launcher_update(&self) -> eyre::Result<bool> {
        match self.ctx.updater.apply_staged().await {
            Ok(Some(version)) => {
                info!(%version, "Starting the updated launcher");
                self.ctx
                    .native
                    .relaunch(self.ctx.updater.exe(), &self.ctx.relaunch_args)
                    .wrap_err("Failed to start the updated launcher")?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => {
                warn!("Failed to apply staged launcher update, continuing with this build: {e}");
                Ok(false)
            }
        }
    }

    /// Moves to the next stage, persisting it first when it is a resumable one.
    async fn advance(&mut self, event: StageEvent) -> eyre::Result<()> {
        let next = self.stage.transition(event)?;
        if let Some(state) = next.as_initial_state()
            && state != self.ctx.config.initial_state
        {
            self.ctx.config.initial_state = state;
            config::save(&self.ctx.config_path, &self.ctx.config)
                .await
                .wrap_err(format!("Failed to persist stage {next:?}"))?;
        }
        info!(from = ?self.stage, to = ?next, "Stage changed");
        self.stage = next;
        self.ctx.events.publish(LauncherEvent::StageChanged(next));
        Ok(())
    }

    /// Runs the privileged setup stages still pending. A failure leaves the failed
    /// stage persisted for the next start.
    #[instrument(skip_all)]
    async fn run_setup(&mut self) -> eyre::Result<()> {
        if self.stage == LifecycleStage::Stage1 {
            info!("Initial setup: opening node ports in the firewall");
            self.ctx
                .native
                .install_firewall_rules(&self.ctx.config.node.firewall_ports)
                .await
                .wrap_err("Initial setup failed")?;
            self.advance(StageEvent::SetupCompleted).await?;
        }
        if self.stage == LifecycleStage::Stage2 {
            info!("Continuing setup: checking the container runtime");
            match self.ctx.supervisor.status().await {
                Err(e) if e.runtime_unavailable() => {
                    self.ctx.events.status(format!("Container runtime unavailable: {e}"));
                    return Err(e).wrap_err("The container runtime is not usable");
                }
                Err(e) => warn!("Container runtime answered with an error: {e}"),
                Ok(_) => {}
            }
            self.advance(StageEvent::ContinuationCompleted).await?;
        }
        Ok(())
    }

    fn spawn_activities(&self, tasks: &mut JoinSet<()>) {
        let config = &self.ctx.config;
        let (status_tx, status_rx) = watch::channel(ContainerStatus::default());
        let (upgrade_tx, upgrade_rx) = mpsc::channel(1);

        tasks.spawn(
            Reconciler {
                supervisor: Arc::clone(&self.ctx.supervisor),
                spec: ContainerSpec::from(&config.node),
                interval: Duration::from_secs(config.supervisor.reconcile_interval_secs),
                events: self.ctx.events.clone(),
                status: status_tx,
                commands: upgrade_rx,
            }
            .run(),
        );
        tasks.spawn(runtime::poll_registry(
            self.ctx.http.clone(),
            config.registry.clone(),
            self.ctx.events.clone(),
            status_rx,
            config.node.auto_upgrade.then_some(upgrade_tx),
        ));
        tasks.spawn(runtime::poll_launcher_updates(
            self.ctx.updater.clone(),
            self.ctx.http.clone(),
            config.update.clone(),
            self.ctx.events.clone(),
        ));
    }

    /// Supervises the node until a stop request or a shutdown signal arrives.
    #[instrument(skip_all)]
    async fn steady_state(
        &mut self,
        mut requests: mpsc::Receiver<IpcRequest>,
    ) -> eyre::Result<Outcome> {
        let mut tasks = JoinSet::new();
        self.spawn_activities(&mut tasks);
        self.ctx.events.status("Node launcher is running");

        let mut shutdown = pin!(runtime::shutdown_signal());
        let mut listening = true;
        let stop_requester = loop {
            tokio::select! {
                request = requests.recv(), if listening => match request {
                    Some(IpcRequest { message: SingletonMessage::StopApp, responder }) => {
                        info!("Stop requested by another launcher process");
                        break responder;
                    }
                    Some(IpcRequest { message: SingletonMessage::ShowMain, .. }) => {
                        info!("Another launcher start asked to show this one");
                        self.ctx.events.publish(LauncherEvent::ShowMainRequested);
                    }
                    Some(IpcRequest { message: SingletonMessage::Ping, .. }) => {}
                    None => {
                        warn!("Singleton listener stopped, stop requests are no longer received");
                        listening = false;
                    }
                },
                () = &mut shutdown => {
                    info!("Received shutdown signal, leaving the node container running");
                    tasks.shutdown().await;
                    return Ok(Outcome::Interrupted);
                }
            }
        };

        tasks.shutdown().await;
        self.stop(stop_requester, &mut requests).await
    }

    /// Releases the node according to the stop policy and confirms every pending stop
    /// request.
    #[instrument(skip_all)]
    async fn stop(
        &mut self,
        first: Responder,
        requests: &mut mpsc::Receiver<IpcRequest>,
    ) -> eyre::Result<Outcome> {
        self.advance(StageEvent::StopRequested).await?;
        let released = match self.ctx.config.supervisor.stop_policy {
            StopPolicy::Uninstall => self.ctx.supervisor.uninstall_container().await,
            StopPolicy::Stop => self.ctx.supervisor.stop_container().await,
        };
        if let Err(e) = released {
            warn!("Failed to release the node container: {e}");
            self.ctx.events.status(format!("Failed to release the node: {e}"));
        }
        self.advance(StageEvent::ContainerReleased).await?;

        let mut waiting = vec![first];
        while let Ok(request) = requests.try_recv() {
            if request.message == SingletonMessage::StopApp {
                waiting.push(request.responder);
            }
        }
        for responder in waiting {
            responder.confirm_stopped().await;
        }
        Ok(Outcome::Stopped)
    }
}
