//! Typed events published to whoever presents the launcher's state.
//!
//! The controller and its background tasks publish; a tray icon, a window or a console
//! subscribes. Publishing never blocks and never fails: without subscribers events are
//! simply dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::{
    controller::LifecycleStage, registry::UpdateVerdict, supervisor::ContainerStatus,
};

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum LauncherEvent {
    /// The lifecycle stage changed.
    StageChanged(LifecycleStage),
    /// Result of the latest registry check for the node image.
    UpdateVerdict(UpdateVerdict),
    /// The node container's observed state changed.
    ContainerStatus(ContainerStatus),
    /// Human readable status, typically a degraded condition.
    Status(String),
    /// A second launcher start asked this instance to show itself.
    ShowMainRequested,
    /// A newer launcher build was downloaded and is applied on the next start.
    LauncherUpdateStaged { version: String },
    /// A formatted log line.
    Log(String),
}

pub type EventTx = broadcast::Sender<LauncherEvent>;
pub type EventRx = broadcast::Receiver<LauncherEvent>;

/// Cloneable handle to the launcher's event stream.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: EventTx,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    /// Publishes to all current subscribers.
    pub fn publish(&self, event: LauncherEvent) {
        // No subscribers is fine. Must not log here, log lines are published through this.
        drop(self.tx.send(event));
    }

    /// Publishes a [`LauncherEvent::Status`].
    pub fn status(&self, text: impl Into<String>) {
        self.publish(LauncherEvent::Status(text.into()));
    }

    /// Receives every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> EventRx {
        self.tx.subscribe()
    }
}
