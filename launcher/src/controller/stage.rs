//! The launcher's lifecycle stages and the transitions between them.

use serde::Serialize;
use thiserror::Error as ThisError;

use crate::config::InitialState;

/// Where the launcher is in its lifecycle. Exactly one stage is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleStage {
    /// Elevated initial setup pending.
    Stage1,
    /// Elevated continuation pending.
    Stage2,
    /// Supervising the node.
    Running,
    /// A stop was requested; the node is being released.
    Stopping,
    /// The node is released; the process is about to exit.
    Stopped,
}

/// Something that happened which may move the launcher to another stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageEvent {
    SetupCompleted,
    ContinuationCompleted,
    StopRequested,
    ContainerReleased,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
#[error("invalid transition: {event:?} in stage {stage:?}")]
pub struct TransitionError {
    pub stage: LifecycleStage,
    pub event: StageEvent,
}

impl From<InitialState> for LifecycleStage {
    fn from(state: InitialState) -> Self {
        match state {
            InitialState::Stage1 => Self::Stage1,
            InitialState::Stage2 => Self::Stage2,
            InitialState::Running => Self::Running,
        }
    }
}

impl LifecycleStage {
    /// The persisted stage a start should resume from, for the stages that persist.
    #[must_use]
    pub const fn as_initial_state(self) -> Option<InitialState> {
        match self {
            Self::Stage1 => Some(InitialState::Stage1),
            Self::Stage2 => Some(InitialState::Stage2),
            Self::Running => Some(InitialState::Running),
            Self::Stopping | Self::Stopped => None,
        }
    }

    /// The stage reached when `event` happens in this stage.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] if `event` is not expected in this stage.
    pub const fn transition(self, event: StageEvent) -> Result<Self, TransitionError> {
        match (self, event) {
            (Self::Stage1, StageEvent::SetupCompleted) => Ok(Self::Stage2),
            (Self::Stage2, StageEvent::ContinuationCompleted) => Ok(Self::Running),
            (Self::Running, StageEvent::StopRequested) => Ok(Self::Stopping),
            (Self::Stopping, StageEvent::ContainerReleased) => Ok(Self::Stopped),
            (stage, event) => Err(TransitionError { stage, event }),
        }
    }
}
