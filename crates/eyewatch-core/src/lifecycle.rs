//! Tracking-process lifecycle state machine.
//!
//! Pure and deterministic: the caller feeds events in and executes the
//! returned action. No IO, no clock, no process handles.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the single tracking session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingState {
    /// No handle.
    #[default]
    Idle,
    /// Handle present, child alive.
    Running,
    /// Interrupt sent, waiting for the child to exit or the grace deadline.
    StoppingGraceful,
    /// Grace deadline passed, kill sent, waiting for the exit notification.
    StoppingForced,
}

impl TrackingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::StoppingGraceful => "stopping_graceful",
            Self::StoppingForced => "stopping_forced",
        }
    }

    /// Whether a tracking handle exists in this state.
    pub fn has_handle(self) -> bool {
        !matches!(self, Self::Idle)
    }

    pub fn is_stopping(self) -> bool {
        matches!(self, Self::StoppingGraceful | Self::StoppingForced)
    }
}

/// How a stop request was ultimately satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Child honoured the interrupt before the deadline.
    Graceful,
    /// Child had to be killed after the deadline.
    Forced,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StartRequested,
    /// The spawn attempted for `StartRequested` failed.
    SpawnFailed,
    StopRequested,
    /// The interrupt could not be delivered.
    SignalFailed,
    ChildExited,
    GraceElapsed,
}

/// What the executor must do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Launch the child and keep its handle.
    Spawn,
    RejectAlreadyRunning,
    RejectNotRunning,
    /// Send the graceful interrupt and arm the grace deadline.
    SendInterrupt,
    /// A stop is already underway: attach the caller to it.
    JoinPendingStop,
    /// Send the unconditional kill.
    SendKill,
    /// Drop the handle. `outcome` is `Some` when a stop was pending and
    /// its callers must now be answered.
    ClearHandle { outcome: Option<StopOutcome> },
    /// Event no longer applies (lost race, stale notification).
    Ignore,
}

/// Transition table for one tracking session slot.
#[derive(Debug, Clone, Default)]
pub struct TrackingLifecycle {
    state: TrackingState,
}

impl TrackingLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> TrackingState {
        self.state
    }

    /// Apply `event` and return the action to execute.
    pub fn on_event(&mut self, event: LifecycleEvent) -> LifecycleAction {
        use LifecycleAction as A;
        use LifecycleEvent as E;
        use TrackingState as S;

        let (next, action) = match (self.state, event) {
            (S::Idle, E::StartRequested) => (S::Running, A::Spawn),
            (_, E::StartRequested) => (self.state, A::RejectAlreadyRunning),

            (S::Running, E::SpawnFailed) => (S::Idle, A::ClearHandle { outcome: None }),
            (_, E::SpawnFailed) => (self.state, A::Ignore),

            (S::Idle, E::StopRequested) => (S::Idle, A::RejectNotRunning),
            (S::Running, E::StopRequested) => (S::StoppingGraceful, A::SendInterrupt),
            (S::StoppingGraceful | S::StoppingForced, E::StopRequested) => {
                (self.state, A::JoinPendingStop)
            }

            (S::StoppingGraceful, E::SignalFailed) => (S::StoppingForced, A::SendKill),
            (_, E::SignalFailed) => (self.state, A::Ignore),

            (S::Idle, E::ChildExited) => (S::Idle, A::Ignore),
            (S::Running, E::ChildExited) => (S::Idle, A::ClearHandle { outcome: None }),
            (S::StoppingGraceful, E::ChildExited) => (
                S::Idle,
                A::ClearHandle {
                    outcome: Some(StopOutcome::Graceful),
                },
            ),
            (S::StoppingForced, E::ChildExited) => (
                S::Idle,
                A::ClearHandle {
                    outcome: Some(StopOutcome::Forced),
                },
            ),

            (S::StoppingGraceful, E::GraceElapsed) => (S::StoppingForced, A::SendKill),
            (_, E::GraceElapsed) => (self.state, A::Ignore),
        };

        self.state = next;
        action
    }
}
