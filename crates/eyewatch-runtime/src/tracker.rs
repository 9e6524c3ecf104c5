//! Tracking-process controller.
//!
//! One actor task owns the (at most one) tracking session. Start/Stop/Status
//! requests, child-exit notifications and grace deadlines all arrive on the
//! actor's queues and are applied one at a time through
//! [`TrackingLifecycle`]. Exit and deadline events carry the session
//! generation they belong to; anything for an older generation is dropped.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use eyewatch_core::{
    DeviceId, LifecycleAction, LifecycleEvent, StopOutcome, TrackingLifecycle, TrackingState,
};

use crate::child::{self, ExitReport, TrackerCommand};

/// Grace period between the interrupt and the forced kill.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(5_000);

/// Delivers the graceful-stop signal to a pid.
pub type InterruptFn = fn(u32) -> std::io::Result<()>;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub command: TrackerCommand,
    pub stop_grace: Duration,
    pub interrupt: InterruptFn,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: TrackerCommand::default(),
            stop_grace: DEFAULT_STOP_GRACE,
            interrupt: child::send_interrupt,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracking already active for {device} ({state})")]
    AlreadyRunning {
        device: DeviceId,
        state: &'static str,
    },

    #[error("tracking is not active")]
    NotRunning,

    #[error("failed to signal tracker pid {pid}: {message}")]
    SignalError { pid: u32, message: String },

    #[error("failed to launch tracker {program:?}: {source}")]
    SpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tracking controller has shut down")]
    ControllerGone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAck {
    pub device: DeviceId,
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopAck {
    pub device: DeviceId,
    pub outcome: StopOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingStatus {
    pub state: TrackingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

type Reply<T> = oneshot::Sender<Result<T, TrackerError>>;

enum Request {
    Start { device: DeviceId, reply: Reply<StartAck> },
    Stop { reply: Reply<StopAck> },
    Status { reply: oneshot::Sender<TrackingStatus> },
    Shutdown { reply: oneshot::Sender<()> },
}

#[derive(Debug)]
enum Event {
    Exited {
        generation: u64,
        report: Option<ExitReport>,
    },
    GraceElapsed {
        generation: u64,
    },
}

/// Cloneable handle to the controller actor.
#[derive(Clone)]
pub struct TrackingController {
    requests: mpsc::Sender<Request>,
}

impl TrackingController {
    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(config: TrackerConfig) -> Self {
        let (req_tx, req_rx) = mpsc::channel(32);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let actor = Actor {
            config,
            lifecycle: TrackingLifecycle::new(),
            session: None,
            generation: 0,
            events: event_tx,
            shutdown_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(req_rx, event_rx));
        Self { requests: req_tx }
    }

    pub async fn start(&self, device: DeviceId) -> Result<StartAck, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Start { device, reply }).await?;
        rx.await.map_err(|_| TrackerError::ControllerGone)?
    }

    /// Resolves once the tracker has actually exited (or stopping failed).
    pub async fn stop(&self) -> Result<StopAck, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Stop { reply }).await?;
        rx.await.map_err(|_| TrackerError::ControllerGone)?
    }

    pub async fn status(&self) -> Result<TrackingStatus, TrackerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Status { reply }).await?;
        rx.await.map_err(|_| TrackerError::ControllerGone)
    }

    /// Stop any running tracker and end the actor. Later calls on any clone
    /// fail with `ControllerGone`.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.send(Request::Shutdown { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn send(&self, request: Request) -> Result<(), TrackerError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| TrackerError::ControllerGone)
    }
}

struct Session {
    generation: u64,
    device: DeviceId,
    pid: u32,
    started_at: DateTime<Utc>,
    kill: Option<oneshot::Sender<()>>,
    stop_waiters: Vec<Reply<StopAck>>,
}

impl Session {
    fn force_kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }
}

struct Actor {
    config: TrackerConfig,
    lifecycle: TrackingLifecycle,
    session: Option<Session>,
    generation: u64,
    events: mpsc::UnboundedSender<Event>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut handles_open = true;
        loop {
            tokio::select! {
                request = requests.recv(), if handles_open => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        // Every handle dropped: nobody can stop the tracker any
                        // more, so stop it now.
                        handles_open = false;
                        if self.session.is_none() {
                            break;
                        }
                        self.begin_shutdown(None);
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }

            if !self.shutdown_waiters.is_empty() && self.session.is_none() {
                break;
            }
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        tracing::debug!("tracking controller stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Start { device, reply } => {
                let _ = reply.send(self.start(device));
            }
            Request::Stop { reply } => self.stop(reply),
            Request::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Request::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    fn start(&mut self, device: DeviceId) -> Result<StartAck, TrackerError> {
        if !self.shutdown_waiters.is_empty() {
            return Err(TrackerError::ControllerGone);
        }
        match self.lifecycle.on_event(LifecycleEvent::StartRequested) {
            LifecycleAction::Spawn => {}
            _ => {
                let session = self.session.as_ref().map(|s| s.device.clone());
                tracing::info!(requested = %device, "start rejected: tracking already active");
                return Err(TrackerError::AlreadyRunning {
                    device: session.unwrap_or(device),
                    state: self.lifecycle.state().as_str(),
                });
            }
        }

        self.generation += 1;
        let generation = self.generation;
        let events = self.events.clone();
        let spawned = child::spawn_tracker(&self.config.command, &device, move |report| {
            let _ = events.send(Event::Exited { generation, report });
        });

        match spawned {
            Ok(spawned) => {
                let started_at = Utc::now();
                tracing::info!(device = %device, pid = spawned.pid, "tracking started");
                self.session = Some(Session {
                    generation,
                    device: device.clone(),
                    pid: spawned.pid,
                    started_at,
                    kill: Some(spawned.kill),
                    stop_waiters: Vec::new(),
                });
                Ok(StartAck {
                    device,
                    pid: spawned.pid,
                    started_at,
                })
            }
            Err(source) => {
                self.lifecycle.on_event(LifecycleEvent::SpawnFailed);
                tracing::error!(
                    device = %device,
                    program = %self.config.command.program,
                    "failed to launch tracker: {source}"
                );
                Err(TrackerError::SpawnError {
                    program: self.config.command.program.clone(),
                    source,
                })
            }
        }
    }

    fn stop(&mut self, reply: Reply<StopAck>) {
        match self.lifecycle.on_event(LifecycleEvent::StopRequested) {
            LifecycleAction::RejectNotRunning => {
                let _ = reply.send(Err(TrackerError::NotRunning));
            }
            LifecycleAction::JoinPendingStop => {
                if let Some(session) = self.session.as_mut() {
                    session.stop_waiters.push(reply);
                }
            }
            LifecycleAction::SendInterrupt => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.stop_waiters.push(reply);
                tracing::info!(device = %session.device, pid = session.pid, "stopping tracker");

                if let Err(e) = (self.config.interrupt)(session.pid) {
                    tracing::warn!(pid = session.pid, "interrupt failed: {e}");
                    let message = e.to_string();
                    let pid = session.pid;
                    for waiter in session.stop_waiters.drain(..) {
                        let _ = waiter.send(Err(TrackerError::SignalError {
                            pid,
                            message: message.clone(),
                        }));
                    }
                    if self.lifecycle.on_event(LifecycleEvent::SignalFailed)
                        == LifecycleAction::SendKill
                    {
                        session.force_kill();
                    }
                    return;
                }

                let generation = session.generation;
                let grace = self.config.stop_grace;
                let events = self.events.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = events.send(Event::GraceElapsed { generation });
                });
            }
            other => {
                tracing::error!("unexpected lifecycle action for stop: {other:?}");
            }
        }
    }

    fn status(&self) -> TrackingStatus {
        TrackingStatus {
            state: self.lifecycle.state(),
            device: self.session.as_ref().map(|s| s.device.clone()),
            pid: self.session.as_ref().map(|s| s.pid),
            started_at: self.session.as_ref().map(|s| s.started_at),
        }
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        let (tx, _rx) = oneshot::channel();
        self.shutdown_waiters.push(reply.unwrap_or(tx));
        if self.lifecycle.state() == TrackingState::Running {
            let (reply, _) = oneshot::channel();
            self.stop(reply);
        }
    }

    fn handle_event(&mut self, event: Event) {
        let current = self.session.as_ref().map(|s| s.generation);
        match event {
            Event::Exited { generation, report } => {
                if current != Some(generation) {
                    tracing::debug!(generation, "ignoring exit of stale tracker");
                    return;
                }
                let LifecycleAction::ClearHandle { outcome } =
                    self.lifecycle.on_event(LifecycleEvent::ChildExited)
                else {
                    return;
                };
                let Some(session) = self.session.take() else {
                    return;
                };
                match outcome {
                    Some(outcome) => {
                        tracing::info!(device = %session.device, ?outcome, "tracking stopped");
                        for waiter in session.stop_waiters {
                            let _ = waiter.send(Ok(StopAck {
                                device: session.device.clone(),
                                outcome,
                            }));
                        }
                    }
                    None => {
                        tracing::warn!(
                            device = %session.device,
                            code = ?report.and_then(|r| r.code),
                            "tracker exited without a stop request"
                        );
                    }
                }
            }
            Event::GraceElapsed { generation } => {
                if current != Some(generation) {
                    return;
                }
                let action = self.lifecycle.on_event(LifecycleEvent::GraceElapsed);
                if action != LifecycleAction::SendKill {
                    return;
                }
                if let Some(session) = self.session.as_mut() {
                    tracing::warn!(
                        device = %session.device,
                        pid = session.pid,
                        "tracker ignored interrupt, killing"
                    );
                    session.force_kill();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    fn device(s: &str) -> DeviceId {
        DeviceId::parse(s).unwrap()
    }

    fn sh(script: &str, grace_ms: u64) -> TrackerConfig {
        TrackerConfig {
            command: TrackerCommand {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "tracker".to_string()],
            },
            stop_grace: Duration::from_millis(grace_ms),
            ..TrackerConfig::default()
        }
    }

    /// Exits cleanly on SIGINT.
    fn polite(grace_ms: u64) -> TrackerConfig {
        sh("trap 'exit 0' INT; while true; do sleep 0.1; done", grace_ms)
    }

    /// Ignores SIGINT.
    fn stubborn(grace_ms: u64) -> TrackerConfig {
        sh("trap '' INT; while true; do sleep 0.1; done", grace_ms)
    }

    async fn wait_for_state(ctl: &TrackingController, want: TrackingState) -> TrackingStatus {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = ctl.status().await.expect("controller alive");
            if status.state == want {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {want:?}, last {status:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn let_trap_install() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test]
    async fn starts_idle() {
        let ctl = TrackingController::spawn(polite(1_000));
        let status = ctl.status().await.unwrap();
        assert_eq!(status.state, TrackingState::Idle);
        assert!(status.device.is_none());
        assert!(status.pid.is_none());
    }

    #[tokio::test]
    async fn stop_while_idle_is_not_running() {
        let ctl = TrackingController::spawn(polite(1_000));
        let err = ctl.stop().await.unwrap_err();
        assert!(matches!(err, TrackerError::NotRunning));
        assert_eq!(ctl.status().await.unwrap().state, TrackingState::Idle);
    }

    #[tokio::test]
    async fn start_then_graceful_stop() {
        let ctl = TrackingController::spawn(polite(5_000));
        let ack = ctl.start(device(MAC)).await.expect("start");
        assert_eq!(ack.device.as_str(), MAC);

        let status = ctl.status().await.unwrap();
        assert_eq!(status.state, TrackingState::Running);
        assert_eq!(status.pid, Some(ack.pid));
        assert_eq!(status.device, Some(device(MAC)));

        let_trap_install().await;
        let started = tokio::time::Instant::now();
        let stop = ctl.stop().await.expect("stop");
        assert_eq!(stop.outcome, StopOutcome::Graceful);
        assert_eq!(stop.device.as_str(), MAC);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(ctl.status().await.unwrap().state, TrackingState::Idle);
    }

    #[tokio::test]
    async fn second_start_is_rejected_and_keeps_original() {
        let ctl = TrackingController::spawn(polite(1_000));
        let first = ctl.start(device(MAC)).await.expect("start");

        let err = ctl.start(device("11:22:33:44:55:66")).await.unwrap_err();
        match err {
            TrackerError::AlreadyRunning { device: d, state } => {
                assert_eq!(d.as_str(), MAC);
                assert_eq!(state, "running");
            }
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        let status = ctl.status().await.unwrap();
        assert_eq!(status.pid, Some(first.pid));
        assert_eq!(status.device, Some(device(MAC)));

        let_trap_install().await;
        ctl.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn unexpected_exit_returns_to_idle() {
        let ctl = TrackingController::spawn(sh("sleep 0.2; exit 3", 1_000));
        ctl.start(device(MAC)).await.expect("start");
        wait_for_state(&ctl, TrackingState::Idle).await;
        // Slot is free again.
        ctl.start(device(MAC)).await.expect("restart after crash");
        wait_for_state(&ctl, TrackingState::Idle).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn external_kill_returns_to_idle() {
        let ctl = TrackingController::spawn(stubborn(1_000));
        let ack = ctl.start(device(MAC)).await.expect("start");
        // SAFETY: plain kill(2) on a pid we just spawned.
        let rc = unsafe { libc::kill(ack.pid as libc::pid_t, libc::SIGKILL) };
        assert_eq!(rc, 0);
        wait_for_state(&ctl, TrackingState::Idle).await;
        assert!(matches!(ctl.stop().await, Err(TrackerError::NotRunning)));
    }

    #[tokio::test]
    async fn stubborn_child_is_force_killed_after_grace() {
        let ctl = TrackingController::spawn(stubborn(300));
        ctl.start(device(MAC)).await.expect("start");
        let_trap_install().await;

        let started = tokio::time::Instant::now();
        let stop = ctl.stop().await.expect("stop answered exactly once");
        assert_eq!(stop.outcome, StopOutcome::Forced);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(ctl.status().await.unwrap().state, TrackingState::Idle);
    }

    #[tokio::test]
    async fn start_during_stop_is_rejected() {
        let ctl = TrackingController::spawn(stubborn(500));
        ctl.start(device(MAC)).await.expect("start");
        let_trap_install().await;

        let stopper = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.stop().await })
        };
        wait_for_state(&ctl, TrackingState::StoppingGraceful).await;
        let err = ctl.start(device(MAC)).await.unwrap_err();
        assert!(matches!(
            err,
            TrackerError::AlreadyRunning {
                state: "stopping_graceful",
                ..
            }
        ));

        let ack = stopper.await.unwrap().expect("stop");
        assert_eq!(ack.outcome, StopOutcome::Forced);
    }

    #[tokio::test]
    async fn concurrent_stops_share_one_outcome() {
        let ctl = TrackingController::spawn(polite(5_000));
        ctl.start(device(MAC)).await.expect("start");
        let_trap_install().await;

        let (a, b) = tokio::join!(ctl.stop(), ctl.stop());
        let a = a.expect("first stop");
        let b = b.expect("joined stop");
        assert_eq!(a.outcome, StopOutcome::Graceful);
        assert_eq!(b.outcome, StopOutcome::Graceful);
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let ctl = TrackingController::spawn(polite(1_000));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctl = ctl.clone();
            handles.push(tokio::spawn(async move { ctl.start(device(MAC)).await }));
        }
        let mut ok = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(_) => ok += 1,
                Err(TrackerError::AlreadyRunning { .. }) => {}
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }
        assert_eq!(ok, 1);
        let_trap_install().await;
        ctl.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn spawn_failure_leaves_idle() {
        let ctl = TrackingController::spawn(TrackerConfig {
            command: TrackerCommand {
                program: "/nonexistent/eyewatch-tracker".to_string(),
                args: Vec::new(),
            },
            stop_grace: Duration::from_millis(100),
            ..TrackerConfig::default()
        });
        let err = ctl.start(device(MAC)).await.unwrap_err();
        assert!(matches!(err, TrackerError::SpawnError { .. }));
        assert_eq!(ctl.status().await.unwrap().state, TrackingState::Idle);
    }

    fn refuse_interrupt(_pid: u32) -> std::io::Result<()> {
        Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied))
    }

    #[tokio::test]
    async fn failed_interrupt_reports_signal_error_and_kills() {
        let ctl = TrackingController::spawn(TrackerConfig {
            interrupt: refuse_interrupt,
            ..polite(5_000)
        });
        let ack = ctl.start(device(MAC)).await.expect("start");

        let started = tokio::time::Instant::now();
        match ctl.stop().await {
            Err(TrackerError::SignalError { pid, .. }) => assert_eq!(pid, ack.pid),
            other => panic!("expected SignalError, got {other:?}"),
        }

        // Force-killed without waiting out the grace period.
        wait_for_state(&ctl, TrackingState::Idle).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(ctl.stop().await, Err(TrackerError::NotRunning)));

        ctl.start(device(MAC)).await.expect("slot is free again");
        let err = ctl.stop().await.unwrap_err();
        assert!(matches!(err, TrackerError::SignalError { .. }));
        wait_for_state(&ctl, TrackingState::Idle).await;
    }

    #[tokio::test]
    async fn shutdown_stops_running_tracker() {
        let ctl = TrackingController::spawn(polite(2_000));
        ctl.start(device(MAC)).await.expect("start");
        let_trap_install().await;
        tokio::time::timeout(Duration::from_secs(5), ctl.shutdown())
            .await
            .expect("shutdown completes");
        assert!(matches!(
            ctl.status().await,
            Err(TrackerError::ControllerGone)
        ));
    }

    #[tokio::test]
    async fn shutdown_when_idle_is_immediate() {
        let ctl = TrackingController::spawn(polite(2_000));
        tokio::time::timeout(Duration::from_secs(1), ctl.shutdown())
            .await
            .expect("shutdown completes");
        assert!(matches!(
            ctl.start(device(MAC)).await,
            Err(TrackerError::ControllerGone)
        ));
    }
}
