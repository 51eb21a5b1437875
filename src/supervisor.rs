//! Capture process supervisor.
//!
//! A poll-driven state machine around one external capture process:
//!
//! ```text
//! Idle -> Starting -> Running -> Stopping -> Idle
//!            ^           |
//!            |        Crashed -> Restarting --+
//!            +--------------------------------+
//!                        Crashed -> Failed (restart budget exhausted)
//! ```
//!
//! `tick` never sleeps: backoff and startup deadlines are stored and checked
//! on later ticks, so the caller's control loop is never stalled. Only
//! `stop` awaits, bounded by the stop timeout.

use crate::capture::{CaptureChild, ExitInfo, Launcher};
use crate::config::{CaptureConfig, SupervisorConfig};
use crate::restart::{RestartDecision, RestartPolicy};
use crate::segments::{SegmentEvent, SegmentTracker};
use crate::session::{self, Session};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// How long to wait for the process to be reaped after SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    Idle,
    Starting,
    Running,
    Stopping,
    Crashed,
    Restarting,
    /// Restart budget exhausted. Terminal.
    Failed,
}

/// Read-only view published after every transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupervisorSnapshot {
    pub state: SupervisorState,
    pub pid: Option<u32>,
    pub current_segment: Option<PathBuf>,
    pub segment_index: Option<u64>,
    pub next_index: u64,
    pub restart_count: u32,
    pub launches: u32,
}

impl SupervisorSnapshot {
    fn idle() -> Self {
        Self {
            state: SupervisorState::Idle,
            pid: None,
            current_segment: None,
            segment_index: None,
            next_index: 0,
            restart_count: 0,
            launches: 0,
        }
    }
}

/// Why a launch ended without being asked to.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    Exited(ExitInfo),
    /// No segment data appeared within the startup timeout.
    StartupTimeout,
    LaunchFailed(String),
    /// The process could not be polled; it was killed.
    Unpollable(String),
}

impl std::fmt::Display for FailureCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCause::Exited(exit) => write!(f, "capture process exited unexpectedly ({exit})"),
            FailureCause::StartupTimeout => write!(f, "no segment data within startup timeout"),
            FailureCause::LaunchFailed(e) => write!(f, "{e}"),
            FailureCause::Unpollable(e) => write!(f, "failed to poll capture process: {e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Launched {
        pid: u32,
        launch: u32,
    },
    /// First segment data confirmed; the launch is healthy.
    Running {
        pid: u32,
    },
    Segment(SegmentEvent),
    /// The process went down. `restart` is set when it will be relaunched.
    ProcessFailure {
        launch: u32,
        cause: FailureCause,
        ran_for: Duration,
        restart: Option<(u32, Duration)>,
        stderr_tail: Vec<String>,
    },
    /// Restart budget exhausted; no further launches.
    Failed {
        crashes: u32,
    },
    Stopped {
        pid: u32,
        graceful: bool,
        exit: Option<ExitInfo>,
    },
}

/// Owned exclusively by the supervisor.
struct ProcessHandle<C> {
    child: C,
    pid: u32,
    launch: u32,
    launch_time: Instant,
    restart_count: u32,
}

pub struct Supervisor<L: Launcher> {
    launcher: L,
    capture: CaptureConfig,
    session: Arc<Session>,
    startup_timeout: Duration,
    stop_timeout: Duration,
    policy: RestartPolicy,
    tracker: SegmentTracker,
    handle: Option<ProcessHandle<L::Child>>,
    state: SupervisorState,
    starting_deadline: Option<Instant>,
    restart_at: Option<Instant>,
    launches: u32,
    snapshot_tx: watch::Sender<SupervisorSnapshot>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(
        launcher: L,
        session: Arc<Session>,
        capture: CaptureConfig,
        config: &SupervisorConfig,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SupervisorSnapshot::idle());
        Self {
            launcher,
            capture,
            tracker: SegmentTracker::new(Arc::clone(&session)),
            session,
            startup_timeout: config.startup_timeout(),
            stop_timeout: config.stop_timeout(),
            policy: RestartPolicy::new(
                config.max_restarts,
                config.restart_window(),
                Duration::from_secs(config.backoff_initial_secs),
                Duration::from_secs(config.backoff_max_secs),
            ),
            handle: None,
            state: SupervisorState::Idle,
            starting_deadline: None,
            restart_at: None,
            launches: 0,
            snapshot_tx,
        }
    }

    /// Readers get every state change; only the supervisor writes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn snapshot(&self) -> SupervisorSnapshot {
        SupervisorSnapshot {
            state: self.state,
            pid: self.handle.as_ref().map(|h| h.pid),
            current_segment: self.tracker.active().map(|p| p.to_path_buf()),
            segment_index: self.tracker.active_index(),
            next_index: self.tracker.next_index(),
            restart_count: self.policy.total_restarts(),
            launches: self.launches,
        }
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "supervisor transition");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    /// Launch the capture process. Only valid from Idle; ignored otherwise.
    pub fn start(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        if self.state != SupervisorState::Idle {
            tracing::debug!(state = ?self.state, "start ignored, supervisor not idle");
            return events;
        }
        self.launch(now, &mut events);
        events
    }

    fn launch(&mut self, now: Instant, events: &mut Vec<SupervisorEvent>) {
        self.restart_at = None;
        let launch = self.launches;
        self.launches += 1;
        let spec = session::launch_spec(&self.capture, &self.session, launch);
        self.tracker.begin_launch(launch);
        self.set_state(SupervisorState::Starting);

        match self.launcher.launch(&spec) {
            Ok(child) => {
                let pid = child.pid();
                self.handle = Some(ProcessHandle {
                    child,
                    pid,
                    launch,
                    launch_time: now,
                    restart_count: self.policy.total_restarts(),
                });
                self.starting_deadline = Some(now + self.startup_timeout);
                tracing::info!(
                    pid,
                    launch,
                    restart_count = self.policy.total_restarts(),
                    "capture launched"
                );
                events.push(SupervisorEvent::Launched { pid, launch });
                self.publish();
            }
            Err(e) => {
                tracing::error!(error = %e, launch, "capture launch failed");
                self.tracker.finish_launch();
                self.fail(
                    now,
                    launch,
                    FailureCause::LaunchFailed(e.to_string()),
                    Duration::ZERO,
                    Vec::new(),
                    events,
                );
            }
        }
    }

    /// One liveness poll.
    pub fn tick(&mut self, now: Instant) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        match self.state {
            SupervisorState::Starting | SupervisorState::Running => {
                self.poll_process(now, &mut events);
            }
            SupervisorState::Restarting => {
                if self.restart_at.is_some_and(|at| now >= at) {
                    self.launch(now, &mut events);
                }
            }
            SupervisorState::Idle
            | SupervisorState::Stopping
            | SupervisorState::Crashed
            | SupervisorState::Failed => {}
        }
        events
    }

    fn poll_process(&mut self, now: Instant, events: &mut Vec<SupervisorEvent>) {
        events.extend(self.tracker.scan().into_iter().map(SupervisorEvent::Segment));

        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let polled = handle.child.try_wait();
        let pid = handle.pid;

        match polled {
            Ok(Some(exit)) => {
                self.end_launch(now, FailureCause::Exited(exit), events);
            }
            Ok(None) if self.state == SupervisorState::Starting => {
                if self.tracker.active_size() > 0 {
                    self.starting_deadline = None;
                    tracing::info!(pid, "capture confirmed live");
                    events.push(SupervisorEvent::Running { pid });
                    self.set_state(SupervisorState::Running);
                } else if self.starting_deadline.is_some_and(|d| now >= d) {
                    tracing::warn!(pid, "capture produced no data before startup timeout");
                    self.end_launch(now, FailureCause::StartupTimeout, events);
                } else {
                    self.publish();
                }
            }
            Ok(None) => self.publish(),
            Err(e) => {
                tracing::error!(pid, error = %e, "failed to poll capture process");
                self.end_launch(now, FailureCause::Unpollable(e.to_string()), events);
            }
        }
    }

    /// The current launch is over without a stop request. Kills the whole
    /// process group so nothing the capture tool forked outlives it.
    fn end_launch(&mut self, now: Instant, cause: FailureCause, events: &mut Vec<SupervisorEvent>) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        if let Err(e) = handle.child.kill() {
            tracing::warn!(pid = handle.pid, error = %e, "failed to kill capture process group");
        }
        self.starting_deadline = None;
        events.extend(
            self.tracker
                .finish_launch()
                .into_iter()
                .map(SupervisorEvent::Segment),
        );
        let stderr_tail = handle.child.stderr_tail();
        let ran_for = now.saturating_duration_since(handle.launch_time);
        tracing::debug!(
            pid = handle.pid,
            restart_count = handle.restart_count,
            "capture launch ended"
        );
        self.fail(now, handle.launch, cause, ran_for, stderr_tail, events);
    }

    fn fail(
        &mut self,
        now: Instant,
        launch: u32,
        cause: FailureCause,
        ran_for: Duration,
        stderr_tail: Vec<String>,
        events: &mut Vec<SupervisorEvent>,
    ) {
        tracing::warn!(launch, cause = %cause, ran_for_secs = ran_for.as_secs(), "capture failure");
        self.set_state(SupervisorState::Crashed);

        match self.policy.on_crash(now) {
            RestartDecision::Restart { attempt, delay } => {
                self.restart_at = Some(now + delay);
                events.push(SupervisorEvent::ProcessFailure {
                    launch,
                    cause,
                    ran_for,
                    restart: Some((attempt, delay)),
                    stderr_tail,
                });
                self.set_state(SupervisorState::Restarting);
            }
            RestartDecision::GiveUp { crashes } => {
                self.restart_at = None;
                events.push(SupervisorEvent::ProcessFailure {
                    launch,
                    cause,
                    ran_for,
                    restart: None,
                    stderr_tail,
                });
                tracing::error!(crashes, "capture supervisor failed");
                events.push(SupervisorEvent::Failed { crashes });
                self.set_state(SupervisorState::Failed);
            }
        }
    }

    /// Stop the capture process. Idempotent and valid from any state; a
    /// pending restart is dropped. Ends in Idle, except that Failed stays
    /// Failed.
    pub async fn stop(&mut self) -> Vec<SupervisorEvent> {
        let mut events = Vec::new();
        self.restart_at = None;
        self.starting_deadline = None;

        if let Some(mut handle) = self.handle.take() {
            self.set_state(SupervisorState::Stopping);
            let pid = handle.pid;
            tracing::info!(pid, "stopping capture process");

            if let Err(e) = handle.child.terminate() {
                tracing::warn!(pid, error = %e, "failed to signal capture process");
            }
            let mut exit = wait_for_exit(&mut handle.child, self.stop_timeout).await;
            let graceful = exit.is_some();
            if !graceful {
                tracing::warn!(
                    pid,
                    timeout_secs = self.stop_timeout.as_secs(),
                    "capture process ignored SIGTERM, killing"
                );
                if let Err(e) = handle.child.kill() {
                    tracing::warn!(pid, error = %e, "failed to kill capture process");
                }
                exit = wait_for_exit(&mut handle.child, KILL_GRACE).await;
            }
            tracing::info!(pid, graceful, exit = ?exit, "capture process stopped");
            events.push(SupervisorEvent::Stopped {
                pid,
                graceful,
                exit,
            });
        }

        events.extend(
            self.tracker
                .finish_launch()
                .into_iter()
                .map(SupervisorEvent::Segment),
        );

        if self.state == SupervisorState::Failed {
            self.publish();
        } else {
            self.set_state(SupervisorState::Idle);
        }
        events
    }
}

/// Poll until the child exits or `timeout` passes.
async fn wait_for_exit<C: CaptureChild>(child: &mut C, timeout: Duration) -> Option<ExitInfo> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(exit)) => return Some(exit),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(pid = child.pid(), error = %e, "failed to poll capture process");
                return None;
            }
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_POLL).await;
    }
}
