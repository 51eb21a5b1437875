//! Session controller: owns the capture supervisor and the disk guard and
//! drives both from a single control loop task.
//!
//! The loop multiplexes three things with `select!`: a shutdown request from
//! the [`SessionHandle`], the liveness poll, and the disk check. Everything
//! it observes is reported as a [`SessionEvent`], logged and delivered on a
//! bounded channel.

use crate::capture::{CommandLauncher, Launcher};
use crate::config::{self, ConfigError, RecorderConfig};
use crate::guard::{
    DeletedSegment, DiskGuard, DiskLevel, DiskReport, Fs2Probe, ReclaimOutcome, SpaceProbe,
};
use crate::namer;
use crate::schedule::ActiveHours;
use crate::segments::SegmentEvent;
use crate::session::Session;
use crate::status::{StatusData, StatusFile};
use crate::supervisor::{Supervisor, SupervisorEvent, SupervisorSnapshot, SupervisorState};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const EVENT_CAPACITY: usize = 256;
/// Upper bound on one disk check including reclaim.
const DISK_CHECK_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Everything the controller reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Supervisor(SupervisorEvent),
    /// Usage crossed the low or critical watermark.
    DiskPressure {
        level: DiskLevel,
        used_percent: f64,
        free_bytes: u64,
    },
    Reclaimed {
        deleted: Vec<DeletedSegment>,
        freed_bytes: u64,
        failures: usize,
    },
    DiskCheckFailed {
        error: String,
    },
    /// Still critical with nothing left to delete. Ends the session.
    DiskExhausted {
        needed: u64,
        freed: u64,
    },
    /// Left the scheduled recording hours.
    Paused,
    Resumed,
}

impl SessionEvent {
    /// Stable machine-readable name, used as the `event` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Supervisor(event) => match event {
                SupervisorEvent::Launched { .. } => "launched",
                SupervisorEvent::Running { .. } => "running",
                SupervisorEvent::Segment(SegmentEvent::Opened { .. }) => "segment_opened",
                SupervisorEvent::Segment(SegmentEvent::Closed(_)) => "segment_closed",
                SupervisorEvent::Segment(SegmentEvent::AdoptFailed { .. }) => "adopt_failed",
                SupervisorEvent::ProcessFailure {
                    restart: Some(_), ..
                } => "transient_process_failure",
                SupervisorEvent::ProcessFailure { restart: None, .. } => "process_failure",
                SupervisorEvent::Failed { .. } => "fatal_process_failure",
                SupervisorEvent::Stopped { .. } => "stopped",
            },
            SessionEvent::DiskPressure { .. } => "disk_pressure",
            SessionEvent::Reclaimed { .. } => "reclaimed",
            SessionEvent::DiskCheckFailed { .. } => "disk_check_failed",
            SessionEvent::DiskExhausted { .. } => "disk_exhausted",
            SessionEvent::Paused => "paused",
            SessionEvent::Resumed => "resumed",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SessionEvent::Supervisor(event) => match event {
                SupervisorEvent::Segment(SegmentEvent::Closed(_)) => Severity::Debug,
                SupervisorEvent::Launched { .. }
                | SupervisorEvent::Running { .. }
                | SupervisorEvent::Segment(SegmentEvent::Opened { .. })
                | SupervisorEvent::Stopped { .. } => Severity::Info,
                SupervisorEvent::Segment(SegmentEvent::AdoptFailed { .. })
                | SupervisorEvent::ProcessFailure { .. } => Severity::Warning,
                SupervisorEvent::Failed { .. } => Severity::Error,
            },
            SessionEvent::Reclaimed { .. } | SessionEvent::Paused | SessionEvent::Resumed => {
                Severity::Info
            }
            SessionEvent::DiskPressure { .. } | SessionEvent::DiskCheckFailed { .. } => {
                Severity::Warning
            }
            SessionEvent::DiskExhausted { .. } => Severity::Error,
        }
    }
}

impl std::fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::Supervisor(event) => match event {
                SupervisorEvent::Launched { pid, launch } => {
                    write!(f, "capture launched (pid {pid}, launch {launch})")
                }
                SupervisorEvent::Running { pid } => write!(f, "capture running (pid {pid})"),
                SupervisorEvent::Segment(SegmentEvent::Opened { index, path }) => {
                    write!(f, "segment {index} opened: {}", path.display())
                }
                SupervisorEvent::Segment(SegmentEvent::Closed(file)) => write!(
                    f,
                    "segment {} closed ({} bytes)",
                    file.name.index, file.size_bytes
                ),
                SupervisorEvent::Segment(SegmentEvent::AdoptFailed { staging, error }) => {
                    write!(f, "could not adopt {}: {error}", staging.display())
                }
                SupervisorEvent::ProcessFailure {
                    launch,
                    cause,
                    ran_for,
                    restart,
                    ..
                } => {
                    write!(
                        f,
                        "launch {launch} failed after {}s: {cause}",
                        ran_for.as_secs()
                    )?;
                    match restart {
                        Some((attempt, delay)) => write!(
                            f,
                            "; restart {attempt} in {}ms",
                            delay.as_millis()
                        ),
                        None => write!(f, "; no restarts left"),
                    }
                }
                SupervisorEvent::Failed { crashes } => {
                    write!(f, "capture failed permanently after {crashes} crashes")
                }
                SupervisorEvent::Stopped {
                    pid,
                    graceful,
                    exit,
                } => {
                    let how = if *graceful { "terminated" } else { "killed" };
                    write!(f, "capture stopped (pid {pid}, {how}")?;
                    match exit {
                        Some(exit) => write!(f, ", {exit})"),
                        None => write!(f, ")"),
                    }
                }
            },
            SessionEvent::DiskPressure {
                level,
                used_percent,
                free_bytes,
            } => write!(
                f,
                "disk {level:?}: {used_percent:.1}% used, {free_bytes} bytes free"
            ),
            SessionEvent::Reclaimed {
                deleted,
                freed_bytes,
                failures,
            } => {
                write!(
                    f,
                    "reclaimed {freed_bytes} bytes from {} segments",
                    deleted.len()
                )?;
                if *failures > 0 {
                    write!(f, " ({failures} could not be deleted)")?;
                }
                Ok(())
            }
            SessionEvent::DiskCheckFailed { error } => write!(f, "disk check failed: {error}"),
            SessionEvent::DiskExhausted { needed, freed } => write!(
                f,
                "disk exhausted: needed {needed} bytes, freed {freed}"
            ),
            SessionEvent::Paused => write!(f, "outside recording hours, capture paused"),
            SessionEvent::Resumed => write!(f, "recording hours started, capture resumed"),
        }
    }
}

fn log_event(event: &SessionEvent) {
    let kind = event.kind();
    if let SessionEvent::Supervisor(SupervisorEvent::ProcessFailure { stderr_tail, .. }) = event {
        if !stderr_tail.is_empty() {
            tracing::warn!(event = kind, stderr = %stderr_tail.join("\n"), "{event}");
            return;
        }
    }
    match event.severity() {
        Severity::Debug => tracing::debug!(event = kind, "{event}"),
        Severity::Info => tracing::info!(event = kind, "{event}"),
        Severity::Warning => tracing::warn!(event = kind, "{event}"),
        Severity::Error => tracing::error!(event = kind, "{event}"),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SupervisorState,
    pub paused: bool,
    pub current_segment: Option<PathBuf>,
    pub segment_index: Option<u64>,
    pub uptime: Duration,
    pub restart_count: u32,
}

/// What a finished session leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub host_id: String,
    pub session_start: DateTime<Local>,
    pub segments_recorded: u64,
    pub restart_count: u32,
    pub uptime: Duration,
    pub final_state: SupervisorState,
}

/// Errors that end a session or keep it from starting. Cheap to clone so a
/// finished handle can report the same failure on every call.
#[derive(Debug, Clone)]
pub enum SessionError {
    Config(Arc<ConfigError>),
    Io {
        context: &'static str,
        source: Arc<std::io::Error>,
    },
    /// Restart budget exhausted.
    FatalProcess { crashes: u32 },
    DiskExhausted { needed: u64, freed: u64 },
    /// The control loop task panicked or was cancelled.
    Join(String),
}

impl SessionError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionError::Config(_) => 1,
            SessionError::Io { .. }
            | SessionError::FatalProcess { .. }
            | SessionError::DiskExhausted { .. }
            | SessionError::Join(_) => 2,
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Config(e) => write!(f, "{e}"),
            SessionError::Io { context, source } => write!(f, "{context}: {source}"),
            SessionError::FatalProcess { crashes } => write!(
                f,
                "capture process failed {crashes} times in the restart window, giving up"
            ),
            SessionError::DiskExhausted { needed, freed } => write!(
                f,
                "disk exhausted: needed {needed} bytes but only {freed} could be reclaimed"
            ),
            SessionError::Join(e) => write!(f, "control loop ended abnormally: {e}"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Config(e) => Some(e.as_ref()),
            SessionError::Io { source, .. } => Some(source.as_ref()),
            SessionError::FatalProcess { .. }
            | SessionError::DiskExhausted { .. }
            | SessionError::Join(_) => None,
        }
    }
}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        SessionError::Config(Arc::new(e))
    }
}

/// Caller's side of a running session.
pub struct SessionHandle {
    session: Arc<Session>,
    snapshot: watch::Receiver<SupervisorSnapshot>,
    paused: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    events: Option<mpsc::Receiver<SessionEvent>>,
    task: Option<JoinHandle<Result<(), SessionError>>>,
    /// How the control loop ended, once joined.
    outcome: Option<Result<(), SessionError>>,
    started: Instant,
    finished: Option<Instant>,
}

impl SessionHandle {
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn status(&self) -> SessionStatus {
        let snapshot = self.snapshot.borrow();
        SessionStatus {
            state: snapshot.state,
            paused: *self.paused.borrow(),
            current_segment: snapshot.current_segment.clone(),
            segment_index: snapshot.segment_index,
            uptime: self.uptime(),
            restart_count: snapshot.restart_count,
        }
    }

    /// The event stream. Can be taken once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events.take()
    }

    /// Stop the capture process and end the session. Idempotent: later
    /// calls return the same outcome as the first, failure included.
    pub async fn stop(&mut self) -> Result<SessionSummary, SessionError> {
        self.shutdown.send_replace(true);
        self.join().await
    }

    /// Wait for the session to end on its own (fatal failure or disk
    /// exhaustion). Cancel safe.
    pub async fn wait(&mut self) -> Result<SessionSummary, SessionError> {
        self.join().await
    }

    async fn join(&mut self) -> Result<SessionSummary, SessionError> {
        if let Some(task) = self.task.as_mut() {
            let joined = task.await;
            self.task = None;
            self.finished = Some(Instant::now());
            self.outcome = Some(match joined {
                Ok(result) => result,
                Err(e) => Err(SessionError::Join(e.to_string())),
            });
        }
        match &self.outcome {
            Some(Err(e)) => Err(e.clone()),
            _ => Ok(self.summary()),
        }
    }

    fn uptime(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started)
    }

    fn summary(&self) -> SessionSummary {
        let snapshot = self.snapshot.borrow();
        SessionSummary {
            host_id: self.session.host_id.clone(),
            session_start: self.session.start_time,
            segments_recorded: snapshot.next_index,
            restart_count: snapshot.restart_count,
            uptime: self.uptime(),
            final_state: snapshot.state,
        }
    }
}

/// Start a recording session with the real capture command and filesystem.
pub fn start(config: RecorderConfig) -> Result<SessionHandle, SessionError> {
    let launcher = CommandLauncher::new(config.supervisor.stderr_tail_lines);
    start_with(config, launcher, Fs2Probe)
}

/// Validate `config`, claim a session and spawn the control loop.
/// Must be called from within a tokio runtime.
pub fn start_with<L: Launcher, P: SpaceProbe>(
    config: RecorderConfig,
    launcher: L,
    probe: P,
) -> Result<SessionHandle, SessionError> {
    let (control, mut handle) = prepare(config, launcher, probe)?;
    handle.task = Some(tokio::spawn(control.run()));
    Ok(handle)
}

fn prepare<L: Launcher, P: SpaceProbe>(
    config: RecorderConfig,
    launcher: L,
    probe: P,
) -> Result<(ControlLoop<L, P>, SessionHandle), SessionError> {
    config.validate()?;
    let host_id = config.resolve_host_id()?;
    config::validate_host_id(&host_id)?;
    config::ensure_writable_dir(&config.session.output_dir)?;

    let session = Session::claim(&config, host_id, Local::now()).map_err(|e| SessionError::Io {
        context: "failed to scan output directory",
        source: Arc::new(e),
    })?;
    let session = Arc::new(session);

    let supervisor = Supervisor::new(
        launcher,
        Arc::clone(&session),
        config.capture.clone(),
        &config.supervisor,
    );
    let guard = DiskGuard::new(
        session.output_dir.clone(),
        session.extension.clone(),
        &config.disk,
        probe,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (paused_tx, paused_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CAPACITY);

    let handle = SessionHandle {
        session: Arc::clone(&session),
        snapshot: supervisor.subscribe(),
        paused: paused_rx,
        shutdown: shutdown_tx,
        events: Some(events_rx),
        task: None,
        outcome: None,
        started: Instant::now(),
        finished: None,
    };
    let control = ControlLoop {
        supervisor,
        guard: Arc::new(guard),
        schedule: ActiveHours::from_config(&config.schedule),
        status_file: StatusFile::new(config.status_path()),
        last_status: None,
        disk: None,
        paused: paused_tx,
        events: events_tx,
        shutdown: shutdown_rx,
        poll_interval: config.supervisor.poll_interval(),
        disk_interval: Duration::from_secs(config.disk.check_interval_secs),
        disk_timeout: DISK_CHECK_TIMEOUT,
        session,
    };
    Ok((control, handle))
}

/// Result of one blocking disk pass.
struct Sweep {
    before: DiskReport,
    reclaim: Option<Reclaim>,
}

struct Reclaim {
    needed: u64,
    outcome: ReclaimOutcome,
    after: DiskReport,
}

fn sweep<P: SpaceProbe>(guard: &DiskGuard<P>, protected: Option<&Path>) -> std::io::Result<Sweep> {
    let before = guard.check()?;
    if before.level != DiskLevel::Critical {
        return Ok(Sweep {
            before,
            reclaim: None,
        });
    }
    let needed = guard.bytes_needed(&before.usage);
    let outcome = guard.reclaim(needed, protected)?;
    let after = guard.check()?;
    Ok(Sweep {
        before,
        reclaim: Some(Reclaim {
            needed,
            outcome,
            after,
        }),
    })
}

struct ControlLoop<L: Launcher, P: SpaceProbe> {
    supervisor: Supervisor<L>,
    guard: Arc<DiskGuard<P>>,
    session: Arc<Session>,
    schedule: Option<ActiveHours>,
    status_file: StatusFile,
    last_status: Option<StatusData>,
    disk: Option<DiskReport>,
    paused: watch::Sender<bool>,
    events: mpsc::Sender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    disk_interval: Duration,
    disk_timeout: Duration,
}

impl<L: Launcher, P: SpaceProbe> ControlLoop<L, P> {
    async fn run(mut self) -> Result<(), SessionError> {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut disk = tokio::time::interval(self.disk_interval);
        disk.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            host = %self.session.host_id,
            start = %namer::stamp(&self.session.start_time),
            output_dir = %self.session.output_dir.display(),
            "session started"
        );

        let result = loop {
            let step = tokio::select! {
                biased;
                // Err: the handle was dropped, which also means stop
                _ = self.shutdown.changed() => break Ok(()),
                _ = poll.tick() => self.poll(Local::now(), Instant::now()).await,
                _ = disk.tick() => self.check_disk().await,
            };
            self.write_status();
            if let Err(e) = step {
                break Err(e);
            }
        };

        let events = self.supervisor.stop().await;
        self.emit_supervisor(events);
        self.write_status();

        match &result {
            Ok(()) => {
                self.status_file.remove();
                tracing::info!(
                    segments = self.supervisor.snapshot().next_index,
                    "session stopped"
                );
            }
            Err(e) => tracing::error!(error = %e, "session ended"),
        }
        result
    }

    /// Schedule check plus one supervisor tick.
    async fn poll(&mut self, local: DateTime<Local>, now: Instant) -> Result<(), SessionError> {
        let in_hours = self
            .schedule
            .map_or(true, |hours| hours.is_active_at(&local));
        if !in_hours {
            let already_paused = *self.paused.borrow();
            if !already_paused {
                self.paused.send_replace(true);
                let events = self.supervisor.stop().await;
                self.emit_supervisor(events);
                self.emit(SessionEvent::Paused);
            }
            return Ok(());
        }
        if self.paused.send_replace(false) {
            self.emit(SessionEvent::Resumed);
        }

        let mut events = Vec::new();
        if self.supervisor.state() == SupervisorState::Idle {
            events.extend(self.supervisor.start(now));
        }
        events.extend(self.supervisor.tick(now));
        let crashes = events.iter().find_map(|e| match e {
            SupervisorEvent::Failed { crashes } => Some(*crashes),
            _ => None,
        });
        self.emit_supervisor(events);

        if self.supervisor.state() == SupervisorState::Failed {
            return Err(SessionError::FatalProcess {
                crashes: crashes.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Sample disk usage and reclaim when critical. The blocking filesystem
    /// work runs off the runtime threads with a deadline.
    async fn check_disk(&mut self) -> Result<(), SessionError> {
        let guard = Arc::clone(&self.guard);
        let protected = self.supervisor.snapshot().current_segment;
        let job = tokio::task::spawn_blocking(move || sweep(&guard, protected.as_deref()));

        let sweep = match tokio::time::timeout(self.disk_timeout, job).await {
            Ok(Ok(Ok(sweep))) => sweep,
            Ok(Ok(Err(e))) => {
                self.emit(SessionEvent::DiskCheckFailed {
                    error: e.to_string(),
                });
                return Ok(());
            }
            Ok(Err(e)) => {
                self.emit(SessionEvent::DiskCheckFailed {
                    error: e.to_string(),
                });
                return Ok(());
            }
            Err(_) => {
                self.emit(SessionEvent::DiskCheckFailed {
                    error: format!("timed out after {}ms", self.disk_timeout.as_millis()),
                });
                return Ok(());
            }
        };

        self.disk = Some(sweep.before);
        if sweep.before.level != DiskLevel::Ok {
            self.emit(SessionEvent::DiskPressure {
                level: sweep.before.level,
                used_percent: sweep.before.usage.used_percent(),
                free_bytes: sweep.before.usage.free_bytes,
            });
        }

        let Some(reclaim) = sweep.reclaim else {
            return Ok(());
        };
        self.disk = Some(reclaim.after);
        let freed = reclaim.outcome.freed_bytes;
        if !reclaim.outcome.deleted.is_empty() || !reclaim.outcome.failures.is_empty() {
            self.emit(SessionEvent::Reclaimed {
                failures: reclaim.outcome.failures.len(),
                deleted: reclaim.outcome.deleted,
                freed_bytes: freed,
            });
        }

        if reclaim.after.level == DiskLevel::Critical && freed < reclaim.needed {
            self.emit(SessionEvent::DiskExhausted {
                needed: reclaim.needed,
                freed,
            });
            return Err(SessionError::DiskExhausted {
                needed: reclaim.needed,
                freed,
            });
        }
        Ok(())
    }

    fn emit_supervisor(&self, events: Vec<SupervisorEvent>) {
        for event in events {
            self.emit(SessionEvent::Supervisor(event));
        }
    }

    fn emit(&self, event: SessionEvent) {
        log_event(&event);
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(event = event.kind(), "event channel full, event not delivered");
            }
            // Nobody is listening; the event was logged above
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Rewrite the status file when anything in it changed.
    fn write_status(&mut self) {
        let snapshot = self.supervisor.snapshot();
        let paused = *self.paused.borrow();
        let mut data = StatusData {
            pid: std::process::id(),
            capture_pid: snapshot.pid,
            state: snapshot.state,
            paused,
            host_id: self.session.host_id.clone(),
            session_start: self.session.start_time,
            output_dir: self.session.output_dir.clone(),
            current_segment: snapshot.current_segment,
            segment_index: snapshot.segment_index,
            segments_recorded: snapshot.next_index,
            restart_count: snapshot.restart_count,
            disk_level: self.disk.map(|d| d.level),
            disk_used_percent: self.disk.map(|d| d.usage.used_percent()),
            last_update: Utc::now(),
        };
        if let Some(prev) = &self.last_status {
            let now = data.last_update;
            data.last_update = prev.last_update;
            if *prev == data {
                return;
            }
            data.last_update = now;
        }
        if let Err(e) = self.status_file.write(&data) {
            tracing::warn!(error = %e, "failed to write status file");
        }
        self.last_status = Some(data);
    }
}
