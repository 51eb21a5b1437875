//! The external capture process, seen through a narrow interface.
//!
//! The supervisor only needs to start a process, ask whether it is still
//! alive, and terminate it. `CommandLauncher` does that with a real OS
//! process; tests plug in scripted children.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Command line for one launch of the capture process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Output path template with a `%04d` rolling counter.
    pub output_template: PathBuf,
    /// Launch number within the session, starting at 0.
    pub launch: u32,
}

/// How a capture process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code (None if killed by signal).
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(sig)) => write!(f, "killed by signal {sig}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// A running capture process.
pub trait CaptureChild: Send + 'static {
    fn pid(&self) -> u32;

    /// Non-blocking exit check.
    fn try_wait(&mut self) -> std::io::Result<Option<ExitInfo>>;

    /// Ask the process to finish its current segment and exit.
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Force the process down.
    fn kill(&mut self) -> std::io::Result<()>;

    /// Most recent diagnostic output lines, oldest first.
    fn stderr_tail(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Starts capture processes.
pub trait Launcher: Send + 'static {
    type Child: CaptureChild;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<Self::Child, LaunchError>;
}

/// Spawns the capture command as a real OS process.
///
/// Each child gets its own process group (via `process_group(0)`) so that
/// termination reaches anything the capture tool forks.
pub struct CommandLauncher {
    tail_lines: usize,
}

impl CommandLauncher {
    pub fn new(tail_lines: usize) -> Self {
        Self { tail_lines }
    }
}

impl Launcher for CommandLauncher {
    type Child = ProcessChild;

    fn launch(&mut self, spec: &LaunchSpec) -> Result<ProcessChild, LaunchError> {
        tracing::info!(
            command = %spec.command,
            args = ?spec.args,
            launch = spec.launch,
            "spawning capture process"
        );

        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0) // New process group for clean kill
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LaunchError::Spawn {
                command: spec.command.clone(),
                source: e,
            })?;

        let pid = child.id().ok_or(LaunchError::ExitedBeforeStart)?;
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, pid, "stdout", None, 0));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(
                stderr,
                pid,
                "stderr",
                Some(Arc::clone(&tail)),
                self.tail_lines,
            ));
        }

        tracing::info!(pid, "capture process started");
        Ok(ProcessChild { child, pid, tail })
    }
}

/// Relay child output into the log, keeping the last `keep` lines if asked.
async fn forward_lines<R: AsyncRead + Unpin>(
    stream: R,
    pid: u32,
    stream_name: &'static str,
    tail: Option<Arc<Mutex<VecDeque<String>>>>,
    keep: usize,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                tracing::debug!(pid, stream = stream_name, "{}", line.trim_end());
                if let Some(tail) = &tail {
                    if keep == 0 {
                        continue;
                    }
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == keep {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(pid, stream = stream_name, error = %e, "stopped reading capture output");
                break;
            }
        }
    }
}

/// A capture process spawned by [`CommandLauncher`].
pub struct ProcessChild {
    child: Child,
    pid: u32,
    tail: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessChild {
    fn signal_group(&self, signal: Signal) -> std::io::Result<()> {
        let pgid = i32::try_from(self.pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        match killpg(Pid::from_raw(pgid), signal) {
            Ok(()) => Ok(()),
            // Group already gone
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(std::io::Error::from(e)),
        }
    }
}

impl CaptureChild for ProcessChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from_status))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        self.signal_group(Signal::SIGTERM)
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.signal_group(Signal::SIGKILL)?;
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stderr_tail(&self) -> Vec<String> {
        match self.tail.lock() {
            Ok(tail) => tail.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// True if a process with this pid exists.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match nix::sys::signal::kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Errors from starting the capture process.
#[derive(Debug)]
pub enum LaunchError {
    /// Failed to spawn the capture subprocess.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The process was reaped before its pid could be read.
    ExitedBeforeStart,
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { command, source } => {
                write!(f, "failed to spawn capture process {command}: {source}")
            }
            LaunchError::ExitedBeforeStart => {
                write!(f, "capture process exited before it could be tracked")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::ExitedBeforeStart => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh(script: &str) -> LaunchSpec {
        LaunchSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            output_template: PathBuf::from("/tmp/unused_%04d.h264"),
            launch: 0,
        }
    }

    async fn wait_exit(child: &mut ProcessChild) -> ExitInfo {
        for _ in 0..200 {
            if let Some(exit) = child.try_wait().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("child did not exit");
    }

    #[tokio::test]
    async fn test_launch_reports_exit_code() {
        let mut launcher = CommandLauncher::new(5);
        let mut child = launcher.launch(&sh("exit 42")).unwrap();
        assert!(child.pid() > 0);
        let exit = wait_exit(&mut child).await;
        assert_eq!(exit.code, Some(42));
        assert_eq!(exit.to_string(), "exit code 42");
    }

    #[tokio::test]
    async fn test_terminate_stops_long_running_child() {
        let mut launcher = CommandLauncher::new(5);
        let mut child = launcher.launch(&sh("sleep 30")).unwrap();
        assert!(child.try_wait().unwrap().is_none());
        assert!(pid_alive(child.pid()));

        child.terminate().unwrap();
        let exit = wait_exit(&mut child).await;
        assert_eq!(exit.signal, Some(15));
        assert!(!pid_alive(child.pid()));
    }

    #[tokio::test]
    async fn test_kill_after_exit_is_harmless() {
        let mut launcher = CommandLauncher::new(5);
        let mut child = launcher.launch(&sh("true")).unwrap();
        wait_exit(&mut child).await;
        child.kill().unwrap();
        child.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_stderr_tail_keeps_last_lines() {
        let mut launcher = CommandLauncher::new(2);
        let mut child = launcher
            .launch(&sh("echo one >&2; echo two >&2; echo three >&2"))
            .unwrap();
        wait_exit(&mut child).await;
        // Give the reader task a moment to drain the pipe
        for _ in 0..40 {
            if child.stderr_tail() == vec!["two", "three"] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(child.stderr_tail(), vec!["two", "three"]);
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let mut launcher = CommandLauncher::new(5);
        let spec = LaunchSpec {
            command: "nonexistent-binary-xyz".to_string(),
            ..sh("")
        };
        let err = launcher.launch(&spec).err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }
}
