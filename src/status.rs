/// Status file: the running recorder writes its state as JSON on every
/// transition so `segcap status` and `segcap stop` can find it.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::guard::DiskLevel;
use crate::supervisor::SupervisorState;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The JSON payload written to the status file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusData {
    /// The recorder process; `segcap stop` signals this pid.
    pub pid: u32,
    pub capture_pid: Option<u32>,
    pub state: SupervisorState,
    /// Outside the scheduled recording hours.
    pub paused: bool,
    pub host_id: String,
    pub session_start: DateTime<Local>,
    pub output_dir: PathBuf,
    pub current_segment: Option<PathBuf>,
    pub segment_index: Option<u64>,
    pub segments_recorded: u64,
    pub restart_count: u32,
    pub disk_level: Option<DiskLevel>,
    pub disk_used_percent: Option<f64>,
    pub last_update: DateTime<Utc>,
}

impl StatusData {
    /// Seconds since the session started, as of `now`.
    pub fn uptime_secs(&self, now: DateTime<Local>) -> i64 {
        (now - self.session_start).num_seconds().max(0)
    }
}

/// Manages the status file lifecycle.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Atomically write status data to the status file.
    ///
    /// Writes to a temporary file in the same directory, then renames
    /// to ensure readers never see a partial write.
    pub fn write(&self, data: &StatusData) -> Result<(), StatusError> {
        let json =
            serde_json::to_string_pretty(data).map_err(|e| StatusError::Serialize { source: e })?;

        let dir = self.path.parent().unwrap_or(Path::new("."));
        let tmp_path = dir.join(format!(".segcap.status.tmp.{}", std::process::id()));

        std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| StatusError::Rename {
            from: tmp_path,
            to: self.path.clone(),
            source: e,
        })?;

        Ok(())
    }

    /// Read the status file. `Ok(None)` when no recorder has written one.
    pub fn read(&self) -> Result<Option<StatusData>, StatusError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| StatusError::Parse {
                path: self.path.clone(),
                source: e,
            })
    }

    /// Remove the status file (on clean shutdown).
    pub fn remove(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Parse { path, source } => {
                write!(f, "corrupt status file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Parse { source, .. } => Some(source),
        }
    }
}
