use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from segcap.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct RecorderConfig {
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    pub supervisor: SupervisorConfig,
    pub disk: DiskConfig,
    pub schedule: ScheduleConfig,
    pub status: StatusConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Host identity used in segment names. Falls back to the machine hostname.
    pub host_id: Option<String>,
    pub output_dir: PathBuf,
    pub segment_seconds: u64,
    pub bitrate: u64,
    pub width: u32,
    pub height: u32,
    pub framerate: u32,
    pub extension: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub command: String,
    /// Argument template. Placeholders: {segment_ms}, {width}, {height},
    /// {fps}, {bitrate}, {profile}, {output}.
    pub args: Vec<String>,
    pub profile: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_ms: u64,
    pub startup_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub backoff_initial_secs: u64,
    pub backoff_max_secs: u64,
    pub stderr_tail_lines: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiskConfig {
    pub check_interval_secs: u64,
    pub low_usage_percent: u8,
    pub critical_usage_percent: u8,
    /// Absolute free-space floor; going under it also counts as critical.
    pub min_free_bytes: u64,
}

/// Daily recording window in local hours, both ends inclusive.
/// Recording is continuous when either bound is unset.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct ScheduleConfig {
    pub start_hour: Option<u32>,
    pub end_hour: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct StatusConfig {
    /// Status file path. Defaults to `{output_dir}/segcap.status`.
    pub file: Option<PathBuf>,
    /// Stop-request file. Defaults to `{output_dir}/STOP`.
    pub stop_file: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_id: None,
            output_dir: PathBuf::from("recordings"),
            segment_seconds: 120,
            bitrate: 4_000_000,
            width: 1640,
            height: 1232,
            framerate: 24,
            extension: "h264".to_string(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let args = [
            "-n",
            "-t",
            "0",
            "--segment",
            "{segment_ms}",
            "--inline",
            "--width",
            "{width}",
            "--height",
            "{height}",
            "--framerate",
            "{fps}",
            "--bitrate",
            "{bitrate}",
            "--profile",
            "{profile}",
            "-o",
            "{output}",
        ];
        Self {
            command: "rpicam-vid".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            profile: "high".to_string(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            startup_timeout_secs: 15,
            stop_timeout_secs: 5,
            max_restarts: 5,
            restart_window_secs: 600,
            backoff_initial_secs: 2,
            backoff_max_secs: 60,
            stderr_tail_lines: 20,
        }
    }
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 30,
            low_usage_percent: 85,
            critical_usage_percent: 90,
            min_free_bytes: 0,
        }
    }
}

impl SupervisorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

impl RecorderConfig {
    /// Resolved status file location.
    pub fn status_path(&self) -> PathBuf {
        self.status
            .file
            .clone()
            .unwrap_or_else(|| self.session.output_dir.join("segcap.status"))
    }

    /// Resolved stop-request file location.
    pub fn stop_file_path(&self) -> PathBuf {
        self.status
            .stop_file
            .clone()
            .unwrap_or_else(|| self.session.output_dir.join("STOP"))
    }

    /// Apply command-line overrides on top of file values.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(host) = &overrides.host {
            self.session.host_id = Some(host.clone());
        }
        if let Some(out) = &overrides.output_dir {
            self.session.output_dir = out.clone();
        }
        if let Some(secs) = overrides.segment_seconds {
            self.session.segment_seconds = secs;
        }
        if let Some(bitrate) = overrides.bitrate {
            self.session.bitrate = bitrate;
        }
        if let Some(width) = overrides.width {
            self.session.width = width;
        }
        if let Some(height) = overrides.height {
            self.session.height = height;
        }
        if let Some(fps) = overrides.framerate {
            self.session.framerate = fps;
        }
    }

    /// Host identity for segment names: the configured id, else the hostname.
    pub fn resolve_host_id(&self) -> Result<String, ConfigError> {
        if let Some(host) = &self.session.host_id {
            return Ok(host.clone());
        }
        let name = nix::unistd::gethostname().map_err(|e| ConfigError::Invalid {
            field: "session.host_id",
            reason: format!("not set and hostname lookup failed: {e}"),
        })?;
        name.into_string().map_err(|_| ConfigError::Invalid {
            field: "session.host_id",
            reason: "not set and hostname is not valid UTF-8".to_string(),
        })
    }

    /// Check value ranges. Does not touch the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.session;
        if let Some(host) = &s.host_id {
            validate_host_id(host)?;
        }
        positive("session.segment_seconds", s.segment_seconds)?;
        positive("session.bitrate", s.bitrate)?;
        positive("session.width", s.width as u64)?;
        positive("session.height", s.height as u64)?;
        positive("session.framerate", s.framerate as u64)?;
        if s.extension.is_empty() || !s.extension.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid(
                "session.extension",
                format!("must be a non-empty alphanumeric extension, got {:?}", s.extension),
            ));
        }

        if self.capture.command.trim().is_empty() {
            return Err(invalid("capture.command", "must not be empty"));
        }
        if !self.capture.args.iter().any(|a| a.contains("{output}")) {
            return Err(invalid(
                "capture.args",
                "must contain an {output} placeholder",
            ));
        }

        let sup = &self.supervisor;
        positive("supervisor.poll_interval_ms", sup.poll_interval_ms)?;
        positive("supervisor.startup_timeout_secs", sup.startup_timeout_secs)?;
        positive("supervisor.restart_window_secs", sup.restart_window_secs)?;
        if sup.backoff_initial_secs > sup.backoff_max_secs {
            return Err(invalid(
                "supervisor.backoff_initial_secs",
                "must not exceed supervisor.backoff_max_secs",
            ));
        }

        let disk = &self.disk;
        positive("disk.check_interval_secs", disk.check_interval_secs)?;
        if disk.low_usage_percent == 0
            || disk.low_usage_percent > disk.critical_usage_percent
            || disk.critical_usage_percent > 100
        {
            return Err(invalid(
                "disk",
                format!(
                    "need 0 < low_usage_percent <= critical_usage_percent <= 100, got {} / {}",
                    disk.low_usage_percent, disk.critical_usage_percent
                ),
            ));
        }

        match (self.schedule.start_hour, self.schedule.end_hour) {
            (None, None) => {}
            (Some(start), Some(end)) if start < 24 && end < 24 => {}
            (Some(_), Some(_)) => {
                return Err(invalid("schedule", "hours must be in 0..=23"));
            }
            _ => {
                return Err(invalid(
                    "schedule",
                    "start_hour and end_hour must be set together",
                ));
            }
        }

        Ok(())
    }
}

/// Host ids end up in file names, so keep them to a safe, unambiguous charset.
pub fn validate_host_id(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(invalid("session.host_id", "must not be empty"));
    }
    if host.starts_with('.') {
        return Err(invalid("session.host_id", "must not start with '.'"));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(invalid(
            "session.host_id",
            format!("{host:?} may only contain [A-Za-z0-9._-]"),
        ));
    }
    Ok(())
}

/// Create the output directory if needed and prove it is writable.
pub fn ensure_writable_dir(dir: &Path) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::OutputDir {
        path: dir.to_path_buf(),
        source: e,
    })?;
    tempfile::tempfile_in(dir).map_err(|e| ConfigError::OutputDir {
        path: dir.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Values given on the command line.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub segment_seconds: Option<u64>,
    pub bitrate: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<u32>,
}

/// Load the config file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<RecorderConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(RecorderConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors raised while loading or validating configuration.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
    OutputDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid configuration: {field} {reason}")
            }
            ConfigError::OutputDir { path, source } => {
                write!(
                    f,
                    "output directory {} is not writable: {source}",
                    path.display()
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
            ConfigError::OutputDir { source, .. } => Some(source),
        }
    }
}
