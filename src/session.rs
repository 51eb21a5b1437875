/// Capture session identity and the per-launch command line derived from it.
use crate::capture::LaunchSpec;
use crate::config::{CaptureConfig, RecorderConfig};
use crate::namer;
use chrono::{DateTime, Local, Timelike};
use std::path::PathBuf;
use std::time::Duration;

/// One continuous recording run. Immutable once the session is running.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub host_id: String,
    /// Whole-second start time; it is part of every segment name.
    pub start_time: DateTime<Local>,
    pub output_dir: PathBuf,
    pub segment_duration: Duration,
    pub target_bitrate: u64,
    pub resolution: (u32, u32),
    pub framerate: u32,
    pub extension: String,
}

impl Session {
    pub fn from_config(config: &RecorderConfig, host_id: String, start_time: DateTime<Local>) -> Self {
        let s = &config.session;
        Self {
            host_id,
            start_time: start_time.with_nanosecond(0).unwrap_or(start_time),
            output_dir: s.output_dir.clone(),
            segment_duration: Duration::from_secs(s.segment_seconds),
            target_bitrate: s.bitrate,
            resolution: (s.width, s.height),
            framerate: s.framerate,
            extension: s.extension.clone(),
        }
    }

    /// Build a session whose start time does not collide with any session of
    /// the same host already present in the output directory.
    pub fn claim(
        config: &RecorderConfig,
        host_id: String,
        now: DateTime<Local>,
    ) -> std::io::Result<Self> {
        let mut session = Self::from_config(config, host_id, now);
        while namer::session_prefix_in_use(
            &session.output_dir,
            &session.host_id,
            &session.start_time,
        )? {
            tracing::debug!(
                start = %namer::stamp(&session.start_time),
                "session prefix already in use, advancing start time"
            );
            session.start_time += chrono::Duration::seconds(1);
        }
        Ok(session)
    }

    pub fn segment_millis(&self) -> u128 {
        self.segment_duration.as_millis()
    }
}

/// Build the command arguments, replacing placeholders with session values.
pub fn build_args(capture: &CaptureConfig, session: &Session, output: &str) -> Vec<String> {
    let (width, height) = session.resolution;
    capture
        .args
        .iter()
        .map(|arg| {
            arg.replace("{segment_ms}", &session.segment_millis().to_string())
                .replace("{width}", &width.to_string())
                .replace("{height}", &height.to_string())
                .replace("{fps}", &session.framerate.to_string())
                .replace("{bitrate}", &session.target_bitrate.to_string())
                .replace("{profile}", &capture.profile)
                .replace("{output}", output)
        })
        .collect()
}

/// Everything needed to launch the capture process for launch number `launch`.
pub fn launch_spec(capture: &CaptureConfig, session: &Session, launch: u32) -> LaunchSpec {
    let output_template = namer::staging_template(session, launch);
    let args = build_args(capture, session, &output_template.to_string_lossy());
    LaunchSpec {
        command: capture.command.clone(),
        args,
        output_template,
        launch,
    }
}
