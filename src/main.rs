mod capture;
mod config;
mod controller;
mod guard;
mod namer;
mod restart;
mod schedule;
mod segments;
mod session;
mod signals;
mod status;
mod supervisor;

use clap::{Args, Parser, Subcommand};
use config::{ConfigOverrides, RecorderConfig};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use signals::SignalHandler;
use status::{StatusData, StatusFile};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const EXIT_OK: u8 = 0;
const EXIT_CONFIG: u8 = 1;
const EXIT_FATAL: u8 = 2;

/// How often the STOP file is checked.
const STOP_FILE_POLL: Duration = Duration::from_secs(1);
/// Extra time `segcap stop` allows beyond the recorder's own stop timeout.
const STOP_WAIT_MARGIN: Duration = Duration::from_secs(10);

/// Records a camera feed as a continuous series of fixed-length segment
/// files: restarts the capture process when it dies and deletes the oldest
/// segments when the disk fills up.
#[derive(Parser, Debug)]
#[command(name = "segcap", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "segcap.toml", global = true)]
    config: PathBuf,

    /// Debug logging (segment adoption, supervisor transitions)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record until stopped
    Start(StartArgs),
    /// Ask a running recorder to stop and wait for it to exit
    Stop {
        /// Output directory of the recorder (overrides config)
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Print the state of a running recorder
    Status {
        /// Output directory of the recorder (overrides config)
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct StartArgs {
    /// Host id used in segment names (default: hostname)
    #[arg(long)]
    host: Option<String>,

    /// Output directory (overrides config)
    #[arg(long)]
    out: Option<PathBuf>,

    /// Segment length in seconds
    #[arg(long)]
    segment_seconds: Option<u64>,

    /// Target bitrate in bits per second
    #[arg(long)]
    bitrate: Option<u64>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Frames per second
    #[arg(long)]
    fps: Option<u32>,

    /// Validate config and print resolved settings, don't record
    #[arg(long)]
    dry_run: bool,
}

impl StartArgs {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            host: self.host.clone(),
            output_dir: self.out.clone(),
            segment_seconds: self.segment_seconds,
            bitrate: self.bitrate,
            width: self.width,
            height: self.height,
            framerate: self.fps,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("segcap=debug")
    } else if cli.quiet {
        EnvFilter::new("segcap=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("segcap=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match cli.command {
        Command::Start(args) => run_start(&cli.config, args).await,
        Command::Stop { out } => run_stop(&cli.config, out).await,
        Command::Status { out } => run_status(&cli.config, out),
    };
    ExitCode::from(code)
}

fn load(path: &Path, overrides: &ConfigOverrides) -> Result<RecorderConfig, u8> {
    let mut config = config::load_config(path).map_err(|e| {
        tracing::error!(error = %e, "configuration error");
        EXIT_CONFIG
    })?;
    config.apply_overrides(overrides);
    Ok(config)
}

fn load_for_out(path: &Path, out: Option<PathBuf>) -> Result<RecorderConfig, u8> {
    load(
        path,
        &ConfigOverrides {
            output_dir: out,
            ..ConfigOverrides::default()
        },
    )
}

async fn run_start(config_path: &Path, args: StartArgs) -> u8 {
    let config = match load(config_path, &args.overrides()) {
        Ok(config) => config,
        Err(code) => return code,
    };
    if args.dry_run {
        return dry_run(&config);
    }

    let stop_file = config.stop_file_path();
    let stop_hint = stop_file.display().to_string();
    let mut handle = match controller::start(config) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "failed to start recording");
            return e.exit_code();
        }
    };
    // Every event is already logged by the controller
    drop(handle.take_events());

    let mut signals = match SignalHandler::install(stop_file, STOP_FILE_POLL) {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            if let Err(e) = handle.stop().await {
                tracing::error!(error = %e, "recording failed");
            }
            return EXIT_FATAL;
        }
    };

    tracing::info!(
        output_dir = %handle.session().output_dir.display(),
        stop_file = %stop_hint,
        "recording; SIGINT, SIGTERM or the stop file ends it"
    );

    let outcome = tokio::select! {
        reason = signals.wait() => {
            let status = handle.status();
            tracing::info!(
                reason = %reason,
                state = ?status.state,
                paused = status.paused,
                segment = ?status.current_segment,
                index = ?status.segment_index,
                restarts = status.restart_count,
                uptime_secs = status.uptime.as_secs(),
                "stopping recorder"
            );
            handle.stop().await
        }
        result = handle.wait() => result,
    };

    match outcome {
        Ok(summary) => {
            tracing::info!(
                host = %summary.host_id,
                session = %namer::stamp(&summary.session_start),
                final_state = ?summary.final_state,
                segments = summary.segments_recorded,
                restarts = summary.restart_count,
                uptime_secs = summary.uptime.as_secs(),
                "recording finished"
            );
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "recording failed");
            e.exit_code()
        }
    }
}

/// Validate and print the resolved configuration.
fn dry_run(config: &RecorderConfig) -> u8 {
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "configuration error");
        return EXIT_CONFIG;
    }
    let host = match config
        .resolve_host_id()
        .and_then(|host| config::validate_host_id(&host).map(|()| host))
    {
        Ok(host) => host,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            return EXIT_CONFIG;
        }
    };
    let mut resolved = config.clone();
    resolved.session.host_id = Some(host);
    resolved.status.file = Some(config.status_path());
    resolved.status.stop_file = Some(config.stop_file_path());
    match toml::to_string_pretty(&resolved) {
        Ok(text) => {
            println!("{text}");
            EXIT_OK
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to render configuration");
            EXIT_CONFIG
        }
    }
}

async fn run_stop(config_path: &Path, out: Option<PathBuf>) -> u8 {
    let config = match load_for_out(config_path, out) {
        Ok(config) => config,
        Err(code) => return code,
    };
    let data = match read_status(&config) {
        Ok(Some(data)) if capture::pid_alive(data.pid) => data,
        Ok(_) => {
            println!("segcap is not running");
            return EXIT_OK;
        }
        Err(code) => return code,
    };

    let Ok(raw) = i32::try_from(data.pid) else {
        tracing::error!(pid = data.pid, "status file holds an invalid pid");
        return EXIT_FATAL;
    };
    match kill(Pid::from_raw(raw), Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {
            println!("segcap is not running");
            return EXIT_OK;
        }
        Err(e) => {
            tracing::error!(pid = data.pid, error = %e, "failed to signal recorder");
            return EXIT_FATAL;
        }
    }

    let deadline = Instant::now() + config.supervisor.stop_timeout() + STOP_WAIT_MARGIN;
    while capture::pid_alive(data.pid) {
        if Instant::now() >= deadline {
            tracing::error!(pid = data.pid, "recorder did not exit in time");
            return EXIT_FATAL;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    println!("stopped segcap (pid {})", data.pid);
    EXIT_OK
}

fn run_status(config_path: &Path, out: Option<PathBuf>) -> u8 {
    let config = match load_for_out(config_path, out) {
        Ok(config) => config,
        Err(code) => return code,
    };
    match read_status(&config) {
        Ok(Some(data)) => {
            print!("{}", render_status(&data, capture::pid_alive(data.pid)));
            EXIT_OK
        }
        Ok(None) => {
            println!("segcap is not running");
            EXIT_OK
        }
        Err(code) => code,
    }
}

fn read_status(config: &RecorderConfig) -> Result<Option<StatusData>, u8> {
    StatusFile::new(config.status_path()).read().map_err(|e| {
        tracing::error!(error = %e, "failed to read status");
        EXIT_FATAL
    })
}

fn render_status(data: &StatusData, alive: bool) -> String {
    let mut out = String::new();
    let state = serde_json::to_value(data.state)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", data.state));
    let mut line = |label: &str, value: String| {
        out.push_str(&format!("{label:<17}{value}\n"));
    };

    if alive {
        line("state:", if data.paused { format!("{state} (paused)") } else { state });
    } else {
        line("state:", format!("{state} (recorder not running)"));
    }
    line("host:", data.host_id.clone());
    line(
        "pid:",
        match data.capture_pid {
            Some(capture) => format!("{} (capture {capture})", data.pid),
            None => data.pid.to_string(),
        },
    );
    line(
        "current segment:",
        data.current_segment
            .as_ref()
            .map_or_else(|| "-".to_string(), |p| p.display().to_string()),
    );
    line(
        "segment index:",
        data.segment_index
            .map_or_else(|| "-".to_string(), |i| i.to_string()),
    );
    line("segments:", data.segments_recorded.to_string());
    line(
        "uptime:",
        format_uptime(data.uptime_secs(chrono::Local::now())),
    );
    line("restart count:", data.restart_count.to_string());
    if let (Some(level), Some(percent)) = (data.disk_level, data.disk_used_percent) {
        line("disk:", format!("{level:?} ({percent:.1}% used)"));
    }
    out
}

fn format_uptime(secs: i64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
