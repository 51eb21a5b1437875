//! Segment file naming.
//!
//! Final segments are `{host}_{YYYYmmdd_HHMMSS}_{index:04}.{ext}`. While the
//! capture process is writing, files carry a hidden per-launch staging name
//! `.{host}_{YYYYmmdd_HHMMSS}.launchNNN.%04d.{ext}` until the supervisor
//! adopts them under their session-wide index.

use crate::session::Session;
use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Timestamp layout used in every file name.
pub const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Counter placeholder understood by the capture process.
pub const COUNTER_PLACEHOLDER: &str = "%04d";

static SEGMENT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9_-][A-Za-z0-9._-]*)_(\d{8}_\d{6})_(\d{4,})\.([A-Za-z0-9]+)$").unwrap()
});

/// Identity of a finished segment: the owning session plus its index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentName {
    pub start_time: NaiveDateTime,
    pub index: u64,
    pub host_id: String,
}

/// Session timestamp as it appears in file names.
pub fn stamp(start_time: &DateTime<Local>) -> String {
    start_time.format(STAMP_FORMAT).to_string()
}

/// Path of segment `index` within `session`.
pub fn name(session: &Session, index: u64) -> PathBuf {
    session.output_dir.join(format!(
        "{}_{}_{:04}.{}",
        session.host_id,
        stamp(&session.start_time),
        index,
        session.extension
    ))
}

fn staging_prefix(session: &Session, launch: u32) -> String {
    format!(
        ".{}_{}.launch{:03}.",
        session.host_id,
        stamp(&session.start_time),
        launch
    )
}

/// Output template handed to the capture process for one launch.
pub fn staging_template(session: &Session, launch: u32) -> PathBuf {
    session.output_dir.join(format!(
        "{}{}.{}",
        staging_prefix(session, launch),
        COUNTER_PLACEHOLDER,
        session.extension
    ))
}

/// Glob pattern matching every staging file of one launch.
pub fn staging_glob(session: &Session, launch: u32) -> String {
    let dir = glob::Pattern::escape(&session.output_dir.to_string_lossy());
    let file = glob::Pattern::escape(&staging_prefix(session, launch));
    format!("{dir}/{file}*.{}", session.extension)
}

/// Raw counter of a staging file written during `launch`, if `path` is one.
pub fn parse_staging(path: &Path, session: &Session, launch: u32) -> Option<u64> {
    let file_name = path.file_name()?.to_str()?;
    let rest = file_name.strip_prefix(&staging_prefix(session, launch))?;
    let digits = rest.strip_suffix(&format!(".{}", session.extension))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Inverse of [`name`]: recover host, session start and index from a path.
pub fn parse(path: &Path) -> Option<SegmentName> {
    let file_name = path.file_name()?.to_str()?;
    let caps = SEGMENT_NAME.captures(file_name)?;
    let start_time = NaiveDateTime::parse_from_str(&caps[2], STAMP_FORMAT).ok()?;
    let index = caps[3].parse().ok()?;
    Some(SegmentName {
        start_time,
        index,
        host_id: caps[1].to_string(),
    })
}

/// True if any file in `dir` already belongs to a session of `host_id`
/// started at `start_time`.
pub fn session_prefix_in_use(
    dir: &Path,
    host_id: &str,
    start_time: &DateTime<Local>,
) -> std::io::Result<bool> {
    let final_prefix = format!("{}_{}_", host_id, stamp(start_time));
    let staging = format!(".{}_{}.", host_id, stamp(start_time));
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        if file_name.starts_with(&final_prefix) || file_name.starts_with(&staging) {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use chrono::TimeZone;
    use std::collections::HashSet;

    fn session_at(dir: &Path, host: &str, stamp: &str) -> Session {
        let naive = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).unwrap();
        let start = Local.from_local_datetime(&naive).earliest().unwrap();
        let mut config = RecorderConfig::default();
        config.session.output_dir = dir.to_path_buf();
        Session::from_config(&config, host.to_string(), start)
    }

    #[test]
    fn test_name_layout() {
        let session = session_at(Path::new("/buf"), "pi-cam", "20260301_060000");
        assert_eq!(
            name(&session, 7),
            PathBuf::from("/buf/pi-cam_20260301_060000_0007.h264")
        );
        assert_eq!(
            name(&session, 12345),
            PathBuf::from("/buf/pi-cam_20260301_060000_12345.h264")
        );
    }

    #[test]
    fn test_names_are_distinct() {
        let session = session_at(Path::new("/buf"), "pi", "20260301_060000");
        let names: HashSet<PathBuf> = (0..20_000).map(|i| name(&session, i)).collect();
        assert_eq!(names.len(), 20_000);
    }

    #[test]
    fn test_names_distinct_across_sessions_and_hosts() {
        let a = session_at(Path::new("/buf"), "cam_1", "20260301_060000");
        let b = session_at(Path::new("/buf"), "cam", "20260301_060000");
        let c = session_at(Path::new("/buf"), "cam_1", "20260301_060001");
        let mut seen = HashSet::new();
        for s in [&a, &b, &c] {
            for i in 0..100 {
                assert!(seen.insert(name(s, i)));
            }
        }
    }

    #[test]
    fn test_parse_inverts_name() {
        let session = session_at(Path::new("/buf"), "cam_1.lan", "20260301_235959");
        for index in [0, 9, 9999, 10_000] {
            let parsed = parse(&name(&session, index)).unwrap();
            assert_eq!(parsed.host_id, "cam_1.lan");
            assert_eq!(parsed.index, index);
            assert_eq!(
                parsed.start_time.format(STAMP_FORMAT).to_string(),
                "20260301_235959"
            );
        }
    }

    #[test]
    fn test_parse_rejects_foreign_files() {
        assert!(parse(Path::new("/buf/notes.txt")).is_none());
        assert!(parse(Path::new("/buf/pi_20260301_060000.h264")).is_none());
        assert!(parse(Path::new("/buf/pi_2026_060000_0001.h264")).is_none());
        assert!(parse(Path::new("/buf/.pi_20260301_060000.launch000.0001.h264")).is_none());
        assert!(parse(Path::new("/buf/.pi_20260301_060000_0001.h264")).is_none());
    }

    #[test]
    fn test_staging_template_and_parse() {
        let session = session_at(Path::new("/buf"), "pi", "20260301_060000");
        let template = staging_template(&session, 3);
        assert_eq!(
            template,
            PathBuf::from("/buf/.pi_20260301_060000.launch003.%04d.h264")
        );
        let written = PathBuf::from("/buf/.pi_20260301_060000.launch003.0012.h264");
        assert_eq!(parse_staging(&written, &session, 3), Some(12));
        // A different launch's files are not ours
        assert_eq!(parse_staging(&written, &session, 2), None);
        assert_eq!(parse_staging(&template, &session, 3), None);
    }

    #[test]
    fn test_staging_glob_escapes_dir() {
        let session = session_at(Path::new("/data/[cam]"), "pi", "20260301_060000");
        let pattern = staging_glob(&session, 0);
        assert!(pattern.starts_with("/data/[[]cam[]]/"));
        assert!(pattern.ends_with("*.h264"));
    }

    #[test]
    fn test_session_prefix_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let session = session_at(dir.path(), "pi", "20260301_060000");
        assert!(!session_prefix_in_use(dir.path(), "pi", &session.start_time).unwrap());
        std::fs::write(name(&session, 0), b"x").unwrap();
        assert!(session_prefix_in_use(dir.path(), "pi", &session.start_time).unwrap());
        assert!(!session_prefix_in_use(dir.path(), "other", &session.start_time).unwrap());
    }
}
