//! Segment bookkeeping across capture-process launches.
//!
//! The capture tool numbers its output from zero on every launch. The tracker
//! watches the current launch's staging files and renames each one, as soon as
//! it appears, to the next session-wide index. Renaming an open file is safe:
//! the writer keeps its descriptor and keeps appending to the same inode.

use crate::namer::{self, SegmentName};
use crate::session::Session;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A finished or in-progress segment on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub name: SegmentName,
    pub created_at: DateTime<Local>,
    pub size_bytes: u64,
}

/// Bookkeeping changes produced by a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// A new segment became the active one.
    Opened { index: u64, path: PathBuf },
    /// The previous active segment rolled over and is now immutable.
    Closed(SegmentFile),
    /// A staging file could not be renamed; it is retried on the next scan.
    AdoptFailed { staging: PathBuf, error: String },
}

#[derive(Debug, Clone)]
struct ActiveSegment {
    index: u64,
    path: PathBuf,
    opened_at: DateTime<Local>,
}

pub struct SegmentTracker {
    session: Arc<Session>,
    next_index: u64,
    launch: Option<u32>,
    /// Next raw counter expected from the current launch.
    next_raw: u64,
    active: Option<ActiveSegment>,
}

impl SegmentTracker {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            next_index: 0,
            launch: None,
            next_raw: 0,
            active: None,
        }
    }

    /// Start tracking files of a new launch. Any segment still marked active
    /// from the previous launch must have been closed with [`finish_launch`].
    ///
    /// [`finish_launch`]: SegmentTracker::finish_launch
    pub fn begin_launch(&mut self, launch: u32) {
        debug_assert!(self.active.is_none());
        self.launch = Some(launch);
        self.next_raw = 0;
    }

    /// Adopt any new staging files from the current launch.
    pub fn scan(&mut self) -> Vec<SegmentEvent> {
        let Some(launch) = self.launch else {
            return Vec::new();
        };

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        let pattern = namer::staging_glob(&self.session, launch);
        match glob::glob(&pattern) {
            Ok(paths) => {
                for entry in paths {
                    match entry {
                        Ok(path) => {
                            if let Some(raw) = namer::parse_staging(&path, &self.session, launch) {
                                if raw >= self.next_raw {
                                    found.push((raw, path));
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "unreadable entry while scanning for segments");
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, pattern = %pattern, "invalid staging pattern");
                return Vec::new();
            }
        }
        found.sort_by_key(|(raw, _)| *raw);

        let mut events = Vec::new();
        for (raw, staging) in found {
            let index = self.next_index;
            let dest = namer::name(&self.session, index);
            if let Err(e) = std::fs::rename(&staging, &dest) {
                events.push(SegmentEvent::AdoptFailed {
                    staging,
                    error: e.to_string(),
                });
                break;
            }
            tracing::debug!(
                raw,
                index,
                from = %staging.display(),
                to = %dest.display(),
                "adopted segment"
            );
            if let Some(closed) = self.close_active() {
                events.push(SegmentEvent::Closed(closed));
            }
            self.active = Some(ActiveSegment {
                index,
                path: dest.clone(),
                opened_at: Local::now(),
            });
            self.next_index += 1;
            self.next_raw = raw + 1;
            events.push(SegmentEvent::Opened { index, path: dest });
        }
        events
    }

    /// Final scan after the process exited, then close the active segment.
    pub fn finish_launch(&mut self) -> Vec<SegmentEvent> {
        let mut events = self.scan();
        if let Some(closed) = self.close_active() {
            events.push(SegmentEvent::Closed(closed));
        }
        self.launch = None;
        events
    }

    fn close_active(&mut self) -> Option<SegmentFile> {
        let active = self.active.take()?;
        let size_bytes = std::fs::metadata(&active.path).map(|m| m.len()).unwrap_or(0);
        let name = namer::parse(&active.path)?;
        Some(SegmentFile {
            path: active.path,
            name,
            created_at: active.opened_at,
            size_bytes,
        })
    }

    /// Path of the segment currently being written.
    pub fn active(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    pub fn active_index(&self) -> Option<u64> {
        self.active.as_ref().map(|a| a.index)
    }

    /// Current size of the active segment (0 if none).
    pub fn active_size(&self) -> u64 {
        self.active()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0)
    }

    /// Index the next adopted segment will receive.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::RecorderConfig;
    use chrono::TimeZone;
    use std::io::Write;

    pub(crate) fn test_session(dir: &Path) -> Arc<Session> {
        let mut config = RecorderConfig::default();
        config.session.output_dir = dir.to_path_buf();
        let start = Local
            .with_ymd_and_hms(2026, 3, 1, 6, 0, 0)
            .earliest()
            .unwrap();
        Arc::new(Session::from_config(&config, "pi".to_string(), start))
    }

    /// Write raw segment `raw` of `launch` the way the capture tool would.
    pub(crate) fn write_staging(session: &Session, launch: u32, raw: u64, bytes: &[u8]) -> PathBuf {
        let template = namer::staging_template(session, launch);
        let path = PathBuf::from(
            template
                .to_string_lossy()
                .replace(namer::COUNTER_PLACEHOLDER, &format!("{raw:04}")),
        );
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(bytes).unwrap();
        path
    }

    fn opened(events: &[SegmentEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::Opened { index, .. } => Some(*index),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_scan_without_launch_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let mut tracker = SegmentTracker::new(test_session(dir.path()));
        assert!(tracker.scan().is_empty());
        assert!(tracker.active().is_none());
    }

    #[test]
    fn test_adopts_in_counter_order() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let mut tracker = SegmentTracker::new(Arc::clone(&session));
        tracker.begin_launch(0);

        write_staging(&session, 0, 1, b"second");
        write_staging(&session, 0, 0, b"first");
        let events = tracker.scan();
        assert_eq!(opened(&events), vec![0, 1]);
        assert_eq!(tracker.active(), Some(namer::name(&session, 1).as_path()));
        assert_eq!(std::fs::read(namer::name(&session, 0)).unwrap(), b"first");

        // Segment 0 was closed when 1 opened
        let closed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                SegmentEvent::Closed(f) => Some(f.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].name.index, 0);
        assert_eq!(closed[0].size_bytes, 5);
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let mut tracker = SegmentTracker::new(Arc::clone(&session));
        tracker.begin_launch(0);
        write_staging(&session, 0, 0, b"a");
        assert_eq!(opened(&tracker.scan()), vec![0]);
        assert!(tracker.scan().is_empty());
        assert_eq!(tracker.next_index(), 1);
    }

    #[test]
    fn test_index_continues_across_launches() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let mut tracker = SegmentTracker::new(Arc::clone(&session));

        tracker.begin_launch(0);
        for raw in 0..4 {
            write_staging(&session, 0, raw, b"data");
        }
        assert_eq!(opened(&tracker.scan()), vec![0, 1, 2, 3]);
        let events = tracker.finish_launch();
        assert!(matches!(events.as_slice(), [SegmentEvent::Closed(f)] if f.name.index == 3));
        assert!(tracker.active().is_none());

        // New launch restarts the tool's counter at zero
        tracker.begin_launch(1);
        write_staging(&session, 1, 0, b"data");
        assert_eq!(opened(&tracker.scan()), vec![4]);
        assert!(namer::name(&session, 4).exists());
    }

    #[test]
    fn test_gap_in_raw_counter_does_not_skip_index() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let mut tracker = SegmentTracker::new(Arc::clone(&session));
        tracker.begin_launch(0);
        write_staging(&session, 0, 0, b"a");
        write_staging(&session, 0, 5, b"b");
        assert_eq!(opened(&tracker.scan()), vec![0, 1]);
    }

    #[test]
    fn test_other_launch_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let mut tracker = SegmentTracker::new(Arc::clone(&session));
        tracker.begin_launch(2);
        write_staging(&session, 1, 0, b"stale");
        assert!(tracker.scan().is_empty());
    }

    #[test]
    fn test_active_size_tracks_growth() {
        let dir = tempfile::tempdir().unwrap();
        let session = test_session(dir.path());
        let mut tracker = SegmentTracker::new(Arc::clone(&session));
        tracker.begin_launch(0);
        assert_eq!(tracker.active_size(), 0);
        write_staging(&session, 0, 0, b"");
        tracker.scan();
        assert_eq!(tracker.active_size(), 0);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(namer::name(&session, 0))
            .unwrap();
        file.write_all(b"frames").unwrap();
        assert_eq!(tracker.active_size(), 6);
        assert_eq!(tracker.active_index(), Some(0));
    }
}
