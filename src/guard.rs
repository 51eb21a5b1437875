//! Disk space guard: watches the output filesystem and deletes the oldest
//! finished segments when free space runs low.

use crate::config::DiskConfig;
use crate::namer;
use crate::segments::SegmentFile;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Capacity figures for the filesystem holding the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }

    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.used_bytes() as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Source of free-space figures.
pub trait SpaceProbe: Send + Sync + 'static {
    fn usage(&self, dir: &Path) -> std::io::Result<DiskUsage>;
}

/// Reads real filesystem statistics.
pub struct Fs2Probe;

impl SpaceProbe for Fs2Probe {
    fn usage(&self, dir: &Path) -> std::io::Result<DiskUsage> {
        Ok(DiskUsage {
            total_bytes: fs2::total_space(dir)?,
            free_bytes: fs2::available_space(dir)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskLevel {
    Ok,
    Low,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskReport {
    pub level: DiskLevel,
    pub usage: DiskUsage,
}

/// A segment removed by [`DiskGuard::reclaim`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeletedSegment {
    pub path: PathBuf,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimOutcome {
    pub deleted: Vec<DeletedSegment>,
    pub freed_bytes: u64,
    /// Segments that could not be removed, with the reason.
    pub failures: Vec<(PathBuf, String)>,
}

pub struct DiskGuard<P: SpaceProbe> {
    dir: PathBuf,
    extension: String,
    probe: P,
    low_usage_percent: u8,
    critical_usage_percent: u8,
    min_free_bytes: u64,
}

impl<P: SpaceProbe> DiskGuard<P> {
    pub fn new(dir: PathBuf, extension: String, config: &DiskConfig, probe: P) -> Self {
        Self {
            dir,
            extension,
            probe,
            low_usage_percent: config.low_usage_percent,
            critical_usage_percent: config.critical_usage_percent,
            min_free_bytes: config.min_free_bytes,
        }
    }

    /// Sample free space and classify it.
    pub fn check(&self) -> std::io::Result<DiskReport> {
        let usage = self.probe.usage(&self.dir)?;
        Ok(DiskReport {
            level: self.classify(&usage),
            usage,
        })
    }

    pub fn classify(&self, usage: &DiskUsage) -> DiskLevel {
        if usage.free_bytes < self.min_free_bytes
            || at_or_above(usage, self.critical_usage_percent)
        {
            DiskLevel::Critical
        } else if at_or_above(usage, self.low_usage_percent) {
            DiskLevel::Low
        } else {
            DiskLevel::Ok
        }
    }

    /// Bytes to delete to get back under the low watermark (and the absolute
    /// floor). Reclaiming to the low mark instead of just under critical keeps
    /// the guard from deleting one segment on every sample.
    pub fn bytes_needed(&self, usage: &DiskUsage) -> u64 {
        let total = usage.total_bytes as u128;
        // usage% < low  <=>  used * 100 < low * total
        let max_used = (self.low_usage_percent as u128 * total).div_ceil(100).saturating_sub(1);
        let over_watermark = (usage.used_bytes() as u128).saturating_sub(max_used);
        let under_floor = self.min_free_bytes.saturating_sub(usage.free_bytes) as u128;
        over_watermark.max(under_floor).min(u64::MAX as u128) as u64
    }

    /// Finished segments in the output directory, oldest first.
    ///
    /// Age comes from the name: (session start, index) is the order the
    /// segments were created in. Files that are not segment names are never
    /// listed, so staging files and foreign files are left alone.
    pub fn segments(&self) -> std::io::Result<Vec<SegmentFile>> {
        let suffix = format!(".{}", self.extension);
        let mut segments = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_ours = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(&suffix));
            if !is_ours {
                continue;
            }
            let Some(name) = namer::parse(&path) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let created_at = meta
                .created()
                .or_else(|_| meta.modified())
                .map(DateTime::<Local>::from)
                .unwrap_or_else(|_| Local::now());
            segments.push(SegmentFile {
                path,
                name,
                created_at,
                size_bytes: meta.len(),
            });
        }
        segments.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(segments)
    }

    /// Delete oldest segments until `bytes_needed` is freed or nothing
    /// eligible is left. `protected` (the segment being written) is never
    /// deleted.
    pub fn reclaim(
        &self,
        bytes_needed: u64,
        protected: Option<&Path>,
    ) -> std::io::Result<ReclaimOutcome> {
        let mut outcome = ReclaimOutcome::default();
        if bytes_needed == 0 {
            return Ok(outcome);
        }

        for segment in self.segments()? {
            if outcome.freed_bytes >= bytes_needed {
                break;
            }
            if protected.is_some_and(|p| p == segment.path.as_path()) {
                tracing::debug!(path = %segment.path.display(), "skipping active segment");
                continue;
            }
            match std::fs::remove_file(&segment.path) {
                Ok(()) => {
                    tracing::info!(
                        path = %segment.path.display(),
                        size_bytes = segment.size_bytes,
                        "deleted segment to reclaim space"
                    );
                    outcome.freed_bytes += segment.size_bytes;
                    outcome.deleted.push(DeletedSegment {
                        path: segment.path,
                        size_bytes: segment.size_bytes,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %segment.path.display(),
                        "failed to delete segment"
                    );
                    outcome.failures.push((segment.path, e.to_string()));
                }
            }
        }
        Ok(outcome)
    }
}

fn at_or_above(usage: &DiskUsage, percent: u8) -> bool {
    usage.used_bytes() as u128 * 100 >= percent as u128 * usage.total_bytes as u128
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::segments::tests::test_session;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Pretends the filesystem holds `capacity` bytes and that the only
    /// data on it is what lives in the directory plus `baseline`.
    pub(crate) struct DirSizeProbe {
        pub capacity: u64,
        pub baseline: Arc<AtomicU64>,
    }

    impl SpaceProbe for DirSizeProbe {
        fn usage(&self, dir: &Path) -> std::io::Result<DiskUsage> {
            let mut used = self.baseline.load(Ordering::SeqCst);
            for entry in std::fs::read_dir(dir)? {
                used += entry?.metadata()?.len();
            }
            Ok(DiskUsage {
                total_bytes: self.capacity,
                free_bytes: self.capacity.saturating_sub(used),
            })
        }
    }

    fn guard(dir: &Path, capacity: u64) -> DiskGuard<DirSizeProbe> {
        DiskGuard::new(
            dir.to_path_buf(),
            "h264".to_string(),
            &DiskConfig::default(),
            DirSizeProbe {
                capacity,
                baseline: Arc::new(AtomicU64::new(0)),
            },
        )
    }

    fn usage(total: u64, free: u64) -> DiskUsage {
        DiskUsage {
            total_bytes: total,
            free_bytes: free,
        }
    }

    fn write_segment(dir: &Path, index: u64, size: usize) -> PathBuf {
        let session = test_session(dir);
        let path = namer::name(&session, index);
        std::fs::write(&path, vec![0u8; size]).unwrap();
        path
    }

    #[test]
    fn test_classify_levels() {
        let dir = tempfile::tempdir().unwrap();
        let g = guard(dir.path(), 1000);
        assert_eq!(g.classify(&usage(1000, 500)), DiskLevel::Ok);
        assert_eq!(g.classify(&usage(1000, 151)), DiskLevel::Ok);
        assert_eq!(g.classify(&usage(1000, 150)), DiskLevel::Low);
        assert_eq!(g.classify(&usage(1000, 101)), DiskLevel::Low);
        assert_eq!(g.classify(&usage(1000, 100)), DiskLevel::Critical);
        assert_eq!(g.classify(&usage(1000, 0)), DiskLevel::Critical);
        assert_eq!(g.classify(&usage(0, 0)), DiskLevel::Critical);
    }

    #[test]
    fn test_min_free_floor_is_critical() {
        let dir = tempfile::tempdir().unwrap();
        let config = DiskConfig {
            min_free_bytes: 600,
            ..DiskConfig::default()
        };
        let g = DiskGuard::new(
            dir.path().to_path_buf(),
            "h264".to_string(),
            &config,
            Fs2Probe,
        );
        assert_eq!(g.classify(&usage(1000, 500)), DiskLevel::Critical);
        assert_eq!(g.bytes_needed(&usage(1000, 500)), 100);
    }

    #[test]
    fn test_bytes_needed_reaches_low_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let g = guard(dir.path(), 1000);
        // 920 used; below 85% means at most 849 used
        let needed = g.bytes_needed(&usage(1000, 80));
        assert_eq!(needed, 71);
        let after = usage(1000, 80 + needed);
        assert_eq!(g.classify(&after), DiskLevel::Ok);
        assert_eq!(g.bytes_needed(&usage(1000, 500)), 0);
    }

    #[test]
    fn test_segments_sorted_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        for index in [3, 0, 2, 1] {
            write_segment(dir.path(), index, 10);
        }
        std::fs::write(dir.path().join("notes.txt"), "keep").unwrap();
        std::fs::write(
            dir.path().join(".pi_20260301_060000.launch000.0009.h264"),
            "staging",
        )
        .unwrap();

        let g = guard(dir.path(), 1000);
        let indices: Vec<u64> = g.segments().unwrap().iter().map(|s| s.name.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_reclaim_deletes_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..4).map(|i| write_segment(dir.path(), i, 100)).collect();
        let g = guard(dir.path(), 1000);

        let outcome = g.reclaim(150, None).unwrap();
        let deleted: Vec<&PathBuf> = outcome.deleted.iter().map(|d| &d.path).collect();
        assert_eq!(deleted, vec![&paths[0], &paths[1]]);
        assert_eq!(outcome.freed_bytes, 200);
        assert!(!paths[0].exists());
        assert!(paths[2].exists());
    }

    #[test]
    fn test_reclaim_never_deletes_protected() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| write_segment(dir.path(), i, 100)).collect();
        let g = guard(dir.path(), 1000);

        let outcome = g.reclaim(10_000, Some(&paths[1])).unwrap();
        assert_eq!(outcome.deleted.len(), 2);
        assert!(paths[1].exists());
        assert!(outcome.freed_bytes < 10_000);
    }

    #[test]
    fn test_reclaim_ignores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let old = write_segment(dir.path(), 0, 100);
        let newer = write_segment(dir.path(), 1, 100);
        // Touching the oldest segment does not make it younger
        filetime::set_file_mtime(&old, filetime::FileTime::from_unix_time(4_000_000_000, 0))
            .unwrap();
        filetime::set_file_mtime(&newer, filetime::FileTime::from_unix_time(1_000, 0)).unwrap();

        let g = guard(dir.path(), 1000);
        let outcome = g.reclaim(1, None).unwrap();
        assert_eq!(outcome.deleted[0].path, old);
        assert!(newer.exists());
    }

    #[test]
    fn test_reclaim_zero_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_segment(dir.path(), 0, 100);
        let g = guard(dir.path(), 1000);
        assert_eq!(g.reclaim(0, None).unwrap(), ReclaimOutcome::default());
        assert!(path.exists());
    }

    #[test]
    fn test_check_reports_probe_usage() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..9 {
            write_segment(dir.path(), i, 100);
        }
        let g = guard(dir.path(), 1000);
        let report = g.check().unwrap();
        assert_eq!(report.level, DiskLevel::Critical);
        assert_eq!(report.usage.free_bytes, 100);

        let needed = g.bytes_needed(&report.usage);
        g.reclaim(needed, None).unwrap();
        assert_eq!(g.check().unwrap().level, DiskLevel::Ok);
    }

    #[test]
    fn test_fs2_probe_reads_real_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let usage = Fs2Probe.usage(dir.path()).unwrap();
        assert!(usage.total_bytes > 0);
        assert!(usage.free_bytes <= usage.total_bytes);
    }
}
