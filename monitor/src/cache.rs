use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneReport {
    pub removed_files: usize,
    pub removed_bytes: u64,
    pub remaining_bytes: u64,
}

fn collect_files(dir: &Path, out: &mut Vec<(PathBuf, SystemTime, u64)>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            collect_files(&entry.path(), out)?;
        } else if meta.is_file() {
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((entry.path(), modified, meta.len()));
        }
    }
    Ok(())
}

/// Delete the oldest files (by mtime) under `dir` until it holds at most
/// `max_bytes`. A missing directory counts as empty.
pub fn prune_dir(dir: &Path, max_bytes: u64) -> std::io::Result<PruneReport> {
    let mut files = Vec::new();
    match collect_files(dir, &mut files) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(PruneReport::default()),
        Err(e) => return Err(e),
    }
    files.sort_by_key(|(_, modified, _)| *modified);

    let mut report = PruneReport {
        remaining_bytes: files.iter().map(|(_, _, len)| len).sum(),
        ..Default::default()
    };

    for (path, _, len) in files {
        if report.remaining_bytes <= max_bytes {
            break;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {
                report.removed_files += 1;
                report.removed_bytes += len;
                report.remaining_bytes -= len;
                debug!(path = %path.display(), bytes = len, "removed old output file");
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove output file"),
        }
    }
    Ok(report)
}

/// Keeps the output directory under its size limit. Runs for the life of
/// the process.
pub async fn run_cleanup_loop(dir: PathBuf, max_size_mb: u64, interval: Duration) {
    let max_bytes = max_size_mb * 1_048_576;
    let mut consecutive_failures: u32 = 0;

    loop {
        let scan_dir = dir.clone();
        let result = tokio::task::spawn_blocking(move || prune_dir(&scan_dir, max_bytes)).await;
        match result {
            Ok(Ok(report)) => {
                consecutive_failures = 0;
                if report.removed_files > 0 {
                    info!(
                        removed_files = report.removed_files,
                        removed_mb = format!("{:.1}", report.removed_bytes as f64 / 1_048_576.0),
                        remaining_mb = format!("{:.1}", report.remaining_bytes as f64 / 1_048_576.0),
                        max_size_mb,
                        "pruned output directory"
                    );
                } else {
                    debug!(
                        remaining_mb = format!("{:.1}", report.remaining_bytes as f64 / 1_048_576.0),
                        "output directory within limit"
                    );
                }
            }
            Ok(Err(e)) => {
                consecutive_failures += 1;
                warn!(dir = %dir.display(), error = %e, consecutive_failures, "output directory cleanup failed");
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(error = %e, consecutive_failures, "output directory cleanup task panicked");
            }
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_aged(dir: &Path, name: &str, bytes: usize, age_secs: u64) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0u8; bytes]).unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
        path
    }

    #[test]
    fn removes_oldest_until_under_limit() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = write_aged(dir.path(), "a.mp4", 400, 300);
        let middle = write_aged(dir.path(), "b.mp4", 400, 200);
        let newest = write_aged(dir.path(), "c.jpg", 400, 100);

        let report = prune_dir(dir.path(), 900).unwrap();
        assert_eq!(report.removed_files, 1);
        assert_eq!(report.remaining_bytes, 800);
        assert!(!oldest.exists());
        assert!(middle.exists());
        assert!(newest.exists());
    }

    #[test]
    fn under_limit_removes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_aged(dir.path(), "a.mp4", 100, 10);
        let report = prune_dir(dir.path(), 1_000).unwrap();
        assert_eq!(report.removed_files, 0);
        assert_eq!(report.remaining_bytes, 100);
    }

    #[test]
    fn walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs");
        std::fs::create_dir(&nested).unwrap();
        let old_log = write_aged(&nested, "homecam.log", 500, 1_000);
        let clip = write_aged(dir.path(), "clip.mp4", 500, 10);

        let report = prune_dir(dir.path(), 600).unwrap();
        assert_eq!(report.removed_bytes, 500);
        assert!(!old_log.exists());
        assert!(clip.exists());
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let report = prune_dir(&dir.path().join("absent"), 0).unwrap();
        assert_eq!(report, PruneReport::default());
    }
}
