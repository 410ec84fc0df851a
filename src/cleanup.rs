//! Housekeeping for the downloads directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub directories_removed: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub total_bytes: u64,
    pub directories: usize,
    pub files: usize,
    /// Directories old enough to be removed by the next cleanup
    pub old_directories: usize,
}

/// Removes per-request download directories once they are older than `max_age`.
#[derive(Debug, Clone)]
pub struct CleanupService {
    root: PathBuf,
    max_age: Duration,
}

impl CleanupService {
    #[must_use]
    pub const fn new(root: PathBuf, max_age: Duration) -> Self {
        Self { root, max_age }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Remove old directories directly under the root.
    pub async fn cleanup_old_directories(&self) -> CleanupReport {
        self.cleanup_as_of(SystemTime::now()).await
    }

    /// Like [`Self::cleanup_old_directories`], judging age against `now`.
    pub async fn cleanup_as_of(&self, now: SystemTime) -> CleanupReport {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.cleanup_blocking(now))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "Cleanup task failed");
                CleanupReport::default()
            })
    }

    fn cleanup_blocking(&self, now: SystemTime) -> CleanupReport {
        let mut report = CleanupReport::default();
        for dir in self.subdirectories() {
            if !self.is_old(&dir, now) {
                continue;
            }
            let size = directory_size(&dir).0;
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {
                    report.directories_removed += 1;
                    report.bytes_freed += size;
                    info!(path = %dir.display(), freed = size, "Removed old download directory");
                }
                Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove directory"),
            }
        }
        report
    }

    /// Size and age overview of the downloads root.
    pub async fn storage_stats(&self) -> StorageStats {
        let service = self.clone();
        tokio::task::spawn_blocking(move || {
            let now = SystemTime::now();
            let (total_bytes, files) = directory_size(&service.root);
            let dirs = service.subdirectories();
            StorageStats {
                total_bytes,
                files,
                directories: dirs.len(),
                old_directories: dirs.iter().filter(|d| service.is_old(d, now)).count(),
            }
        })
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Storage stats task failed");
            StorageStats::default()
        })
    }

    fn subdirectories(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.root) {
            Ok(entries) => entries
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
                .map(|e| e.path())
                .collect(),
            Err(e) => {
                debug!(path = %self.root.display(), error = %e, "Downloads root not readable");
                Vec::new()
            }
        }
    }

    fn is_old(&self, dir: &Path, now: SystemTime) -> bool {
        std::fs::metadata(dir)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > self.max_age)
    }

    /// Run cleanup every `interval` until `token` is cancelled.
    pub fn spawn_periodic(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    () = token.cancelled() => {
                        debug!("Cleanup task stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let report = self.cleanup_old_directories().await;
                        if report.directories_removed > 0 {
                            info!(
                                removed = report.directories_removed,
                                freed = report.bytes_freed,
                                "Periodic cleanup finished"
                            );
                        }
                    }
                }
            }
        })
    }
}

/// Total bytes and file count under `path`.
fn directory_size(path: &Path) -> (u64, usize) {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .fold((0, 0), |(bytes, files), m| (bytes + m.len(), files + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn populated() -> TempDir {
        let root = TempDir::new().expect("tempdir");
        for (dir, size) in [("a", 100), ("b", 50)] {
            let path = root.path().join(dir);
            std::fs::create_dir_all(path.join("nested")).expect("mkdir");
            std::fs::write(path.join("file.jpg"), vec![0u8; size]).expect("write");
            std::fs::write(path.join("nested").join("meta.json"), b"{}").expect("write");
        }
        std::fs::write(root.path().join("stray.txt"), b"keep").expect("write");
        root
    }

    #[tokio::test]
    async fn fresh_directories_are_kept() {
        let root = populated();
        let service = CleanupService::new(root.path().to_path_buf(), 7 * DAY);

        let report = service.cleanup_old_directories().await;

        assert_eq!(report, CleanupReport::default());
        assert!(root.path().join("a").exists());
    }

    #[tokio::test]
    async fn old_directories_are_removed_and_files_left_alone() {
        let root = populated();
        let service = CleanupService::new(root.path().to_path_buf(), 7 * DAY);

        let report = service.cleanup_as_of(SystemTime::now() + 8 * DAY).await;

        assert_eq!(report.directories_removed, 2);
        assert_eq!(report.bytes_freed, 100 + 50 + 2 + 2);
        assert!(!root.path().join("a").exists());
        assert!(root.path().join("stray.txt").exists());
    }

    #[tokio::test]
    async fn storage_stats_counts_everything() {
        let root = populated();
        let service = CleanupService::new(root.path().to_path_buf(), 7 * DAY);

        let stats = service.storage_stats().await;

        assert_eq!(stats.directories, 2);
        assert_eq!(stats.files, 5);
        assert_eq!(stats.total_bytes, 100 + 50 + 2 + 2 + 4);
        assert_eq!(stats.old_directories, 0);
    }

    #[tokio::test]
    async fn missing_root_is_empty() {
        let service = CleanupService::new(PathBuf::from("/nonexistent/downloads"), DAY);
        assert_eq!(service.cleanup_old_directories().await, CleanupReport::default());
        assert_eq!(service.storage_stats().await, StorageStats::default());
    }
}
