//! One download request end to end: fetch, caption, upload, record.

use crate::instagram::{
    build_caption, load_metadata, ContentKind, DownloadError, InstagramUrl, MediaDownloader,
    SessionCheck,
};
use crate::progress::{spawn_progress_runtime, ProgressEvent, ProgressRuntimeConfig, StatusSink};
use crate::storage::{DownloadStatus, FileOperation, OperationKind, SessionType, StatsStore};
use crate::upload::{UploadJob, UploadMethod, UploadOutcome, UploadService};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// The Instagram session the download tools run with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRef {
    pub user_id: i64,
    pub session_type: SessionType,
}

/// Shared services for processing requests.
pub struct PipelineContext {
    pub downloader: Arc<dyn MediaDownloader>,
    pub uploads: Arc<UploadService>,
    pub store: Arc<dyn StatsStore>,
    pub downloads_root: PathBuf,
    pub status_throttle: Duration,
    /// Session that gets a failed validation when Instagram rejects us
    pub session: Option<SessionRef>,
}

/// Summary of a processed request.
#[derive(Debug)]
pub struct DownloadReport {
    pub download_id: Option<i64>,
    pub status: DownloadStatus,
    pub files: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub via_large_file: usize,
    pub fallbacks: usize,
    pub download_error: Option<DownloadError>,
}

impl DownloadReport {
    fn failed_download(download_id: Option<i64>, error: DownloadError) -> Self {
        Self {
            download_id,
            status: DownloadStatus::Failed,
            files: 0,
            uploaded: 0,
            failed: 0,
            via_large_file: 0,
            fallbacks: 0,
            download_error: Some(error),
        }
    }

    /// Final chat message for the requester.
    #[must_use]
    pub fn summary(&self) -> String {
        if let Some(e) = &self.download_error {
            return e.user_message();
        }
        let mut text = match self.status {
            DownloadStatus::Success => format!("✅ Done: {} file(s) uploaded.", self.uploaded),
            DownloadStatus::Partial => format!(
                "⚠️ Uploaded {} of {} file(s), {} failed.",
                self.uploaded, self.files, self.failed
            ),
            DownloadStatus::Failed | DownloadStatus::Pending => {
                format!("❌ Upload failed for all {} file(s).", self.files)
            }
        };
        if self.via_large_file > 0 {
            text.push_str(&format!("\n🚀 {} via the large-file server.", self.via_large_file));
        }
        text
    }
}

fn downloading_status(url: &InstagramUrl) -> String {
    match (url.kind(), url.identifier()) {
        (kind @ (ContentKind::Story | ContentKind::Profile), Some(user)) => {
            format!("⬇️ Downloading {kind} of @{user} from Instagram…")
        }
        (kind, _) => format!("⬇️ Downloading {kind} from Instagram…"),
    }
}

/// Directory for one request: sortable timestamp plus a random suffix.
#[must_use]
pub fn request_dir(root: &Path) -> PathBuf {
    root.join(format!(
        "{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        Uuid::new_v4().simple()
    ))
}

/// Download `url` and upload the result to `chat_id`, reporting through `sink`.
///
/// Storage failures are logged and never abort the request.
pub async fn process_download<S: StatusSink>(
    ctx: &PipelineContext,
    url: &InstagramUrl,
    chat_id: i64,
    sink: S,
) -> DownloadReport {
    let kind = url.kind();
    let download_id = match ctx.store.record_download(url.as_str(), kind.as_str()).await {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %e, url = %url, "Failed to record download");
            None
        }
    };

    let dir = request_dir(&ctx.downloads_root);
    if let Err(e) = sink.update_status(&downloading_status(url)).await {
        warn!(error = %e, "Status update failed");
    }

    let files = match ctx.downloader.download(url, &dir).await {
        Ok(files) => files,
        Err(e) => {
            if e.is_operator_error() {
                error!(error = %e, url = %url, "Download failed, operator action required");
            } else {
                warn!(error = %e, url = %url, "Download failed");
            }
            if matches!(e, DownloadError::Auth(_)) {
                record_session_result(ctx, false, Some(e.to_string())).await;
            }
            finish(ctx, download_id, DownloadStatus::Failed, 0, Some(e.to_string())).await;
            remove_dir(&dir).await;
            return DownloadReport::failed_download(download_id, e);
        }
    };

    log_downloaded_files(ctx, download_id, &files).await;

    let metadata = match files.first() {
        Some(first) => load_metadata(first).await,
        None => None,
    };
    let total = files.len();
    let jobs: Vec<UploadJob> = files
        .into_iter()
        .enumerate()
        .map(|(index, path)| UploadJob {
            caption: build_caption(metadata.as_ref(), index, total),
            path,
            chat_id,
            download_id,
        })
        .collect();

    let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
    let progress = spawn_progress_runtime(sink, rx, ProgressRuntimeConfig::new(ctx.status_throttle));
    if tx.send(ProgressEvent::Downloaded { files: total }).await.is_err() {
        warn!("Progress runtime stopped early");
    }

    let outcomes = ctx.uploads.upload_all(jobs, Some(tx)).await;
    if let Err(e) = progress.await {
        warn!(error = %e, "Progress task failed");
    }

    let tally = Tally::from_outcomes(&outcomes);
    let status = tally.status();
    finish(ctx, download_id, status, total, tally.first_error).await;

    // Failed files stay on disk for the cleanup task
    if tally.failed == 0 {
        remove_dir(&dir).await;
    }

    info!(
        url = %url,
        id = url.identifier().unwrap_or_default(),
        status = status.as_str(),
        files = total,
        uploaded = tally.uploaded,
        failed = tally.failed,
        via_large_file = tally.via_large_file,
        fallbacks = tally.fallbacks,
        "Request processed"
    );

    DownloadReport {
        download_id,
        status,
        files: total,
        uploaded: tally.uploaded,
        failed: tally.failed,
        via_large_file: tally.via_large_file,
        fallbacks: tally.fallbacks,
        download_error: None,
    }
}

struct Tally {
    uploaded: usize,
    failed: usize,
    via_large_file: usize,
    fallbacks: usize,
    first_error: Option<String>,
}

impl Tally {
    fn from_outcomes(outcomes: &[UploadOutcome]) -> Self {
        let uploaded = outcomes.iter().filter(|o| o.is_success()).count();
        Self {
            uploaded,
            failed: outcomes.len() - uploaded,
            via_large_file: outcomes
                .iter()
                .filter(|o| matches!(o.result, Ok(UploadMethod::LargeFile)))
                .count(),
            fallbacks: outcomes.iter().filter(|o| o.fell_back).count(),
            first_error: outcomes
                .iter()
                .find_map(|o| o.result.as_ref().err().map(ToString::to_string)),
        }
    }

    const fn status(&self) -> DownloadStatus {
        if self.failed == 0 {
            DownloadStatus::Success
        } else if self.uploaded > 0 {
            DownloadStatus::Partial
        } else {
            DownloadStatus::Failed
        }
    }
}

async fn log_downloaded_files(ctx: &PipelineContext, download_id: Option<i64>, files: &[PathBuf]) {
    for file in files {
        let size = tokio::fs::metadata(file).await.map_or(0, |m| m.len());
        let op = FileOperation {
            download_id,
            file_path: file.display().to_string(),
            file_size: size,
            operation: OperationKind::Download,
            method: None,
            success: true,
            error: None,
        };
        if let Err(e) = ctx.store.log_file_operation(op).await {
            warn!(error = %e, "Failed to record downloaded file");
        }
    }
}

/// Probe the configured session and record the result.
pub async fn validate_session(ctx: &PipelineContext) -> SessionCheck {
    let check = ctx.downloader.check_session().await;
    let error = (!check.valid).then(|| check.message.clone());
    record_session_result(ctx, check.valid, error).await;
    check
}

async fn record_session_result(ctx: &PipelineContext, valid: bool, error: Option<String>) {
    let Some(session) = ctx.session else {
        return;
    };
    let active = match ctx
        .store
        .active_session(session.user_id, session.session_type)
        .await
    {
        Ok(Some(record)) => record,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Failed to look up active session");
            return;
        }
    };
    if let Err(e) = ctx
        .store
        .log_session_validation(active.id, valid, error)
        .await
    {
        warn!(error = %e, session_id = active.id, "Failed to record session validation");
    }
}

async fn finish(
    ctx: &PipelineContext,
    download_id: Option<i64>,
    status: DownloadStatus,
    file_count: usize,
    error: Option<String>,
) {
    let Some(id) = download_id else {
        return;
    };
    if let Err(e) = ctx.store.finish_download(id, status, file_count, error).await {
        warn!(error = %e, download_id = id, "Failed to finish download record");
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, path = %dir.display(), "Failed to remove request directory"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_the_account_for_stories_and_profiles() {
        let status = |s: &str| downloading_status(&InstagramUrl::parse(s).expect("url"));
        assert_eq!(
            status("https://www.instagram.com/stories/nasa/123/"),
            "⬇️ Downloading story of @nasa from Instagram…"
        );
        assert_eq!(
            status("https://www.instagram.com/nasa"),
            "⬇️ Downloading profile of @nasa from Instagram…"
        );
        assert_eq!(
            status("https://www.instagram.com/p/Cabc/"),
            "⬇️ Downloading post from Instagram…"
        );
    }

    #[test]
    fn request_dirs_are_unique_and_sortable() {
        let root = Path::new("/downloads");
        let a = request_dir(root);
        let b = request_dir(root);
        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(root));
        let name = a.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        assert_eq!(name.len(), "20260101_000000_".len() + 32);
    }

    #[test]
    fn summary_reflects_status() {
        let report = DownloadReport {
            download_id: Some(1),
            status: DownloadStatus::Partial,
            files: 3,
            uploaded: 2,
            failed: 1,
            via_large_file: 1,
            fallbacks: 0,
            download_error: None,
        };
        let text = report.summary();
        assert!(text.contains("2 of 3"));
        assert!(text.contains("large-file"));

        let failed = DownloadReport::failed_download(None, DownloadError::Private);
        assert_eq!(failed.summary(), DownloadError::Private.user_message());
    }
}
