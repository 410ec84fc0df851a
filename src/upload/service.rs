//! Upload orchestration: selection, retry, fallback and bookkeeping.

use super::{
    retry_with_backoff, select_method, BackoffPolicy, MediaKind, UploadError, UploadLimits,
    UploadMethod, UploadRequest, UploadTransport,
};
use crate::progress::ProgressEvent;
use crate::storage::{FileOperation, OperationKind, StatsStore};
use futures_util::{stream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// A file waiting to be uploaded.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub path: PathBuf,
    pub caption: Option<String>,
    pub chat_id: i64,
    /// Row in `downloads` this file came from
    pub download_id: Option<i64>,
}

/// What happened to one [`UploadJob`].
#[derive(Debug)]
pub struct UploadOutcome {
    pub path: PathBuf,
    pub size: u64,
    /// Transport that delivered the file, or the final error
    pub result: Result<UploadMethod, UploadError>,
    pub fell_back: bool,
}

impl UploadOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Uploads files through the configured transports.
///
/// One instance is shared by every request; `max_concurrent` bounds the
/// uploads in flight across all of them.
pub struct UploadService {
    bot_api: Arc<dyn UploadTransport>,
    large_file: Option<Arc<dyn UploadTransport>>,
    limits: UploadLimits,
    backoff: BackoffPolicy,
    bot_api_pause: Duration,
    large_file_pause: Duration,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    store: Arc<dyn StatsStore>,
}

impl UploadService {
    #[must_use]
    pub fn new(
        bot_api: Arc<dyn UploadTransport>,
        large_file: Option<Arc<dyn UploadTransport>>,
        limits: UploadLimits,
        backoff: BackoffPolicy,
        store: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            bot_api,
            large_file,
            limits,
            backoff,
            bot_api_pause: Duration::ZERO,
            large_file_pause: Duration::ZERO,
            max_concurrent: 1,
            permits: Arc::new(Semaphore::new(1)),
            store,
        }
    }

    /// Pause after each successful upload, per transport.
    #[must_use]
    pub const fn with_pauses(mut self, bot_api: Duration, large_file: Duration) -> Self {
        self.bot_api_pause = bot_api;
        self.large_file_pause = large_file;
        self
    }

    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self.permits = Arc::new(Semaphore::new(self.max_concurrent));
        self
    }

    #[must_use]
    pub fn large_file_available(&self) -> bool {
        self.large_file.is_some()
    }

    #[must_use]
    pub const fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    fn transport(&self, method: UploadMethod) -> Option<&Arc<dyn UploadTransport>> {
        match method {
            UploadMethod::BotApi => Some(&self.bot_api),
            UploadMethod::LargeFile => self.large_file.as_ref(),
        }
    }

    const fn pause(&self, method: UploadMethod) -> Duration {
        match method {
            UploadMethod::BotApi => self.bot_api_pause,
            UploadMethod::LargeFile => self.large_file_pause,
        }
    }

    /// Upload every job; together with other callers at most
    /// `max_concurrent` uploads are in flight.
    ///
    /// Outcomes come back in completion order.
    pub async fn upload_all(
        &self,
        jobs: Vec<UploadJob>,
        events: Option<Sender<ProgressEvent>>,
    ) -> Vec<UploadOutcome> {
        stream::iter(jobs)
            .map(|job| self.upload(job, events.as_ref()))
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await
    }

    /// Upload a single file, deleting it once delivered.
    ///
    /// Waits for a slot in the service-wide concurrency limit first.
    pub async fn upload(
        &self,
        job: UploadJob,
        events: Option<&Sender<ProgressEvent>>,
    ) -> UploadOutcome {
        // The semaphore is never closed
        let _permit = self.permits.acquire().await.ok();
        let file_name = display_name(&job.path);
        emit(events, ProgressEvent::UploadStarted {
            file: file_name.clone(),
        })
        .await;

        let size = match tokio::fs::metadata(&job.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                let err = if e.kind() == std::io::ErrorKind::NotFound {
                    UploadError::FileMissing(job.path.clone())
                } else {
                    UploadError::Io {
                        path: job.path.clone(),
                        source: e,
                    }
                };
                return self.finish(job, file_name, 0, Err(err), false, events).await;
            }
        };

        let method = match select_method(size, &self.limits, self.large_file_available()) {
            Ok(m) => m,
            Err(e) => return self.finish(job, file_name, size, Err(e), false, events).await,
        };

        let request = UploadRequest {
            chat_id: job.chat_id,
            path: job.path.clone(),
            kind: MediaKind::for_upload(&job.path, size),
            caption: job.caption.clone(),
        };

        let mut fell_back = false;
        let mut result = self.send_via(method, &request).await.map(|()| method);

        if let Err(e) = &result {
            if method == UploadMethod::BotApi
                && self
                    .large_file
                    .as_ref()
                    .is_some_and(|t| size <= t.max_file_size())
            {
                warn!(
                    file = %file_name,
                    size,
                    error = %e,
                    "Bot API upload failed, falling back to large-file transport"
                );
                emit(events, ProgressEvent::Fallback {
                    file: file_name.clone(),
                })
                .await;
                fell_back = true;
                result = self
                    .send_via(UploadMethod::LargeFile, &request)
                    .await
                    .map(|()| UploadMethod::LargeFile);
            }
        }

        self.finish(job, file_name, size, result, fell_back, events)
            .await
    }

    async fn send_via(
        &self,
        method: UploadMethod,
        request: &UploadRequest,
    ) -> Result<(), UploadError> {
        let transport = self.transport(method).ok_or_else(|| {
            UploadError::Rejected(format!("{method} transport is not configured"))
        })?;
        debug!(method = %method, path = %request.path.display(), "Uploading file");
        retry_with_backoff(&self.backoff, method.as_str(), |_| transport.send(request)).await
    }

    async fn finish(
        &self,
        job: UploadJob,
        file_name: String,
        size: u64,
        result: Result<UploadMethod, UploadError>,
        fell_back: bool,
        events: Option<&Sender<ProgressEvent>>,
    ) -> UploadOutcome {
        let op = FileOperation {
            download_id: job.download_id,
            file_path: job.path.display().to_string(),
            file_size: size,
            operation: OperationKind::Upload,
            method: result.as_ref().ok().copied(),
            success: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        };
        if let Err(e) = self.store.log_file_operation(op).await {
            warn!(error = %e, file = %file_name, "Failed to record upload");
        }

        match &result {
            Ok(method) => {
                info!(file = %file_name, size, method = %method, "File uploaded");
                emit(events, ProgressEvent::Uploaded {
                    file: file_name,
                    method: *method,
                })
                .await;
                tokio::time::sleep(self.pause(*method)).await;
                if let Err(e) = tokio::fs::remove_file(&job.path).await {
                    warn!(error = %e, path = %job.path.display(), "Failed to delete uploaded file");
                }
            }
            Err(e) => {
                warn!(file = %file_name, size, error = %e, "Upload failed");
                emit(events, ProgressEvent::UploadFailed {
                    file: file_name,
                    error: e.to_string(),
                })
                .await;
            }
        }

        UploadOutcome {
            path: job.path,
            size,
            result,
            fell_back,
        }
    }
}

fn display_name(path: &std::path::Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |n| n.to_string_lossy().into_owned(),
    )
}

async fn emit(events: Option<&Sender<ProgressEvent>>, event: ProgressEvent) {
    if let Some(tx) = events {
        // Progress is best effort; a closed channel only means nobody is watching
        let _ = tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MockStatsStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Transport replaying scripted results and recording calls.
    struct ScriptedTransport {
        method: UploadMethod,
        max: u64,
        script: Mutex<VecDeque<Result<(), UploadError>>>,
        calls: Mutex<Vec<PathBuf>>,
    }

    impl ScriptedTransport {
        fn new(method: UploadMethod, script: Vec<Result<(), UploadError>>) -> Arc<Self> {
            Arc::new(Self {
                method,
                max: 2048 * 1024 * 1024,
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl UploadTransport for ScriptedTransport {
        fn method(&self) -> UploadMethod {
            self.method
        }

        fn max_file_size(&self) -> u64 {
            self.max
        }

        async fn send(&self, request: &UploadRequest) -> Result<(), UploadError> {
            self.calls.lock().push(request.path.clone());
            self.script.lock().pop_front().unwrap_or(Ok(()))
        }
    }

    fn limits() -> UploadLimits {
        UploadLimits {
            threshold: 100,
            bot_api_max: 200,
            large_file_max: 10_000,
        }
    }

    fn backoff() -> BackoffPolicy {
        BackoffPolicy::new(3, Duration::from_secs(1), Duration::from_secs(4))
    }

    fn store_expecting(success: bool, method: Option<UploadMethod>) -> Arc<MockStatsStore> {
        let mut store = MockStatsStore::new();
        store
            .expect_log_file_operation()
            .withf(move |op| {
                op.success == success
                    && op.method == method
                    && op.operation == OperationKind::Upload
            })
            .times(1)
            .returning(|_| Ok(1));
        Arc::new(store)
    }

    fn write_file(dir: &TempDir, name: &str, size: usize) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, vec![0u8; size]).expect("write test file");
        path
    }

    fn job(path: PathBuf) -> UploadJob {
        UploadJob {
            path,
            caption: None,
            chat_id: 1,
            download_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn small_file_goes_through_bot_api_and_is_deleted() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.jpg", 50);
        let bot_api = ScriptedTransport::new(UploadMethod::BotApi, vec![]);
        let large = ScriptedTransport::new(UploadMethod::LargeFile, vec![]);
        let service = UploadService::new(
            bot_api.clone(),
            Some(large.clone() as Arc<dyn UploadTransport>),
            limits(),
            backoff(),
            store_expecting(true, Some(UploadMethod::BotApi)),
        );

        let outcome = service.upload(job(path.clone()), None).await;

        assert_eq!(outcome.result.ok(), Some(UploadMethod::BotApi));
        assert!(!outcome.fell_back);
        assert_eq!(bot_api.call_count(), 1);
        assert_eq!(large.call_count(), 0);
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn large_file_skips_bot_api() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.mp4", 150);
        let bot_api = ScriptedTransport::new(UploadMethod::BotApi, vec![]);
        let large = ScriptedTransport::new(UploadMethod::LargeFile, vec![]);
        let service = UploadService::new(
            bot_api.clone(),
            Some(large.clone() as Arc<dyn UploadTransport>),
            limits(),
            backoff(),
            store_expecting(true, Some(UploadMethod::LargeFile)),
        );

        let outcome = service.upload(job(path), None).await;

        assert_eq!(outcome.result.ok(), Some(UploadMethod::LargeFile));
        assert_eq!(bot_api.call_count(), 0);
        assert_eq!(large.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_within_budget() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.jpg", 10);
        let bot_api = ScriptedTransport::new(
            UploadMethod::BotApi,
            vec![
                Err(UploadError::Network("reset".into())),
                Err(UploadError::Network("reset".into())),
                Ok(()),
            ],
        );
        let service = UploadService::new(
            bot_api.clone(),
            None,
            limits(),
            backoff(),
            store_expecting(true, Some(UploadMethod::BotApi)),
        );

        let outcome = service.upload(job(path), None).await;

        assert!(outcome.is_success());
        assert_eq!(bot_api.call_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn bot_api_failure_falls_back_to_large_transport() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.jpg", 10);
        let bot_api = ScriptedTransport::new(
            UploadMethod::BotApi,
            vec![Err(UploadError::Rejected("Request Entity Too Large".into()))],
        );
        let large = ScriptedTransport::new(UploadMethod::LargeFile, vec![]);
        let service = UploadService::new(
            bot_api.clone(),
            Some(large.clone() as Arc<dyn UploadTransport>),
            limits(),
            backoff(),
            store_expecting(true, Some(UploadMethod::LargeFile)),
        );

        let outcome = service.upload(job(path), None).await;

        assert_eq!(outcome.result.ok(), Some(UploadMethod::LargeFile));
        assert!(outcome.fell_back);
        // Non-transient error: no retries on the primary
        assert_eq!(bot_api.call_count(), 1);
        assert_eq!(large.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_large_transport_keeps_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_file(&dir, "a.jpg", 10);
        let bot_api = ScriptedTransport::new(
            UploadMethod::BotApi,
            vec![Err(UploadError::Rejected("chat not found".into()))],
        );
        let service = UploadService::new(
            bot_api.clone(),
            None,
            limits(),
            backoff(),
            store_expecting(false, None),
        );

        let outcome = service.upload(job(path.clone()), None).await;

        assert!(matches!(outcome.result, Err(UploadError::Rejected(_))));
        assert!(!outcome.fell_back);
        assert!(path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_file_is_reported() {
        let dir = TempDir::new().expect("tempdir");
        let bot_api = ScriptedTransport::new(UploadMethod::BotApi, vec![]);
        let service = UploadService::new(
            bot_api.clone(),
            None,
            limits(),
            backoff(),
            store_expecting(false, None),
        );

        let outcome = service
            .upload(job(dir.path().join("gone.jpg")), None)
            .await;

        assert!(matches!(outcome.result, Err(UploadError::FileMissing(_))));
        assert_eq!(bot_api.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn upload_all_reports_every_job_and_events() {
        let dir = TempDir::new().expect("tempdir");
        let jobs: Vec<UploadJob> = (0..5)
            .map(|i| job(write_file(&dir, &format!("{i}.jpg"), 10)))
            .collect();
        let bot_api = ScriptedTransport::new(UploadMethod::BotApi, vec![]);
        let mut store = MockStatsStore::new();
        store
            .expect_log_file_operation()
            .times(5)
            .returning(|_| Ok(1));
        let service = UploadService::new(bot_api.clone(), None, limits(), backoff(), Arc::new(store))
            .with_max_concurrent(2)
            .with_pauses(Duration::from_secs(1), Duration::ZERO);

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let outcomes = service.upload_all(jobs, Some(tx)).await;

        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(UploadOutcome::is_success));
        let mut uploaded = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, ProgressEvent::Uploaded { .. }) {
                uploaded += 1;
            }
        }
        assert_eq!(uploaded, 5);
    }

    /// Transport that tracks how many sends overlap.
    #[derive(Default)]
    struct GaugeTransport {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl UploadTransport for GaugeTransport {
        fn method(&self) -> UploadMethod {
            UploadMethod::BotApi
        }

        fn max_file_size(&self) -> u64 {
            1024
        }

        async fn send(&self, _request: &UploadRequest) -> Result<(), UploadError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_spans_simultaneous_requests() {
        let dir = TempDir::new().expect("tempdir");
        let batch = |prefix: &str| -> Vec<UploadJob> {
            (0..3)
                .map(|i| job(write_file(&dir, &format!("{prefix}{i}.jpg"), 10)))
                .collect()
        };
        let (first, second) = (batch("a"), batch("b"));

        let transport = Arc::new(GaugeTransport::default());
        let mut store = MockStatsStore::new();
        store
            .expect_log_file_operation()
            .times(6)
            .returning(|_| Ok(1));
        let service = UploadService::new(
            transport.clone(),
            None,
            limits(),
            backoff(),
            Arc::new(store),
        )
        .with_max_concurrent(2);

        let (a, b) = tokio::join!(
            service.upload_all(first, None),
            service.upload_all(second, None)
        );

        assert_eq!(a.len() + b.len(), 6);
        assert!(a.iter().chain(&b).all(UploadOutcome::is_success));
        assert_eq!(transport.peak.load(Ordering::SeqCst), 2);
    }
}
