//! Throttled status reporting for a single download request.
//!
//! The pipeline pushes [`ProgressEvent`]s into a channel; a background loop
//! folds them into a [`ProgressState`] and pushes rendered status text to a
//! [`StatusSink`] no more often than the configured throttle.

use crate::upload::UploadMethod;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// Download finished with this many files to upload
    Downloaded { files: usize },
    UploadStarted { file: String },
    Uploaded { file: String, method: UploadMethod },
    /// Primary transport failed, trying the large-file one
    Fallback { file: String },
    UploadFailed { file: String, error: String },
}

/// Aggregated upload progress.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub total: usize,
    pub in_flight: usize,
    pub uploaded: usize,
    pub failed: usize,
    pub via_bot_api: usize,
    pub via_large_file: usize,
    pub fallbacks: usize,
    pub last_error: Option<String>,
}

impl ProgressState {
    pub fn update(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::Downloaded { files } => self.total = files,
            ProgressEvent::UploadStarted { .. } => self.in_flight += 1,
            ProgressEvent::Uploaded { method, .. } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.uploaded += 1;
                match method {
                    UploadMethod::BotApi => self.via_bot_api += 1,
                    UploadMethod::LargeFile => self.via_large_file += 1,
                }
            }
            ProgressEvent::Fallback { .. } => self.fallbacks += 1,
            ProgressEvent::UploadFailed { file, error } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.failed += 1;
                self.last_error = Some(format!("{file}: {error}"));
            }
        }
    }

    #[must_use]
    pub const fn processed(&self) -> usize {
        self.uploaded + self.failed
    }

    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.total > 0 && self.processed() >= self.total
    }

    /// HTML status text for Telegram.
    #[must_use]
    pub fn render(&self) -> String {
        let mut text = if self.is_complete() {
            format!(
                "✅ <b>Upload finished</b>\n📤 {}/{} uploaded",
                self.uploaded, self.total
            )
        } else {
            format!(
                "📤 <b>Uploading</b> {}/{}\n⏳ In progress: {}",
                self.processed(),
                self.total,
                self.in_flight
            )
        };

        if self.via_large_file > 0 {
            text.push_str(&format!(
                "\n🚀 Bot API: {} · large-file server: {}",
                self.via_bot_api, self.via_large_file
            ));
        }
        if self.fallbacks > 0 {
            text.push_str(&format!("\n🔁 Fallbacks: {}", self.fallbacks));
        }
        if self.failed > 0 {
            text.push_str(&format!("\n❌ Failed: {}", self.failed));
            if let Some(err) = &self.last_error {
                text.push_str(&format!(
                    "\n<i>{}</i>",
                    html_escape::encode_text(&crate::utils::truncate_str(err, 200))
                ));
            }
        }
        text
    }
}

/// Destination for rendered status text.
#[async_trait]
pub trait StatusSink: Send + Sync + 'static {
    async fn update_status(&self, text: &str) -> Result<()>;
}

/// Runtime configuration for progress updates.
#[derive(Debug, Clone, Copy)]
pub struct ProgressRuntimeConfig {
    /// Minimum duration between status updates.
    pub throttle: Duration,
}

impl ProgressRuntimeConfig {
    #[must_use]
    pub const fn new(throttle: Duration) -> Self {
        Self { throttle }
    }
}

/// Spawn the progress loop on the Tokio runtime.
pub fn spawn_progress_runtime<S: StatusSink>(
    sink: S,
    rx: Receiver<ProgressEvent>,
    config: ProgressRuntimeConfig,
) -> JoinHandle<ProgressState> {
    tokio::spawn(run_progress_loop(sink, rx, config))
}

/// Run the progress loop until the channel is closed, returning the final state.
///
/// The last state is always flushed; when it arrives inside the throttle
/// window the flush waits for the window to end.
pub async fn run_progress_loop<S: StatusSink>(
    sink: S,
    mut rx: Receiver<ProgressEvent>,
    config: ProgressRuntimeConfig,
) -> ProgressState {
    let mut state = ProgressState::default();
    let mut last_update: Option<Instant> = None;
    let mut needs_update = false;

    while let Some(event) = rx.recv().await {
        state.update(event);
        needs_update = true;

        if last_update.is_none_or(|at| at.elapsed() >= config.throttle) {
            if let Err(e) = sink.update_status(&state.render()).await {
                warn!(error = %e, "Status update failed");
            }
            last_update = Some(Instant::now());
            needs_update = false;
        }
    }

    if needs_update {
        if let Some(at) = last_update {
            tokio::time::sleep_until(at + config.throttle).await;
        }
        if let Err(e) = sink.update_status(&state.render()).await {
            warn!(error = %e, "Final status update failed");
        }
    }

    state
}
