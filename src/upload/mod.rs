//! Upload of downloaded media to Telegram.
//!
//! Two transports are available: the cloud Bot API ([`UploadMethod::BotApi`])
//! and an optional self-hosted Bot API server for large files
//! ([`UploadMethod::LargeFile`]). [`select_method`] picks one by size, and
//! [`UploadService`] adds retries, fallback and bookkeeping on top.

pub mod retry;
pub mod service;
pub mod transport;

pub use retry::{retry_with_backoff, BackoffPolicy, RetryClass};
pub use service::{UploadJob, UploadOutcome, UploadService};
pub use transport::{TelegramTransport, UploadRequest, UploadTransport};

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Telegram refuses `sendPhoto` above this size
pub const PHOTO_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Which transport carried (or should carry) a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UploadMethod {
    BotApi,
    LargeFile,
}

impl UploadMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::BotApi => "bot_api",
            Self::LargeFile => "large_file",
        }
    }
}

impl std::fmt::Display for UploadMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Size limits driving transport selection, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadLimits {
    /// Above this, prefer the large-file transport
    pub threshold: u64,
    pub bot_api_max: u64,
    pub large_file_max: u64,
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("file not found: {}", .0.display())]
    FileMissing(PathBuf),
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("file is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },
    #[error("rate limited by Telegram, retry after {}s", .0.as_secs())]
    RateLimited(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected by Telegram: {0}")]
    Rejected(String),
}

impl RetryClass for UploadError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Network(_))
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(d) => Some(*d),
            _ => None,
        }
    }
}

/// Choose the transport for a file of `size` bytes.
///
/// Pure function of its inputs: files above the threshold go through the
/// large-file transport when one is configured, everything else through the
/// Bot API as long as it fits.
///
/// # Errors
///
/// Returns [`UploadError::TooLarge`] when no available transport accepts the size.
pub fn select_method(
    size: u64,
    limits: &UploadLimits,
    large_available: bool,
) -> Result<UploadMethod, UploadError> {
    if large_available && size > limits.threshold {
        if size > limits.large_file_max {
            return Err(UploadError::TooLarge {
                size,
                limit: limits.large_file_max,
            });
        }
        return Ok(UploadMethod::LargeFile);
    }
    if size <= limits.bot_api_max {
        return Ok(UploadMethod::BotApi);
    }
    if large_available && size <= limits.large_file_max {
        return Ok(UploadMethod::LargeFile);
    }
    let limit = if large_available {
        limits.large_file_max
    } else {
        limits.bot_api_max
    };
    Err(UploadError::TooLarge { size, limit })
}

/// Telegram send method a file maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "jpg" | "jpeg" | "png" | "webp" => Self::Photo,
            "mp4" | "mov" | "m4v" | "webm" | "mkv" => Self::Video,
            "mp3" | "m4a" | "ogg" | "wav" | "aac" => Self::Audio,
            _ => Self::Document,
        }
    }

    /// Like [`MediaKind::from_path`], but oversized photos go as documents.
    #[must_use]
    pub fn for_upload(path: &Path, size: u64) -> Self {
        match Self::from_path(path) {
            Self::Photo if size > PHOTO_MAX_SIZE => Self::Document,
            kind => kind,
        }
    }
}
