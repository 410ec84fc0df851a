//! Operation log and Instagram session bookkeeping.
//!
//! [`StatsStore`] is the seam the rest of the bot talks to; [`SqliteStore`]
//! is the production implementation.

mod sqlite;

pub use sqlite::SqliteStore;

use crate::upload::UploadMethod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to open or prepare the database file
    #[error("failed to open database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },
    /// A query failed
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Filesystem error around the database file
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The blocking task running the query died
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    /// Referenced row does not exist
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Success,
    /// Some files failed to upload
    Partial,
    Failed,
}

impl DownloadStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Download,
    Upload,
}

impl OperationKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

/// One file-level operation for the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOperation {
    pub download_id: Option<i64>,
    pub file_path: String,
    pub file_size: u64,
    pub operation: OperationKind,
    pub method: Option<UploadMethod>,
    pub success: bool,
    pub error: Option<String>,
}

/// Aggregates shown by `/stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub partial_downloads: u64,
    pub failed_downloads: u64,
    pub files_downloaded: u64,
    pub bytes_downloaded: u64,
    pub successful_uploads: u64,
    pub failed_uploads: u64,
    pub bytes_uploaded: u64,
    pub bot_api_uploads: u64,
    pub large_file_uploads: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentTypeCount {
    pub content_type: String,
    pub count: u64,
}

/// How the session credentials reach the download tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    CookiesFile,
    Browser,
}

impl SessionType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CookiesFile => "cookies_file",
            Self::Browser => "browser",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cookies_file" => Some(Self::CookiesFile),
            "browser" => Some(Self::Browser),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSession {
    pub user_id: i64,
    pub username: Option<String>,
    pub session_type: SessionType,
    /// Cookies file path or browser name
    pub source: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: i64,
    pub user_id: i64,
    pub username: Option<String>,
    pub session_type: SessionType,
    pub source: Option<String>,
    pub is_active: bool,
    pub last_validated: Option<String>,
    pub expires_at: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionValidation {
    pub id: i64,
    pub session_id: i64,
    pub is_valid: bool,
    pub error_message: Option<String>,
    pub checked_at: String,
}

/// Persistence used by the bot.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Start tracking a download request; returns its id.
    async fn record_download(&self, url: &str, content_type: &str) -> Result<i64, StorageError>;

    async fn finish_download(
        &self,
        id: i64,
        status: DownloadStatus,
        file_count: usize,
        error: Option<String>,
    ) -> Result<(), StorageError>;

    async fn log_file_operation(&self, op: FileOperation) -> Result<i64, StorageError>;

    async fn get_statistics(&self) -> Result<Statistics, StorageError>;

    /// Download counts grouped by content kind, most common first.
    async fn content_type_stats(&self) -> Result<Vec<ContentTypeCount>, StorageError>;

    /// Store a new active session, deactivating any previous active one of
    /// the same user and type.
    async fn store_session(&self, session: NewSession) -> Result<i64, StorageError>;

    async fn active_session(
        &self,
        user_id: i64,
        session_type: SessionType,
    ) -> Result<Option<SessionRecord>, StorageError>;

    async fn list_sessions(&self, user_id: i64) -> Result<Vec<SessionRecord>, StorageError>;

    async fn log_session_validation(
        &self,
        session_id: i64,
        is_valid: bool,
        error_message: Option<String>,
    ) -> Result<i64, StorageError>;

    async fn recent_validations(
        &self,
        session_id: i64,
        limit: usize,
    ) -> Result<Vec<SessionValidation>, StorageError>;

    /// Deactivate sessions past their expiry; returns how many changed.
    async fn cleanup_expired_sessions(&self) -> Result<usize, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}
