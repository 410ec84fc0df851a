//! Download Instagram media by running `gallery-dl` or `yt-dlp`.

use super::url::{ContentKind, InstagramUrl};
use crate::upload::{retry_with_backoff, BackoffPolicy, RetryClass};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Page used to probe whether the session cookies still work
const SESSION_PROBE_URL: &str = "https://www.instagram.com/";
const SESSION_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Profile links fetch only this many of the newest posts
const PROFILE_RECENT_POSTS: usize = 12;

const MEDIA_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "webp", "heic", "mp4", "mov", "m4v", "webm", "mkv", "mp3", "m4a",
];

// Matched against lowercased stderr, checked in this order
const AUTH_ERROR_PATTERNS: &[&str] = &[
    "http redirect to login page",
    "login required",
    "authentication",
    "403 forbidden",
    "401 unauthorized",
    "checkpoint required",
];

const PRIVATE_ERROR_PATTERNS: &[&str] = &["private account", "this account is private"];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "429",
    "too many requests",
    "rate limit",
    "please wait a few minutes",
];

const UNSUPPORTED_PATTERNS: &[&str] = &["unsupported url", "no suitable extractor"];

const NOT_FOUND_PATTERNS: &[&str] = &["not found", "404", "no longer available", "expired"];

const NETWORK_ERROR_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "connection aborted",
    "timed out",
    "temporary failure in name resolution",
    "remote end closed connection",
    "502 bad gateway",
    "503 service unavailable",
];

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Instagram authentication failed: {0}")]
    Auth(String),
    #[error("the account is private")]
    Private,
    #[error("content not found or expired")]
    NotFound,
    #[error("unsupported Instagram link: {0}")]
    Unsupported(String),
    #[error("rate limited by Instagram")]
    RateLimited,
    #[error("download timed out after {0}s")]
    Timeout(u64),
    #[error("network error: {0}")]
    Network(String),
    #[error("{tool} could not be started: {source}")]
    ToolMissing {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no media files were downloaded")]
    NoFiles,
    #[error("{tool} exited with status {code:?}: {stderr}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DownloadError {
    /// Errors the operator has to fix (cookies, tooling), not the user.
    #[must_use]
    pub const fn is_operator_error(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::ToolMissing { .. })
    }

    /// Short text safe to show in chat.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Auth(_) => {
                "🔐 Instagram session is invalid or expired. The bot operator has been notified."
                    .to_string()
            }
            Self::Private => "🔒 This account is private.".to_string(),
            Self::NotFound => "🔍 Content not found or no longer available.".to_string(),
            Self::Unsupported(_) => "🚫 This kind of Instagram link is not supported.".to_string(),
            Self::RateLimited => "⏳ Instagram is rate limiting us, try again later.".to_string(),
            Self::Timeout(secs) => format!("⌛ Download timed out after {secs}s."),
            Self::Network(_) => "🌐 Network error while downloading, try again later.".to_string(),
            Self::ToolMissing { .. } => "⚙️ Downloader is not available on the server.".to_string(),
            Self::NoFiles => "📭 Nothing was downloaded from this link.".to_string(),
            Self::Failed { .. } | Self::Io(_) => "❌ Download failed.".to_string(),
        }
    }
}

impl RetryClass for DownloadError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout(_) | Self::Network(_))
    }
}

/// Map a failed tool run to an error by inspecting its stderr.
#[must_use]
pub fn classify_failure(tool: &str, code: Option<i32>, stderr: &str) -> DownloadError {
    let lower = stderr.to_lowercase();
    let matches_any = |patterns: &[&str]| patterns.iter().any(|p| lower.contains(p));

    if matches_any(AUTH_ERROR_PATTERNS) {
        DownloadError::Auth(last_line(stderr))
    } else if matches_any(PRIVATE_ERROR_PATTERNS) {
        DownloadError::Private
    } else if matches_any(RATE_LIMIT_PATTERNS) {
        DownloadError::RateLimited
    } else if matches_any(UNSUPPORTED_PATTERNS) {
        DownloadError::Unsupported(last_line(stderr))
    } else if matches_any(NOT_FOUND_PATTERNS) {
        DownloadError::NotFound
    } else if matches_any(NETWORK_ERROR_PATTERNS) {
        DownloadError::Network(last_line(stderr))
    } else {
        DownloadError::Failed {
            tool: tool.to_string(),
            code,
            stderr: last_line(stderr),
        }
    }
}

fn last_line(text: &str) -> String {
    crate::utils::truncate_str(
        text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("").trim(),
        300,
    )
}

/// Result of probing the configured session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCheck {
    pub valid: bool,
    pub message: String,
}

/// Fetches the media behind an Instagram URL into a directory.
#[async_trait]
pub trait MediaDownloader: Send + Sync {
    /// Download into `dest`, returning the media files in carousel order.
    async fn download(&self, url: &InstagramUrl, dest: &Path)
        -> Result<Vec<PathBuf>, DownloadError>;

    /// Check whether the configured session cookies are accepted.
    async fn check_session(&self) -> SessionCheck;
}

/// Where the download tools get their Instagram cookies from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieSource {
    File(PathBuf),
    Browser(String),
    None,
}

impl CookieSource {
    fn args(&self) -> Vec<OsString> {
        match self {
            Self::File(path) => vec!["--cookies".into(), path.clone().into_os_string()],
            Self::Browser(name) => vec!["--cookies-from-browser".into(), name.into()],
            Self::None => Vec::new(),
        }
    }
}

/// Keeps consecutive Instagram requests at least `min_interval` apart.
pub struct RequestPacer {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RequestPacer {
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait for our turn. Callers are served one at a time.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(at) = *last {
            let next = at + self.min_interval;
            if next > Instant::now() {
                debug!(
                    wait_ms = u64::try_from((next - Instant::now()).as_millis()).unwrap_or(0),
                    "Pacing Instagram request"
                );
                tokio::time::sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// [`MediaDownloader`] backed by the `gallery-dl` and `yt-dlp` executables.
pub struct ExternalDownloader {
    gallery_dl: String,
    yt_dlp: String,
    cookies: CookieSource,
    timeout: Duration,
    backoff: BackoffPolicy,
    pacer: RequestPacer,
}

impl ExternalDownloader {
    #[must_use]
    pub fn new(
        gallery_dl: String,
        yt_dlp: String,
        cookies: CookieSource,
        timeout: Duration,
        backoff: BackoffPolicy,
        min_request_interval: Duration,
    ) -> Self {
        Self {
            gallery_dl,
            yt_dlp,
            cookies,
            timeout,
            backoff,
            pacer: RequestPacer::new(min_request_interval),
        }
    }

    #[must_use]
    pub const fn cookies(&self) -> &CookieSource {
        &self.cookies
    }

    /// Program and arguments for downloading `url` into `dest`.
    #[must_use]
    pub fn command_for(&self, url: &InstagramUrl, dest: &Path) -> (String, Vec<OsString>) {
        let mut args = self.cookies.args();
        let program = match url.kind() {
            ContentKind::Story | ContentKind::Highlight => {
                args.push("--write-info-json".into());
                args.push("--no-warnings".into());
                args.push("-o".into());
                args.push(dest.join("%(title)s-%(id)s.%(ext)s").into_os_string());
                self.yt_dlp.clone()
            }
            kind => {
                if kind == ContentKind::Profile {
                    args.push("--range".into());
                    args.push(format!("1-{PROFILE_RECENT_POSTS}").into());
                }
                args.push("--write-metadata".into());
                args.push("-D".into());
                args.push(dest.as_os_str().to_os_string());
                self.gallery_dl.clone()
            }
        };
        args.push(url.as_str().into());
        (program, args)
    }

    async fn run_once(&self, url: &InstagramUrl, dest: &Path) -> Result<Vec<PathBuf>, DownloadError> {
        let (program, args) = self.command_for(url, dest);
        tokio::fs::create_dir_all(dest).await?;
        self.pacer.wait().await;

        info!(tool = %program, url = %url, dest = %dest.display(), "Running downloader");
        let output = run_tool(&program, &args, self.timeout).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.stdout.is_empty() {
            debug!(tool = %program, stdout = %String::from_utf8_lossy(&output.stdout), "Downloader output");
        }

        if !output.status.success() {
            warn!(tool = %program, code = ?output.status.code(), stderr = %stderr, "Downloader failed");
            return Err(classify_failure(&program, output.status.code(), &stderr));
        }

        let files = find_media_files(dest).await?;
        if files.is_empty() {
            return Err(match url.kind() {
                ContentKind::Story | ContentKind::Highlight => DownloadError::NotFound,
                _ => DownloadError::NoFiles,
            });
        }
        info!(url = %url, files = files.len(), "Download finished");
        Ok(files)
    }
}

async fn run_tool(
    program: &str,
    args: &[OsString],
    timeout: Duration,
) -> Result<std::process::Output, DownloadError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => Err(DownloadError::Timeout(timeout.as_secs())),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(DownloadError::ToolMissing {
            tool: program.to_string(),
            source: e,
        }),
        Ok(Err(e)) => Err(DownloadError::Io(e)),
        Ok(Ok(output)) => Ok(output),
    }
}

#[async_trait]
impl MediaDownloader for ExternalDownloader {
    async fn download(
        &self,
        url: &InstagramUrl,
        dest: &Path,
    ) -> Result<Vec<PathBuf>, DownloadError> {
        retry_with_backoff(&self.backoff, "instagram download", |_| self.run_once(url, dest)).await
    }

    async fn check_session(&self) -> SessionCheck {
        if self.cookies == CookieSource::None {
            return SessionCheck {
                valid: false,
                message: "No Instagram cookies configured".to_string(),
            };
        }

        let mut args = self.cookies.args();
        args.push("--simulate".into());
        args.push(SESSION_PROBE_URL.into());

        self.pacer.wait().await;
        match run_tool(&self.gallery_dl, &args, SESSION_PROBE_TIMEOUT).await {
            Ok(output) if output.status.success() => SessionCheck {
                valid: true,
                message: "Session is valid".to_string(),
            },
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let message = match classify_failure(&self.gallery_dl, output.status.code(), &stderr)
                {
                    DownloadError::Auth(_) => "Session expired or invalid".to_string(),
                    other => other.to_string(),
                };
                SessionCheck {
                    valid: false,
                    message,
                }
            }
            Err(e) => SessionCheck {
                valid: false,
                message: e.to_string(),
            },
        }
    }
}

/// Media files under `dir`, hidden and partial files skipped, sorted by name.
///
/// # Errors
///
/// Returns an error if the blocking directory walk cannot be scheduled.
pub async fn find_media_files(dir: &Path) -> Result<Vec<PathBuf>, DownloadError> {
    let dir = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || {
        let mut files: Vec<PathBuf> = WalkDir::new(&dir)
            .max_depth(3)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .map(walkdir::DirEntry::into_path)
            .filter(|p| is_media_file(p))
            .collect();
        files.sort();
        files
    })
    .await
    .map_err(|e| DownloadError::Io(std::io::Error::other(e)))?;
    Ok(files)
}

fn is_media_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| MEDIA_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}
