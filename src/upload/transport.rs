//! Upload transports.
//!
//! Both transports speak the Bot API through `teloxide`; the large-file one
//! points at a self-hosted `telegram-bot-api` server, which accepts uploads
//! up to 2 GB instead of the cloud's 50 MB.

use super::{MediaKind, UploadError, UploadMethod};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{InputFile, ParseMode};
use teloxide::RequestError;

/// One file to deliver.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub chat_id: i64,
    pub path: PathBuf,
    pub kind: MediaKind,
    /// HTML caption
    pub caption: Option<String>,
}

/// A way of getting a file into a Telegram chat.
#[async_trait]
pub trait UploadTransport: Send + Sync {
    fn method(&self) -> UploadMethod;

    /// Largest file this transport accepts, in bytes.
    fn max_file_size(&self) -> u64;

    async fn send(&self, request: &UploadRequest) -> Result<(), UploadError>;
}

/// Transport backed by a `teloxide::Bot`.
#[derive(Clone)]
pub struct TelegramTransport {
    bot: Bot,
    method: UploadMethod,
    max_file_size: u64,
}

impl TelegramTransport {
    /// Transport for the cloud Bot API.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn cloud(
        token: &str,
        connect_timeout: Duration,
        timeout: Duration,
        max_file_size: u64,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            bot: build_bot(token, connect_timeout, timeout)?,
            method: UploadMethod::BotApi,
            max_file_size,
        })
    }

    /// Transport for a self-hosted Bot API server at `api_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or the HTTP client cannot be built.
    pub fn local_server(
        token: &str,
        api_url: &str,
        connect_timeout: Duration,
        timeout: Duration,
        max_file_size: u64,
    ) -> anyhow::Result<Self> {
        let url = reqwest::Url::parse(api_url)
            .map_err(|e| anyhow::anyhow!("invalid LOCAL_BOT_API_URL {api_url:?}: {e}"))?;
        Ok(Self {
            bot: build_bot(token, connect_timeout, timeout)?.set_api_url(url),
            method: UploadMethod::LargeFile,
            max_file_size,
        })
    }

    #[must_use]
    pub const fn bot(&self) -> &Bot {
        &self.bot
    }
}

fn build_bot(token: &str, connect_timeout: Duration, timeout: Duration) -> anyhow::Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .connect_timeout(connect_timeout)
        .timeout(timeout)
        .build()?;
    Ok(Bot::with_client(token, client))
}

#[async_trait]
impl UploadTransport for TelegramTransport {
    fn method(&self) -> UploadMethod {
        self.method
    }

    fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    async fn send(&self, request: &UploadRequest) -> Result<(), UploadError> {
        let chat_id = ChatId(request.chat_id);
        let file = InputFile::file(request.path.clone());
        let caption = request.caption.clone();

        let result = match request.kind {
            MediaKind::Photo => {
                let mut req = self.bot.send_photo(chat_id, file);
                if let Some(c) = caption {
                    req = req.caption(c).parse_mode(ParseMode::Html);
                }
                req.await.map(drop)
            }
            MediaKind::Video => {
                let mut req = self.bot.send_video(chat_id, file).supports_streaming(true);
                if let Some(c) = caption {
                    req = req.caption(c).parse_mode(ParseMode::Html);
                }
                req.await.map(drop)
            }
            MediaKind::Audio => {
                let mut req = self.bot.send_audio(chat_id, file);
                if let Some(c) = caption {
                    req = req.caption(c).parse_mode(ParseMode::Html);
                }
                req.await.map(drop)
            }
            MediaKind::Document => {
                let mut req = self.bot.send_document(chat_id, file);
                if let Some(c) = caption {
                    req = req.caption(c).parse_mode(ParseMode::Html);
                }
                req.await.map(drop)
            }
        };

        result.map_err(UploadError::from)
    }
}

/// Substrings of Bot API error descriptions that indicate a server-side hiccup.
const TRANSIENT_API_PATTERNS: &[&str] = &[
    "bad gateway",
    "gateway timeout",
    "internal server error",
    "service unavailable",
    "timed out",
];

impl From<RequestError> for UploadError {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::RetryAfter(secs) => Self::RateLimited(secs.duration()),
            RequestError::Network(err) => Self::Network(err.to_string()),
            RequestError::Io(err) => Self::Network(err.to_string()),
            RequestError::Api(api) => {
                let text = api.to_string();
                let lower = text.to_lowercase();
                if TRANSIENT_API_PATTERNS.iter().any(|p| lower.contains(p)) {
                    Self::Network(text)
                } else {
                    Self::Rejected(text)
                }
            }
            other => Self::Rejected(other.to_string()),
        }
    }
}
