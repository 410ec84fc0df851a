//! Configuration and settings management
//!
//! Loads settings from optional config files and environment variables and
//! exposes the typed views the rest of the bot works with.

use config::{Config, ConfigError, Environment, File};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::instagram::CookieSource;
use crate::upload::{BackoffPolicy, UploadLimits};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Telegram caption length limit
pub const TELEGRAM_CAPTION_LIMIT: usize = 1024;
/// Telegram message length we allow ourselves (hard limit is 4096)
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

// Telegram API retry for status messages
/// Initial backoff delay for Telegram API retries (milliseconds)
pub const TELEGRAM_API_INITIAL_BACKOFF_MS: u64 = 500;
/// Maximum backoff delay for Telegram API retries (milliseconds)
pub const TELEGRAM_API_MAX_BACKOFF_MS: u64 = 4000;
/// Maximum retry attempts for Telegram API operations
pub const TELEGRAM_API_MAX_RETRIES: usize = 3;

/// How long aggregated statistics stay cached
pub const STATS_CACHE_TTL_SECS: u64 = 60;

// Unauthorized access flood protection
/// Default cooldown between "Access Denied" messages to the same user (seconds)
pub const UNAUTHORIZED_COOLDOWN_SECS: u64 = 1200;
/// Default TTL for unauthorized cache entries (seconds)
pub const UNAUTHORIZED_CACHE_TTL_SECS: u64 = 7200;
/// Default maximum number of tracked unauthorized users
pub const UNAUTHORIZED_CACHE_MAX_SIZE: u64 = 10_000;

/// Byte size accepting either a plain number or a `50MB`-style string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// Parse `1024`, `512KB`, `50 MB`, `2gb` and friends (binary multiples).
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let s = input.trim().to_ascii_uppercase();
        if s.is_empty() {
            return None;
        }
        if let Ok(n) = s.parse::<u64>() {
            return Some(Self(n));
        }

        let split = s.find(|c: char| !c.is_ascii_digit())?;
        let (number, unit) = s.split_at(split);
        let number: u64 = number.parse().ok()?;
        let multiplier = match unit.trim() {
            "B" => 1,
            "KB" => KB,
            "MB" => MB,
            "GB" => GB,
            "TB" => GB * KB,
            _ => return None,
        };
        number.checked_mul(multiplier).map(Self)
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ByteSizeVisitor;

        impl Visitor<'_> for ByteSizeVisitor {
            type Value = ByteSize;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a byte count or a size like \"50MB\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ByteSize, E> {
                Ok(ByteSize(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ByteSize, E> {
                u64::try_from(v)
                    .map(ByteSize)
                    .map_err(|_| E::custom(format!("negative size: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ByteSize, E> {
                ByteSize::parse(v).ok_or_else(|| E::custom(format!("invalid size: {v:?}")))
            }
        }

        deserializer.deserialize_any(ByteSizeVisitor)
    }
}

/// Application settings loaded from environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub bot_token: String,

    /// Chat that receives uploads; `None` means the requesting chat
    pub target_chat_id: Option<i64>,

    /// Comma-separated list of user IDs allowed to use the bot
    #[serde(rename = "admin_user_ids")]
    pub admin_user_ids_str: Option<String>,

    /// Base URL of a self-hosted `telegram-bot-api` server
    pub local_bot_api_url: Option<String>,

    #[serde(default = "default_downloads_path")]
    pub downloads_path: PathBuf,
    #[serde(default = "default_temp_path")]
    pub temp_path: PathBuf,
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Files above this size go through the large-file transport
    #[serde(default = "default_large_file_threshold")]
    pub large_file_threshold: ByteSize,
    #[serde(default = "default_bot_api_max_size")]
    pub bot_api_max_size: ByteSize,
    #[serde(default = "default_large_file_max_size")]
    pub large_file_max_size: ByteSize,

    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: usize,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
    #[serde(default = "default_bot_api_pause_seconds")]
    pub bot_api_pause_seconds: f64,
    #[serde(default = "default_large_file_pause_seconds")]
    pub large_file_pause_seconds: f64,
    /// Minimum seconds between status message edits
    #[serde(default = "default_status_update_interval")]
    pub status_update_interval: f64,

    #[serde(default = "default_gallery_dl_path")]
    pub gallery_dl_path: String,
    #[serde(default = "default_yt_dlp_path")]
    pub yt_dlp_path: String,
    /// Netscape cookies file handed to the download tools
    pub instagram_cookies_file: Option<PathBuf>,
    /// Browser to read cookies from when no cookies file is configured
    pub cookies_from_browser: Option<String>,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    #[serde(default = "default_download_max_retries")]
    pub download_max_retries: usize,
    #[serde(default = "default_download_retry_base_secs")]
    pub download_retry_base_secs: u64,
    #[serde(default = "default_download_retry_max_secs")]
    pub download_retry_max_secs: u64,
    /// Minimum spacing between two requests to Instagram
    #[serde(default = "default_min_request_interval_secs")]
    pub min_request_interval_secs: f64,

    #[serde(default = "default_cleanup_max_age_days")]
    pub cleanup_max_age_days: u64,
    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    #[serde(default = "default_bot_api_timeout")]
    pub bot_api_timeout: u64,
    #[serde(default = "default_large_file_timeout")]
    pub large_file_timeout: u64,

    #[serde(default)]
    pub debug_mode: bool,
}

fn default_downloads_path() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_temp_path() -> PathBuf {
    PathBuf::from("temp")
}
fn default_database_path() -> PathBuf {
    PathBuf::from("data/bot_data.db")
}
const fn default_large_file_threshold() -> ByteSize {
    ByteSize(20 * MB)
}
const fn default_bot_api_max_size() -> ByteSize {
    ByteSize(50 * MB)
}
const fn default_large_file_max_size() -> ByteSize {
    ByteSize(2 * GB)
}
const fn default_max_concurrent_uploads() -> usize {
    3
}
const fn default_max_retry_attempts() -> usize {
    3
}
const fn default_retry_base_delay_secs() -> u64 {
    4
}
const fn default_retry_max_delay_secs() -> u64 {
    60
}
const fn default_bot_api_pause_seconds() -> f64 {
    1.0
}
const fn default_large_file_pause_seconds() -> f64 {
    0.5
}
const fn default_status_update_interval() -> f64 {
    5.0
}
fn default_gallery_dl_path() -> String {
    "gallery-dl".to_string()
}
fn default_yt_dlp_path() -> String {
    "yt-dlp".to_string()
}
const fn default_download_timeout_secs() -> u64 {
    300
}
const fn default_download_max_retries() -> usize {
    3
}
const fn default_download_retry_base_secs() -> u64 {
    10
}
const fn default_download_retry_max_secs() -> u64 {
    1800
}
const fn default_min_request_interval_secs() -> f64 {
    6.0
}
const fn default_cleanup_max_age_days() -> u64 {
    7
}
const fn default_cleanup_interval_hours() -> u64 {
    24
}
const fn default_connection_timeout() -> u64 {
    30
}
const fn default_bot_api_timeout() -> u64 {
    60
}
const fn default_large_file_timeout() -> u64 {
    300
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use insta_relay::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails or a value is out of range.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // `APP__BOT_TOKEN=... ./insta-relay`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // Plain UPPER_SNAKE_CASE vars; empty ones count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        let settings: Self = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.bot_token.trim().is_empty() {
            return Err(ConfigError::Message("BOT_TOKEN must not be empty".into()));
        }
        if self.bot_api_max_size > self.large_file_max_size {
            return Err(ConfigError::Message(format!(
                "BOT_API_MAX_SIZE ({}) exceeds LARGE_FILE_MAX_SIZE ({})",
                self.bot_api_max_size.0, self.large_file_max_size.0
            )));
        }
        for (name, value) in [
            ("BOT_API_PAUSE_SECONDS", self.bot_api_pause_seconds),
            ("LARGE_FILE_PAUSE_SECONDS", self.large_file_pause_seconds),
            ("STATUS_UPDATE_INTERVAL", self.status_update_interval),
            ("MIN_REQUEST_INTERVAL_SECS", self.min_request_interval_secs),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Message(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if let Some(bad) = self.admin_id_tokens().find(|t| t.parse::<i64>().is_err()) {
            return Err(ConfigError::Message(format!(
                "ADMIN_USER_IDS must list numeric Telegram user ids, got {bad:?}"
            )));
        }
        Ok(())
    }

    fn admin_id_tokens(&self) -> impl Iterator<Item = &str> {
        self.admin_user_ids_str
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
            .filter(|token| !token.is_empty())
    }

    /// Returns a set of Telegram IDs that are allowed to use the bot.
    #[must_use]
    pub fn admin_user_ids(&self) -> HashSet<i64> {
        self.admin_id_tokens()
            .filter_map(|id| id.parse::<i64>().ok())
            .collect()
    }

    /// Whether `user_id` may talk to the bot.
    ///
    /// A blank `ADMIN_USER_IDS` opens the bot to everyone; any other value
    /// admits only the ids it lists.
    #[must_use]
    pub fn is_authorized(&self, user_id: i64) -> bool {
        if self.admin_id_tokens().next().is_none() {
            return true;
        }
        self.admin_user_ids().contains(&user_id)
    }

    /// Local Bot API server URL, if one is configured and non-blank
    #[must_use]
    pub fn local_bot_api_url(&self) -> Option<&str> {
        self.local_bot_api_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Cookies for the download tools; a cookies file wins over a browser.
    #[must_use]
    pub fn cookie_source(&self) -> CookieSource {
        if let Some(path) = &self.instagram_cookies_file {
            return CookieSource::File(path.clone());
        }
        self.cookies_from_browser
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map_or(CookieSource::None, |b| CookieSource::Browser(b.to_string()))
    }

    #[must_use]
    pub const fn upload_limits(&self) -> UploadLimits {
        UploadLimits {
            threshold: self.large_file_threshold.0,
            bot_api_max: self.bot_api_max_size.0,
            large_file_max: self.large_file_max_size.0,
        }
    }

    #[must_use]
    pub fn upload_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.max_retry_attempts,
            Duration::from_secs(self.retry_base_delay_secs),
            Duration::from_secs(self.retry_max_delay_secs),
        )
    }

    #[must_use]
    pub fn download_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.download_max_retries,
            Duration::from_secs(self.download_retry_base_secs),
            Duration::from_secs(self.download_retry_max_secs),
        )
    }

    #[must_use]
    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_concurrent_uploads.max(1)
    }

    #[must_use]
    pub fn status_update_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_update_interval)
    }

    #[must_use]
    pub fn bot_api_pause(&self) -> Duration {
        Duration::from_secs_f64(self.bot_api_pause_seconds)
    }

    #[must_use]
    pub fn large_file_pause(&self) -> Duration {
        Duration::from_secs_f64(self.large_file_pause_seconds)
    }

    #[must_use]
    pub fn min_request_interval(&self) -> Duration {
        Duration::from_secs_f64(self.min_request_interval_secs)
    }

    #[must_use]
    pub const fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    #[must_use]
    pub const fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_age_days.saturating_mul(24 * 60 * 60))
    }

    /// At least one hour; tokio intervals reject a zero period.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours.max(1).saturating_mul(60 * 60))
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Get the unauthorized cooldown from env or default
#[must_use]
pub fn get_unauthorized_cooldown() -> u64 {
    env_u64("UNAUTHORIZED_COOLDOWN_SECS", UNAUTHORIZED_COOLDOWN_SECS)
}

/// Get the unauthorized cache TTL from env or default
#[must_use]
pub fn get_unauthorized_cache_ttl() -> u64 {
    env_u64("UNAUTHORIZED_CACHE_TTL_SECS", UNAUTHORIZED_CACHE_TTL_SECS)
}

/// Get the unauthorized cache max size from env or default
#[must_use]
pub fn get_unauthorized_cache_max_size() -> u64 {
    env_u64("UNAUTHORIZED_CACHE_MAX_SIZE", UNAUTHORIZED_CACHE_MAX_SIZE)
}

#[cfg(test)]
pub(crate) fn test_settings() -> Settings {
    serde_json::from_value(serde_json::json!({ "bot_token": "dummy" }))
        .expect("defaults must deserialize")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_cookie_source_precedence() {
        let mut settings = test_settings();
        assert_eq!(settings.cookie_source(), CookieSource::None);

        settings.cookies_from_browser = Some(" firefox ".into());
        assert_eq!(
            settings.cookie_source(),
            CookieSource::Browser("firefox".into())
        );

        settings.instagram_cookies_file = Some(PathBuf::from("/data/cookies.txt"));
        assert_eq!(
            settings.cookie_source(),
            CookieSource::File(PathBuf::from("/data/cookies.txt"))
        );
    }

    #[test]
    fn test_byte_size_parsing() {
        assert_eq!(ByteSize::parse("1024"), Some(ByteSize(1024)));
        assert_eq!(ByteSize::parse("50MB"), Some(ByteSize(50 * MB)));
        assert_eq!(ByteSize::parse("2 gb"), Some(ByteSize(2 * GB)));
        assert_eq!(ByteSize::parse("512KB"), Some(ByteSize(512 * KB)));
        assert_eq!(ByteSize::parse("7B"), Some(ByteSize(7)));
        assert_eq!(ByteSize::parse(""), None);
        assert_eq!(ByteSize::parse("MB"), None);
        assert_eq!(ByteSize::parse("10PB"), None);
        assert_eq!(ByteSize::parse("-5"), None);
    }

    #[test]
    fn test_defaults() {
        let settings = test_settings();
        assert_eq!(settings.large_file_threshold, ByteSize(20 * MB));
        assert_eq!(settings.bot_api_max_size, ByteSize(50 * MB));
        assert_eq!(settings.large_file_max_size, ByteSize(2 * GB));
        assert_eq!(settings.max_concurrent_uploads(), 3);
        assert_eq!(settings.status_update_interval(), Duration::from_secs(5));
        assert_eq!(settings.download_timeout(), Duration::from_secs(300));
        assert_eq!(settings.database_path, PathBuf::from("data/bot_data.db"));
        assert!(settings.local_bot_api_url().is_none());
        assert!(settings.target_chat_id.is_none());
    }

    // Single test touching the process environment to avoid races
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("BOT_TOKEN", "dummy_token");
        env::set_var("LARGE_FILE_THRESHOLD", "10MB");
        env::set_var("MAX_CONCURRENT_UPLOADS", "5");
        env::set_var("TARGET_CHAT_ID", "-1001234");
        env::set_var("LOCAL_BOT_API_URL", "");

        let settings = Settings::new()?;
        assert_eq!(settings.bot_token, "dummy_token");
        assert_eq!(settings.large_file_threshold, ByteSize(10 * MB));
        assert_eq!(settings.max_concurrent_uploads, 5);
        assert_eq!(settings.target_chat_id, Some(-1_001_234));
        assert!(settings.local_bot_api_url().is_none());

        env::set_var("BOT_API_MAX_SIZE", "3GB");
        assert!(Settings::new().is_err());

        for key in [
            "BOT_TOKEN",
            "LARGE_FILE_THRESHOLD",
            "MAX_CONCURRENT_UPLOADS",
            "TARGET_CHAT_ID",
            "LOCAL_BOT_API_URL",
            "BOT_API_MAX_SIZE",
        ] {
            env::remove_var(key);
        }
        Ok(())
    }

    #[test]
    fn test_list_parsing() {
        let mut settings = test_settings();

        settings.admin_user_ids_str = Some("123,456".to_string());
        let allowed = settings.admin_user_ids();
        assert!(allowed.contains(&123));
        assert!(allowed.contains(&456));
        assert_eq!(allowed.len(), 2);

        settings.admin_user_ids_str = Some("333; 444 555".to_string());
        assert_eq!(settings.admin_user_ids().len(), 3);

        settings.admin_user_ids_str = Some("abc, 777".to_string());
        let allowed = settings.admin_user_ids();
        assert!(allowed.contains(&777));
        assert_eq!(allowed.len(), 1);
    }

    #[test]
    fn test_malformed_admin_ids_are_rejected() {
        let mut settings = test_settings();
        assert!(settings.validate().is_ok());

        settings.admin_user_ids_str = Some("  ".to_string());
        assert!(settings.validate().is_ok());

        for bad in ["@alice, bob", "abc, 777", "123;x"] {
            settings.admin_user_ids_str = Some(bad.to_string());
            assert!(settings.validate().is_err(), "{bad} should be rejected");
        }

        settings.admin_user_ids_str = Some("123, 456".to_string());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_unparseable_admin_ids_never_open_access() {
        let mut settings = test_settings();
        settings.admin_user_ids_str = Some("@alice, bob".to_string());
        assert!(settings.admin_user_ids().is_empty());
        assert!(!settings.is_authorized(42));
    }

    #[test]
    fn test_open_access_when_no_admins() {
        let mut settings = test_settings();
        assert!(settings.is_authorized(42));

        settings.admin_user_ids_str = Some("1".to_string());
        assert!(settings.is_authorized(1));
        assert!(!settings.is_authorized(42));
    }
}
