//! insta-relay
//!
//! A Telegram bot that downloads Instagram posts, reels and stories with
//! `gallery-dl` or `yt-dlp` and uploads the media back to Telegram, picking
//! the cloud Bot API or a self-hosted Bot API server by file size.

/// Telegram bot implementation
pub mod bot;
/// Periodic removal of old download directories
pub mod cleanup;
/// Configuration management
pub mod config;
/// Instagram link parsing, downloading and metadata
pub mod instagram;
/// Download-to-upload flow for a single request
pub mod pipeline;
/// Throttled progress reporting
pub mod progress;
/// SQLite operation log and session records
pub mod storage;
/// Upload transports, method selection and retry
pub mod upload;
pub mod utils;
