use crate::bot::resilient::send_message_resilient;
use crate::bot::{TelegramStatusSink, UnauthorizedCache};
use crate::cleanup::{CleanupService, StorageStats};
use crate::config::Settings;
use crate::instagram::{extract_instagram_urls, InstagramUrl, SessionCheck};
use crate::pipeline::{process_download, validate_session, PipelineContext};
use crate::storage::{ContentTypeCount, SessionRecord, SessionValidation, Statistics};
use crate::utils::format_bytes;
use anyhow::Result;
use std::fmt::Write as _;
use std::sync::Arc;
use teloxide::{prelude::*, types::ParseMode, utils::command::BotCommands};
use tracing::{error, info, warn};

const RECENT_VALIDATIONS: usize = 5;

/// Safe extraction of user ID from a message.
/// Returns 0 if the user information is missing.
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Username, else first name, else "Unknown".
pub fn get_user_name(msg: &Message) -> String {
    msg.from
        .as_ref()
        .and_then(|u| {
            u.username
                .clone()
                .or_else(|| (!u.first_name.is_empty()).then(|| u.first_name.clone()))
        })
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Supported commands for the bot
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "Start the bot.")]
    Start,
    #[command(description = "Show usage help.")]
    Help,
    #[command(description = "Download an Instagram post, reel or story: /instagram <url>")]
    Instagram(String),
    #[command(description = "Show download and upload statistics.")]
    Stats,
    #[command(description = "Check bot health.")]
    Healthcheck,
    #[command(description = "Validate the Instagram session.")]
    Session,
}

/// Start handler
///
/// # Errors
///
/// Returns an error if the welcome message cannot be sent.
pub async fn start(bot: Bot, msg: Message) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("User {user_id} ({}) initiated /start command.", get_user_name(&msg));
    bot.send_message(
        msg.chat.id,
        "📸 Send me an Instagram post, reel, story or highlight link and I will \
         upload the media here.\n\nUse /help for details.",
    )
    .await?;
    Ok(())
}

/// Help handler
///
/// # Errors
///
/// Returns an error if the help message cannot be sent.
pub async fn help(bot: Bot, msg: Message) -> Result<()> {
    let text = format!(
        "{}\n\nYou can also just paste a link.\n\n\
         Supported: posts (single or carousel), reels, IGTV, stories and highlights. \
         Stories and highlights need a logged-in session.",
        Command::descriptions()
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Healthcheck handler
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn healthcheck(bot: Bot, msg: Message, ctx: Arc<PipelineContext>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("Healthcheck command received from user {user_id}.");

    let database = match ctx.store.ping().await {
        Ok(()) => "OK".to_string(),
        Err(e) => {
            warn!(error = %e, "Database ping failed");
            format!("error: {e}")
        }
    };
    let large_file = if ctx.uploads.large_file_available() {
        "configured"
    } else {
        "not configured"
    };

    bot.send_message(
        msg.chat.id,
        format!("OK\nDatabase: {database}\nLarge-file server: {large_file}"),
    )
    .await?;
    Ok(())
}

/// Stats handler: operation log totals, disk usage and access-denied metrics.
///
/// # Errors
///
/// Returns an error if the stats response cannot be sent.
pub async fn stats(
    bot: Bot,
    msg: Message,
    ctx: Arc<PipelineContext>,
    cleanup: Arc<CleanupService>,
    cache: Arc<UnauthorizedCache>,
) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("Stats command received from user {user_id}.");

    let stats = ctx.store.get_statistics().await.unwrap_or_else(|e| {
        error!(error = %e, "Failed to load statistics");
        Statistics::default()
    });
    let kinds = ctx.store.content_type_stats().await.unwrap_or_else(|e| {
        error!(error = %e, "Failed to load content type statistics");
        Vec::new()
    });
    let storage = cleanup.storage_stats().await;

    let mut text = render_stats(&stats, &kinds, &storage);
    let cooldown_mins = cache.cooldown().as_secs() / 60;
    let _ = write!(
        text,
        "\n\n<b>Anti-spam protection (Access Denied):</b>\n\
         • Cooldown period: {cooldown_mins} min.\n\
         • Cache entries: {}\n\
         • Blocked notifications: {}",
        cache.entry_count(),
        cache.silenced_count(),
    );

    bot.send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .await?;
    Ok(())
}

/// HTML body of the `/stats` reply.
#[must_use]
pub fn render_stats(stats: &Statistics, kinds: &[ContentTypeCount], storage: &StorageStats) -> String {
    let mut text = format!(
        "<b>📊 Bot Statistics</b>\n\n\
         <b>Downloads:</b> {} total\n\
         • ✅ {} successful · ⚠️ {} partial · ❌ {} failed\n\
         • Files: {} ({})\n\n\
         <b>Uploads:</b>\n\
         • ✅ {} successful · ❌ {} failed\n\
         • Bot API: {} · Large-file server: {}\n\
         • Uploaded: {}",
        stats.total_downloads,
        stats.successful_downloads,
        stats.partial_downloads,
        stats.failed_downloads,
        stats.files_downloaded,
        format_bytes(stats.bytes_downloaded),
        stats.successful_uploads,
        stats.failed_uploads,
        stats.bot_api_uploads,
        stats.large_file_uploads,
        format_bytes(stats.bytes_uploaded),
    );

    if !kinds.is_empty() {
        text.push_str("\n\n<b>Content types:</b>");
        for kind in kinds {
            let _ = write!(
                text,
                "\n• {}: {}",
                html_escape::encode_text(&kind.content_type),
                kind.count
            );
        }
    }

    let _ = write!(
        text,
        "\n\n<b>Disk:</b> {} in {} file(s), {} request folder(s), {} awaiting cleanup",
        format_bytes(storage.total_bytes),
        storage.files,
        storage.directories,
        storage.old_directories,
    );
    text
}

/// Session handler: probe the cookies and show the recorded history.
///
/// # Errors
///
/// Returns an error if the reply cannot be sent.
pub async fn session(bot: Bot, msg: Message, ctx: Arc<PipelineContext>) -> Result<()> {
    let user_id = get_user_id_safe(&msg);
    info!("Session check requested by user {user_id}.");

    let status = send_message_resilient(&bot, msg.chat.id, "🔐 Checking Instagram session…", None)
        .await?;
    let check = validate_session(&ctx).await;

    let (record, history) = match ctx.session {
        Some(session) => match ctx
            .store
            .active_session(session.user_id, session.session_type)
            .await
        {
            Ok(Some(record)) => {
                let history = ctx
                    .store
                    .recent_validations(record.id, RECENT_VALIDATIONS)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to load session validations");
                        Vec::new()
                    });
                (Some(record), history)
            }
            Ok(None) => (None, Vec::new()),
            Err(e) => {
                warn!(error = %e, "Failed to load active session");
                (None, Vec::new())
            }
        },
        None => (None, Vec::new()),
    };

    crate::bot::resilient::edit_message_safe_resilient(
        &bot,
        msg.chat.id,
        status.id,
        &render_session(&check, record.as_ref(), &history),
    )
    .await;
    Ok(())
}

/// HTML body of the `/session` reply.
#[must_use]
pub fn render_session(
    check: &SessionCheck,
    record: Option<&SessionRecord>,
    history: &[SessionValidation],
) -> String {
    let mut text = if check.valid {
        "✅ <b>Instagram session is valid</b>".to_string()
    } else {
        format!(
            "❌ <b>Instagram session check failed</b>\n{}",
            html_escape::encode_text(&check.message)
        )
    };

    match record {
        Some(record) => {
            let _ = write!(
                text,
                "\n\nType: {}\nSource: {}\nRegistered: {}",
                record.session_type.as_str(),
                html_escape::encode_text(record.source.as_deref().unwrap_or("-")),
                record.created_at
            );
            if let Some(expires) = &record.expires_at {
                let _ = write!(text, "\nExpires: {expires}");
            }
        }
        None => text.push_str("\n\nNo session registered."),
    }

    if !history.is_empty() {
        text.push_str("\n\n<b>Recent checks:</b>");
        for v in history {
            let mark = if v.is_valid { "✅" } else { "❌" };
            let _ = write!(text, "\n{mark} {}", v.checked_at);
            if let Some(err) = &v.error_message {
                let _ = write!(
                    text,
                    " <i>{}</i>",
                    html_escape::encode_text(&crate::utils::truncate_str(err, 80))
                );
            }
        }
    }
    text
}

/// `/instagram <url>` handler.
///
/// # Errors
///
/// Returns an error if the usage hint cannot be sent.
pub async fn instagram(
    bot: Bot,
    msg: Message,
    arg: String,
    ctx: Arc<PipelineContext>,
    settings: Arc<Settings>,
) -> Result<()> {
    let urls = extract_instagram_urls(&arg);
    if urls.is_empty() {
        bot.send_message(
            msg.chat.id,
            "Usage: /instagram <url>\nExample: /instagram https://www.instagram.com/p/SHORTCODE/",
        )
        .await?;
        return Ok(());
    }
    spawn_downloads(bot, &msg, urls, ctx, &settings);
    Ok(())
}

/// Plain text handler: any Instagram link in the message is downloaded.
///
/// # Errors
///
/// Returns an error if the hint for link-less messages cannot be sent.
pub async fn handle_text(
    bot: Bot,
    msg: Message,
    ctx: Arc<PipelineContext>,
    settings: Arc<Settings>,
) -> Result<()> {
    let urls = msg.text().map(extract_instagram_urls).unwrap_or_default();
    if urls.is_empty() {
        bot.send_message(msg.chat.id, "Send me an Instagram link, or /help.")
            .await?;
        return Ok(());
    }
    spawn_downloads(bot, &msg, urls, ctx, &settings);
    Ok(())
}

/// Process `urls` one after another in a background task.
fn spawn_downloads(
    bot: Bot,
    msg: &Message,
    urls: Vec<InstagramUrl>,
    ctx: Arc<PipelineContext>,
    settings: &Settings,
) {
    let user_id = get_user_id_safe(msg);
    let reply_chat = msg.chat.id;
    let target_chat = settings.target_chat_id.unwrap_or(reply_chat.0);

    info!(user_id, urls = urls.len(), "Download request accepted");
    tokio::spawn(async move {
        for url in urls {
            if let Err(e) = run_download(&bot, reply_chat, target_chat, &url, &ctx).await {
                error!(error = %e, url = %url, "Download request failed");
            }
        }
    });
}

async fn run_download(
    bot: &Bot,
    reply_chat: ChatId,
    target_chat: i64,
    url: &InstagramUrl,
    ctx: &PipelineContext,
) -> Result<()> {
    let status = send_message_resilient(
        bot,
        reply_chat,
        format!("⏳ Queued {}…", url.kind()),
        None,
    )
    .await?;
    let sink = TelegramStatusSink::new(bot.clone(), reply_chat, status.id);

    let report = process_download(ctx, url, target_chat, sink).await;
    send_message_resilient(bot, reply_chat, report.summary(), None).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SessionType;

    #[test]
    fn commands_parse() {
        assert_eq!(Command::parse("/stats", "bot").ok(), Some(Command::Stats));
        assert_eq!(
            Command::parse("/instagram https://www.instagram.com/p/Cabc/", "bot").ok(),
            Some(Command::Instagram(
                "https://www.instagram.com/p/Cabc/".to_string()
            ))
        );
        assert!(Command::parse("/unknown", "bot").is_err());
    }

    #[test]
    fn stats_render_counts_and_kinds() {
        let stats = Statistics {
            total_downloads: 4,
            successful_downloads: 3,
            failed_downloads: 1,
            bot_api_uploads: 5,
            large_file_uploads: 2,
            bytes_uploaded: 3 * 1024 * 1024,
            ..Statistics::default()
        };
        let kinds = vec![ContentTypeCount {
            content_type: "reel".into(),
            count: 3,
        }];
        let text = render_stats(&stats, &kinds, &StorageStats::default());

        assert!(text.contains("<b>Downloads:</b> 4 total"));
        assert!(text.contains("Bot API: 5 · Large-file server: 2"));
        assert!(text.contains("• reel: 3"));
        assert!(text.contains("Uploaded: 3.0 MB"));
    }

    #[test]
    fn session_render_escapes_and_lists_history() {
        let check = SessionCheck {
            valid: false,
            message: "login <required>".into(),
        };
        let record = SessionRecord {
            id: 1,
            user_id: 7,
            username: None,
            session_type: SessionType::CookiesFile,
            source: Some("/data/cookies.txt".into()),
            is_active: true,
            last_validated: None,
            expires_at: None,
            created_at: "2026-01-01 10:00:00".into(),
        };
        let history = vec![SessionValidation {
            id: 3,
            session_id: 1,
            is_valid: false,
            error_message: Some("expired".into()),
            checked_at: "2026-01-02 10:00:00".into(),
        }];

        let text = render_session(&check, Some(&record), &history);
        assert!(text.contains("login &lt;required&gt;"));
        assert!(text.contains("Type: cookies_file"));
        assert!(text.contains("❌ 2026-01-02 10:00:00 <i>expired</i>"));

        let none = render_session(&check, None, &[]);
        assert!(none.contains("No session registered."));
    }
}
