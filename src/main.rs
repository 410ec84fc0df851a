use dotenvy::dotenv;
use insta_relay::bot::handlers::{get_user_id_safe, get_user_name, Command};
use insta_relay::bot::{handlers, UnauthorizedCache};
use insta_relay::cleanup::CleanupService;
use insta_relay::config::{
    get_unauthorized_cache_max_size, get_unauthorized_cache_ttl, get_unauthorized_cooldown,
    Settings,
};
use insta_relay::instagram::{CookieSource, ExternalDownloader};
use insta_relay::pipeline::{PipelineContext, SessionRef};
use insta_relay::storage::{NewSession, SessionType, SqliteStore, StatsStore};
use insta_relay::upload::{TelegramTransport, UploadService, UploadTransport};
use regex::Regex;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Regex patterns for redacting sensitive data
struct RedactionPatterns {
    token1: Regex,
    token2: Regex,
    token3: Regex,
    cookie_header: Regex,
    cookie_line: Regex,
}

impl RedactionPatterns {
    /// Initialize all regex patterns
    ///
    /// # Errors
    ///
    /// Returns an error if any regex pattern is invalid
    fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            token1: Regex::new(r"(https?://[^/]+/bot)([0-9]+:[A-Za-z0-9_-]+)(/['\s]*)")?,
            token2: Regex::new(r"([0-9]{8,10}:[A-Za-z0-9_-]{35})")?,
            token3: Regex::new(r"(bot[0-9]{8,10}:)[A-Za-z0-9_-]+")?,
            cookie_header: Regex::new(r"(?i)\b(sessionid|csrftoken|ds_user_id)=[^;\s&]+")?,
            cookie_line: Regex::new(r"(?i)\b(sessionid|csrftoken|ds_user_id)\t[^\s]+")?,
        })
    }

    fn redact(&self, input: &str) -> String {
        let mut output = input.to_string();
        output = self
            .token1
            .replace_all(&output, "$1[TELEGRAM_TOKEN]$3")
            .to_string();
        output = self
            .token2
            .replace_all(&output, "[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .token3
            .replace_all(&output, "$1[TELEGRAM_TOKEN]")
            .to_string();
        output = self
            .cookie_header
            .replace_all(&output, "$1=[MASKED]")
            .to_string();
        output = self
            .cookie_line
            .replace_all(&output, "$1\t[MASKED]")
            .to_string();
        output
    }
}

struct RedactingWriter<W: Write> {
    inner: W,
    patterns: Arc<RedactionPatterns>,
}

impl<W: Write> RedactingWriter<W> {
    const fn new(inner: W, patterns: Arc<RedactionPatterns>) -> Self {
        Self { inner, patterns }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        let redacted = self.patterns.redact(&s);
        self.inner.write_all(redacted.as_bytes())?;
        // Report the original length; the redacted text may differ in size
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

struct RedactingMakeWriter<F> {
    make_inner: F,
    patterns: Arc<RedactionPatterns>,
}

impl<F> RedactingMakeWriter<F> {
    const fn new(make_inner: F, patterns: Arc<RedactionPatterns>) -> Self {
        Self {
            make_inner,
            patterns,
        }
    }
}

impl<'a, F, W> tracing_subscriber::fmt::MakeWriter<'a> for RedactingMakeWriter<F>
where
    F: Fn() -> W + 'static,
    W: Write,
{
    type Writer = RedactingWriter<W>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new((self.make_inner)(), self.patterns.clone())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Redaction must exist before the first log line
    let patterns = Arc::new(RedactionPatterns::new().map_err(|e| {
        eprintln!("Failed to compile regex patterns: {e}");
        e
    })?);

    let debug = debug_mode_from_env();
    init_logging(patterns, debug);

    info!("Starting insta-relay...");

    let settings = init_settings();
    if settings.debug_mode && !debug {
        warn!("DEBUG_MODE from config files is ignored; set it in the environment.");
    }
    init_directories(&settings).await;

    let store = init_storage(&settings);
    let session = register_session(&settings, store.as_ref()).await;

    let (bot, uploads) = init_uploads(&settings, store.clone());
    let downloader = Arc::new(ExternalDownloader::new(
        settings.gallery_dl_path.clone(),
        settings.yt_dlp_path.clone(),
        settings.cookie_source(),
        settings.download_timeout(),
        settings.download_backoff(),
        settings.min_request_interval(),
    ));

    let pipeline = Arc::new(PipelineContext {
        downloader,
        uploads,
        store: store.clone(),
        downloads_root: settings.downloads_path.clone(),
        status_throttle: settings.status_update_interval(),
        session,
    });

    let cleanup = Arc::new(CleanupService::new(
        settings.downloads_path.clone(),
        settings.cleanup_max_age(),
    ));
    let shutdown = CancellationToken::new();
    let cleanup_task = cleanup
        .clone()
        .spawn_periodic(settings.cleanup_interval(), shutdown.clone());
    spawn_session_expiry(store.clone(), settings.cleanup_interval(), shutdown.clone());

    let unauthorized_cache = init_unauthorized_cache();

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {e}");
    }

    info!("Bot is running...");

    Dispatcher::builder(bot, setup_handler())
        .dependencies(dptree::deps![settings, pipeline, cleanup, unauthorized_cache])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Shutting down...");
    shutdown.cancel();
    if let Err(e) = cleanup_task.await {
        warn!("Cleanup task ended abnormally: {e}");
    }

    Ok(())
}

/// `DEBUG_MODE` is read before settings so early logs honour it.
fn debug_mode_from_env() -> bool {
    std::env::var("DEBUG_MODE")
        .is_ok_and(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

fn init_logging(patterns: Arc<RedactionPatterns>, debug: bool) {
    let make_writer = RedactingMakeWriter::new(io::stderr, patterns);
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(make_writer))
        .init();
}

fn init_settings() -> Arc<Settings> {
    match Settings::new() {
        Ok(s) => {
            info!("Configuration loaded successfully.");
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    }
}

async fn init_directories(settings: &Settings) {
    let mut dirs = vec![settings.downloads_path.clone(), settings.temp_path.clone()];
    if let Some(parent) = settings.database_path.parent() {
        if !parent.as_os_str().is_empty() {
            dirs.push(parent.to_path_buf());
        }
    }
    for dir in dirs {
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!("Failed to create directory {}: {}", dir.display(), e);
            std::process::exit(1);
        }
    }
}

fn init_storage(settings: &Settings) -> Arc<dyn StatsStore> {
    match SqliteStore::open(&settings.database_path) {
        Ok(s) => {
            info!("SQLite storage opened at {}.", settings.database_path.display());
            Arc::new(s)
        }
        Err(e) => {
            error!("Failed to open SQLite storage: {}", e);
            std::process::exit(1);
        }
    }
}

/// Record the configured cookies as the active session of the first admin.
async fn register_session(settings: &Settings, store: &dyn StatsStore) -> Option<SessionRef> {
    let (session_type, source) = match settings.cookie_source() {
        CookieSource::File(path) => (SessionType::CookiesFile, path.display().to_string()),
        CookieSource::Browser(name) => (SessionType::Browser, name),
        CookieSource::None => {
            warn!("No Instagram cookies configured; stories and private content will fail.");
            return None;
        }
    };
    let user_id = settings.admin_user_ids().into_iter().min().unwrap_or(0);
    let session = SessionRef {
        user_id,
        session_type,
    };

    match store.active_session(user_id, session_type).await {
        Ok(Some(existing)) if existing.source.as_deref() == Some(source.as_str()) => {
            return Some(session);
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to look up Instagram session: {e}"),
    }

    let new = NewSession {
        user_id,
        username: None,
        session_type,
        source: Some(source),
        expires_at: None,
    };
    match store.store_session(new).await {
        Ok(id) => info!("Registered Instagram session {id} ({}).", session_type.as_str()),
        Err(e) => warn!("Failed to register Instagram session: {e}"),
    }
    Some(session)
}

fn init_uploads(settings: &Settings, store: Arc<dyn StatsStore>) -> (Bot, Arc<UploadService>) {
    let connect_timeout = Duration::from_secs(settings.connection_timeout);

    let cloud = match TelegramTransport::cloud(
        &settings.bot_token,
        connect_timeout,
        Duration::from_secs(settings.bot_api_timeout),
        settings.bot_api_max_size.bytes(),
    ) {
        Ok(t) => t,
        Err(e) => {
            error!("Failed to build Telegram client: {}", e);
            std::process::exit(1);
        }
    };
    let bot = cloud.bot().clone();

    let large_file: Option<Arc<dyn UploadTransport>> =
        settings.local_bot_api_url().and_then(|url| {
            match TelegramTransport::local_server(
                &settings.bot_token,
                url,
                connect_timeout,
                Duration::from_secs(settings.large_file_timeout),
                settings.large_file_max_size.bytes(),
            ) {
                Ok(t) => {
                    info!("Large-file transport enabled via local Bot API server.");
                    Some(Arc::new(t) as Arc<dyn UploadTransport>)
                }
                Err(e) => {
                    error!("Large-file transport disabled: {}", e);
                    None
                }
            }
        });
    if large_file.is_none() {
        info!("Large-file transport not configured; files above the Bot API limit will fail.");
    }

    let uploads = UploadService::new(
        Arc::new(cloud),
        large_file,
        settings.upload_limits(),
        settings.upload_backoff(),
        store,
    )
    .with_pauses(settings.bot_api_pause(), settings.large_file_pause())
    .with_max_concurrent(settings.max_concurrent_uploads());

    (bot, Arc::new(uploads))
}

fn spawn_session_expiry(store: Arc<dyn StatsStore>, every: Duration, token: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => match store.cleanup_expired_sessions().await {
                    Ok(0) => {}
                    Ok(n) => info!("Deactivated {n} expired Instagram session(s)."),
                    Err(e) => warn!("Session expiry check failed: {e}"),
                },
            }
        }
    });
}

fn init_unauthorized_cache() -> Arc<UnauthorizedCache> {
    let cooldown = get_unauthorized_cooldown();
    let ttl = get_unauthorized_cache_ttl();
    let max_size = get_unauthorized_cache_max_size();

    info!(
        "Initializing UnauthorizedCache (cooldown: {}s, ttl: {}s, max_size: {})",
        cooldown, ttl, max_size
    );

    Arc::new(UnauthorizedCache::new(cooldown, ttl, max_size))
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .branch(
            dptree::filter(|msg: Message, settings: Arc<Settings>| {
                settings.is_authorized(get_user_id_safe(&msg))
            })
            .branch(
                dptree::entry()
                    .filter_command::<Command>()
                    .endpoint(handle_command),
            )
            .branch(dptree::endpoint(handle_text)),
        )
        // Whoever did not pass the filter above is unauthorized
        .branch(dptree::endpoint(handle_unauthorized))
}

async fn handle_unauthorized(
    bot: Bot,
    msg: Message,
    cache: Arc<UnauthorizedCache>,
) -> Result<(), teloxide::RequestError> {
    let user_id = get_user_id_safe(&msg);
    let user_name = get_user_name(&msg);

    if cache.should_send(user_id, &user_name).await {
        info!(
            "⛔️ Unauthorized access from user {} ({}). Sending denial message.",
            user_id, user_name
        );

        if let Err(e) = bot.send_message(msg.chat.id, "⛔️ Access denied").await {
            error!("Failed to send access denied message to {}: {}", user_id, e);
        } else {
            cache.mark_sent(user_id).await;
        }
    }

    respond(())
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    settings: Arc<Settings>,
    pipeline: Arc<PipelineContext>,
    cleanup: Arc<CleanupService>,
    cache: Arc<UnauthorizedCache>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => handlers::start(bot, msg).await,
        Command::Help => handlers::help(bot, msg).await,
        Command::Instagram(arg) => handlers::instagram(bot, msg, arg, pipeline, settings).await,
        Command::Stats => handlers::stats(bot, msg, pipeline, cleanup, cache).await,
        Command::Healthcheck => handlers::healthcheck(bot, msg, pipeline).await,
        Command::Session => handlers::session(bot, msg, pipeline).await,
    };
    if let Err(e) = res {
        error!("Command error: {}", e);
    }
    respond(())
}

async fn handle_text(
    bot: Bot,
    msg: Message,
    settings: Arc<Settings>,
    pipeline: Arc<PipelineContext>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::handle_text(bot, msg, pipeline, settings).await {
        error!("Text handler error: {}", e);
    }
    respond(())
}
