/// Command and message handlers
pub mod handlers;
/// Telegram calls with retry
pub mod resilient;
/// Status message updates for running requests
pub mod status;
/// Access-denied flood control
pub mod unauthorized_cache;

pub use status::TelegramStatusSink;
pub use unauthorized_cache::UnauthorizedCache;
