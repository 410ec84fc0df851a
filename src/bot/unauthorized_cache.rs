//! Flood control for "Access denied" replies.
//!
//! Unknown users get one denial per cooldown; repeated attempts inside the
//! window are counted and only occasionally logged, so a spammer cannot get
//! the bot rate limited by Telegram.

use moka::future::Cache;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const SILENCED_LOG_EVERY: u64 = 100;

/// Last denial time per user, evicted after the TTL.
#[derive(Clone)]
pub struct UnauthorizedCache {
    last_sent: Cache<i64, Instant>,
    cooldown: Duration,
    silenced_count: Arc<AtomicU64>,
}

impl UnauthorizedCache {
    /// `ttl_secs` bounds how long an entry lives; it should be at least the cooldown.
    #[must_use]
    pub fn new(cooldown_secs: u64, ttl_secs: u64, max_capacity: u64) -> Self {
        let last_sent = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self {
            last_sent,
            cooldown: Duration::from_secs(cooldown_secs),
            silenced_count: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether `user_id` should be told "Access denied" now.
    pub async fn should_send(&self, user_id: i64, user_name: &str) -> bool {
        match self.last_sent.get(&user_id).await {
            Some(at) if at.elapsed() < self.cooldown => {}
            _ => return true,
        }

        let count = self.silenced_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count.is_multiple_of(SILENCED_LOG_EVERY) {
            debug!(
                silenced = count,
                user_id,
                user_name,
                "Silenced unauthorized attempts"
            );
        }
        false
    }

    /// Start the cooldown for `user_id`.
    pub async fn mark_sent(&self, user_id: i64) {
        self.last_sent.insert(user_id, Instant::now()).await;
    }

    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.last_sent.entry_count()
    }

    #[must_use]
    pub fn silenced_count(&self) -> u64 {
        self.silenced_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        self.cooldown
    }
}
