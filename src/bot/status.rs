use crate::progress::StatusSink;
use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId};

/// Status sink that keeps editing a single Telegram message.
pub struct TelegramStatusSink {
    bot: Bot,
    chat_id: ChatId,
    status_msg_id: MessageId,
}

impl TelegramStatusSink {
    #[must_use]
    pub const fn new(bot: Bot, chat_id: ChatId, status_msg_id: MessageId) -> Self {
        Self {
            bot,
            chat_id,
            status_msg_id,
        }
    }
}

#[async_trait]
impl StatusSink for TelegramStatusSink {
    async fn update_status(&self, text: &str) -> Result<()> {
        // The resilient helper retries and logs on its own
        let _ = crate::bot::resilient::edit_message_safe_resilient(
            &self.bot,
            self.chat_id,
            self.status_msg_id,
            text,
        )
        .await;
        Ok(())
    }
}
