//! Telegram adapter (teloxide).
//!
//! Implements the `modmail-core` messaging and directory ports over the
//! Telegram Bot API, and runs the update dispatcher.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode, ApiError, RequestError};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use modmail_core::{
    domain::{ChatId, MessageId, MessageRef, UserId, UserProfile},
    errors::Error,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    ports::DirectoryPort,
    Result,
};

/// Telegram rejects longer messages outright.
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    max_message_len: usize,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            max_message_len: TELEGRAM_MESSAGE_LIMIT,
        }
    }

    /// Lower the message length cap (it is never raised above Telegram's own).
    pub fn with_message_limit(mut self, limit: usize) -> Self {
        self.max_message_len = limit.min(TELEGRAM_MESSAGE_LIMIT);
        self
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::Api(
                ApiError::BotBlocked
                | ApiError::BotKicked
                | ApiError::UserDeactivated
                | ApiError::CantInitiateConversation
                | ApiError::CantTalkWithBots,
            ) => Error::Forbidden(format!("telegram refused delivery: {e}")),
            RequestError::Api(ApiError::ChatNotFound | ApiError::UserNotFound) => {
                Error::NotFound(format!("telegram: {e}"))
            }
            other => Error::External(format!("telegram error: {other}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::warn!(retry_after = ?d, "telegram flood control, waiting");
                        sleep(d).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }
}

/// Convert a Telegram user into the relay's profile type.
pub fn profile_from_user(user: &teloxide::types::User) -> UserProfile {
    UserProfile {
        id: UserId(user.id.0 as i64),
        first_name: user.first_name.clone(),
        last_name: user.last_name.clone(),
        username: user.username.clone(),
        is_bot: user.is_bot,
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: self.max_message_len,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(Self::tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn delete_message(&self, msg: MessageRef) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .delete_message(Self::tg_chat(msg.chat_id), Self::tg_msg_id(msg.message_id))
        })
        .await?;
        Ok(())
    }

    async fn copy_message(&self, from: MessageRef, to: ChatId) -> Result<MessageRef> {
        let id = self
            .with_retry(|| {
                self.bot.copy_message(
                    Self::tg_chat(to),
                    Self::tg_chat(from.chat_id),
                    Self::tg_msg_id(from.message_id),
                )
            })
            .await?;

        Ok(MessageRef {
            chat_id: to,
            message_id: MessageId(id.0),
        })
    }
}

#[async_trait]
impl DirectoryPort for TelegramMessenger {
    async fn me(&self) -> Result<UserProfile> {
        let me = self.with_retry(|| self.bot.get_me()).await?;
        Ok(profile_from_user(&me.user))
    }

    async fn lookup_user(&self, user_id: UserId) -> Result<Option<UserProfile>> {
        let chat = match self
            .with_retry(|| self.bot.get_chat(Self::tg_chat(ChatId::from(user_id))))
            .await
        {
            Ok(chat) => chat,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        // Only private chats are users; a group id typed by mistake is "not found".
        if !chat.is_private() {
            return Ok(None);
        }

        Ok(Some(UserProfile {
            id: user_id,
            first_name: chat.first_name().unwrap_or("unknown").to_string(),
            last_name: chat.last_name().map(|s| s.to_string()),
            username: chat.username().map(|s| s.to_string()),
            is_bot: false,
        }))
    }
}
