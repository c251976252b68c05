use async_trait::async_trait;

use crate::{
    domain::{ChatId, MessageRef},
    messaging::types::MessagingCapabilities,
    Result,
};

/// Outbound side of the chat platform.
///
/// Implementations map delivery refusals (blocked bot, no prior conversation)
/// to `Error::Forbidden` so the relay can report them to staff.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef>;
    async fn delete_message(&self, msg: MessageRef) -> Result<()>;

    /// Copy a message (text, media, caption) into another chat without a forward header.
    async fn copy_message(&self, from: MessageRef, to: ChatId) -> Result<MessageRef>;
}
