//! Telegram update handlers.
//!
//! Private chats feed the relay's direct-message path; the staff chat feeds
//! the command path. Everything else is dropped.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use modmail_core::{
    domain::{ChatId, MessageId, MessageRef},
    messaging::types::{DirectMessage, StaffMessage},
};

use crate::profile_from_user;
use crate::router::AppState;

fn message_ref(msg: &Message) -> MessageRef {
    MessageRef {
        chat_id: ChatId(msg.chat.id.0),
        message_id: MessageId(msg.id.0),
    }
}

/// Content that `copyMessage` can carry into the staff chat.
fn has_media(msg: &Message) -> bool {
    msg.photo().is_some()
        || msg.document().is_some()
        || msg.video().is_some()
        || msg.animation().is_some()
        || msg.audio().is_some()
        || msg.voice().is_some()
        || msg.video_note().is_some()
        || msg.sticker().is_some()
        || msg.contact().is_some()
        || msg.location().is_some()
        || msg.venue().is_some()
        || msg.poll().is_some()
}

/// A user's message in their private chat with the bot.
///
/// Service messages (pins, auto-delete timer changes, ...) carry neither text
/// nor media and are skipped.
pub fn direct_message(msg: &Message) -> Option<DirectMessage> {
    if !msg.chat.is_private() {
        return None;
    }
    let author = profile_from_user(msg.from()?);
    let has_media = has_media(msg);
    let text = match msg.text() {
        Some(text) => Some(text.to_string()),
        None if has_media => msg.caption().map(str::to_string),
        None => return None,
    };

    Some(DirectMessage {
        author,
        message: message_ref(msg),
        sent_at: msg.date,
        text,
        has_media,
    })
}

/// A text message posted in the staff chat.
pub fn staff_message(msg: &Message, staff_chat: ChatId) -> Option<StaffMessage> {
    if msg.chat.id.0 != staff_chat.0 {
        return None;
    }
    let author = profile_from_user(msg.from()?);
    let text = msg.text()?.to_string();

    Some(StaffMessage {
        author,
        message: message_ref(msg),
        text,
    })
}

pub async fn handle_message(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if let Some(direct) = direct_message(&msg) {
        match state.relay.handle_direct(&direct).await {
            Ok(outcome) => {
                tracing::debug!(user = %direct.author.id, ?outcome, "direct message handled")
            }
            Err(e) => {
                tracing::error!(user = %direct.author.id, error = %e, "failed to relay direct message")
            }
        }
        return Ok(());
    }

    if let Some(staff) = staff_message(&msg, state.cfg.staff_chat_id) {
        match state.relay.handle_staff(&staff).await {
            Ok(outcome) => {
                tracing::debug!(staff = %staff.author.id, ?outcome, "staff message handled")
            }
            Err(e) => {
                tracing::error!(staff = %staff.author.id, error = %e, "failed to handle staff message")
            }
        }
        return Ok(());
    }

    tracing::debug!(chat = msg.chat.id.0, "ignoring message outside private and staff chats");
    Ok(())
}
