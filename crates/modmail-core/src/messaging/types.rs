use chrono::{DateTime, Utc};

use crate::domain::{MessageRef, UserProfile};

/// A message a user sent to the bot in a private chat.
#[derive(Clone, Debug)]
pub struct DirectMessage {
    pub author: UserProfile,
    pub message: MessageRef,
    /// When the platform says the message was sent.
    pub sent_at: DateTime<Utc>,
    /// Text or caption, if any.
    pub text: Option<String>,
    /// Photo, document, voice, sticker, ...
    pub has_media: bool,
}

/// A message posted in the staff chat.
#[derive(Clone, Debug)]
pub struct StaffMessage {
    pub author: UserProfile,
    pub message: MessageRef,
    pub text: String,
}

/// Limits of a messenger implementation.
#[derive(Clone, Copy, Debug)]
pub struct MessagingCapabilities {
    /// In UTF-16 code units, as Telegram counts them.
    pub max_message_len: usize,
}
