//! Formatting utilities (Telegram HTML, mentions, per-user badges).

use sha2::{Digest, Sha256};

use crate::domain::{UserId, UserProfile};

/// Escape HTML special characters for Telegram HTML parse mode.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Clickable mention of a user.
pub fn mention(user: &UserProfile) -> String {
    format!(
        r#"<a href="tg://user?id={}">{}</a>"#,
        user.id,
        escape_html(&user.display_name())
    )
}

/// `<id> <mention>` pair used in staff chat headers so staff can copy the id.
pub fn id_and_mention(user: &UserProfile) -> String {
    format!("<code>{}</code> {}", user.id, mention(user))
}

const BADGES: [&str; 9] = ["🟥", "🟧", "🟨", "🟩", "🟦", "🟪", "🟫", "⬛", "⬜"];

/// Stable colour marker for a user so consecutive messages are easy to tell apart.
pub fn user_badge(user_id: UserId) -> &'static str {
    let digest = Sha256::digest(user_id.0.to_be_bytes());
    BADGES[digest[0] as usize % BADGES.len()]
}

/// Length as Telegram counts it (UTF-16 code units).
pub fn utf16_len(s: &str) -> usize {
    s.encode_utf16().count()
}

/// Truncate to at most `max_len` UTF-16 units, appending `...` when cut.
///
/// Never splits a character; an emoji outside the BMP costs two units.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if utf16_len(s) <= max_len {
        return s.to_string();
    }
    let budget = max_len.saturating_sub(3);
    let mut used = 0;
    let mut out = String::new();
    for c in s.chars() {
        used += c.len_utf16();
        if used > budget {
            break;
        }
        out.push(c);
    }
    out.push_str("...");
    out
}
