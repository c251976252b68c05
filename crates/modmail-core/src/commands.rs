//! Staff command parsing.
//!
//! Commands are only recognized in the staff chat and must start with the
//! configured prefix. A command word that is a user id is a reply to that user.

use crate::domain::UserId;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplyTarget {
    User(UserId),
    /// The user staff last replied to.
    Last,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StaffCommand {
    Ignore {
        user_id: UserId,
        quiet: bool,
        reason: Option<String>,
    },
    Unignore {
        user_id: UserId,
    },
    ListIgnored,
    Reply {
        target: ReplyTarget,
        text: String,
    },
    Help,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("missing arguments for {command}")]
    MissingArgument { command: String },

    #[error("{raw:?} is not a valid user id")]
    InvalidUserId { raw: String },
}

/// Parse a staff chat message.
///
/// Returns `None` for anything that is not a known command (plain chatter, other
/// bots' commands) so it can be ignored without a reply.
pub fn parse(prefix: &str, text: &str) -> Option<Result<StaffCommand, CommandError>> {
    let body = text.trim_start().strip_prefix(prefix)?;

    let mut parts = body.splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("");
    let rest = parts.next().unwrap_or("").trim();

    // Telegram may send `/cmd@botname args`.
    let word = first.split('@').next().unwrap_or("").to_lowercase();
    if word.is_empty() {
        return None;
    }

    let cmd = match word.as_str() {
        "ignore" | "qignore" => {
            let quiet = word == "qignore";
            split_user_id(&word, rest).map(|(user_id, reason)| StaffCommand::Ignore {
                user_id,
                quiet,
                reason: non_empty(reason),
            })
        }
        "unignore" => {
            split_user_id(&word, rest).map(|(user_id, _)| StaffCommand::Unignore { user_id })
        }
        "ignored" => Ok(StaffCommand::ListIgnored),
        "help" => Ok(StaffCommand::Help),
        "r" => require_text(&word, rest).map(|text| StaffCommand::Reply {
            target: ReplyTarget::Last,
            text,
        }),
        w if w.chars().all(|c| c.is_ascii_digit()) => {
            let user_id = parse_user_id(w);
            user_id.and_then(|user_id| {
                require_text(w, rest).map(|text| StaffCommand::Reply {
                    target: ReplyTarget::User(user_id),
                    text,
                })
            })
        }
        _ => return None,
    };

    Some(cmd)
}

/// One-line usage for a command word, rendered with the active prefix.
pub fn usage(prefix: &str, command: &str) -> String {
    match command {
        "ignore" => format!("{prefix}ignore <user_id> [reason]"),
        "qignore" => format!("{prefix}qignore <user_id> [reason]"),
        "unignore" => format!("{prefix}unignore <user_id>"),
        "r" => format!("{prefix}r <message>"),
        _ => format!("{prefix}<user_id> <message>"),
    }
}

/// Help text listing every command.
pub fn help(prefix: &str) -> String {
    [
        format!("{prefix}<user_id> <message> - reply to a user"),
        format!("{prefix}r <message> - reply to the last user replied to"),
        format!("{prefix}ignore <user_id> [reason] - stop relaying a user's messages and tell them"),
        format!("{prefix}qignore <user_id> [reason] - same, without telling the user"),
        format!("{prefix}unignore <user_id> - relay a user's messages again"),
        format!("{prefix}ignored - list ignored users"),
        format!("{prefix}help - this list"),
    ]
    .join("\n")
}

fn split_user_id<'a>(command: &str, rest: &'a str) -> Result<(UserId, &'a str), CommandError> {
    let mut parts = rest.splitn(2, char::is_whitespace);
    let raw = parts.next().unwrap_or("");
    if raw.is_empty() {
        return Err(CommandError::MissingArgument {
            command: command.to_string(),
        });
    }
    let user_id = parse_user_id(raw)?;
    Ok((user_id, parts.next().unwrap_or("").trim()))
}

fn parse_user_id(raw: &str) -> Result<UserId, CommandError> {
    match raw.parse::<UserId>() {
        Ok(id) if id.0 > 0 => Ok(id),
        _ => Err(CommandError::InvalidUserId {
            raw: raw.to_string(),
        }),
    }
}

fn require_text(command: &str, rest: &str) -> Result<String, CommandError> {
    non_empty(rest).ok_or_else(|| CommandError::MissingArgument {
        command: command.to_string(),
    })
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}
