use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{domain::ChatId, errors::Error, Result};

/// Typed configuration for the relay.
#[derive(Clone, Debug)]
pub struct Config {
    // Core
    pub telegram_bot_token: String,
    pub staff_chat_id: ChatId,
    pub command_prefix: String,
    pub anonymous_staff: bool,

    // Anti-spam
    pub antispam_messages: u32,
    pub antispam_window: Duration,

    // Persistence
    pub ignored_users_file: PathBuf,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,

    // Platform limits
    pub message_limit: usize,
}

impl Config {
    /// Load from the process environment, after applying `.env` if present.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup (env, test map, ...).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Required
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;
        let staff_chat_id = get("STAFF_CHAT_ID")
            .ok_or_else(|| {
                Error::Config("STAFF_CHAT_ID environment variable is required".to_string())
            })?
            .trim()
            .parse::<i64>()
            .map(ChatId)
            .map_err(|e| Error::Config(format!("STAFF_CHAT_ID must be an integer: {e}")))?;

        let command_prefix = get("COMMAND_PREFIX")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "/".to_string());
        if command_prefix.chars().any(char::is_whitespace) {
            return Err(Error::Config(
                "COMMAND_PREFIX must not contain whitespace".to_string(),
            ));
        }
        let anonymous_staff = parse_bool(get("ANONYMOUS_STAFF")).unwrap_or(false);

        let antispam_messages = parse_num::<u32>(get("ANTISPAM_MESSAGES")).unwrap_or(5);
        let antispam_window =
            Duration::from_secs(parse_num::<u64>(get("ANTISPAM_SECONDS")).unwrap_or(5));

        let ignored_users_file = get("IGNORED_USERS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ignored.json"));

        let audit_log_path = get("AUDIT_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp/modmail-audit.log"));
        let audit_log_json = parse_bool(get("AUDIT_LOG_JSON")).unwrap_or(false);

        // Telegram hard limit is 4096 characters per message.
        let message_limit = parse_num::<usize>(get("MESSAGE_LIMIT"))
            .unwrap_or(4096)
            .clamp(200, 4096);

        Ok(Self {
            telegram_bot_token,
            staff_chat_id,
            command_prefix,
            anonymous_staff,
            antispam_messages,
            antispam_window,
            ignored_users_file,
            audit_log_path,
            audit_log_json,
            message_limit,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_num<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
    v.and_then(|s| s.trim().parse::<T>().ok())
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
