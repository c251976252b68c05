use std::path::PathBuf;

/// Core error type for the relay.
///
/// Adapter crates map their platform errors into this type so the relay can
/// tell "the user cannot be messaged" apart from transport failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt store file: {path}: {reason}")]
    Store { path: PathBuf, reason: String },

    /// The platform refused delivery (user blocked the bot, never started a chat, ...).
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Error::Forbidden(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
