use async_trait::async_trait;

use crate::{
    domain::{UserId, UserProfile},
    Result,
};

/// Member lookup on the chat platform.
#[async_trait]
pub trait DirectoryPort: Send + Sync {
    /// The bot's own account.
    async fn me(&self) -> Result<UserProfile>;

    /// Resolve a user id the bot can address. `Ok(None)` when the platform does
    /// not know the user (never talked to the bot, deleted account).
    async fn lookup_user(&self, user_id: UserId) -> Result<Option<UserProfile>>;
}
