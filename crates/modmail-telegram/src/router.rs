use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use modmail_core::{
    audit::AuditLogger,
    config::Config,
    ignore::{IgnoreStore, JsonIgnoreStore},
    messaging::{
        port::MessagingPort,
        throttled::{ThrottleConfig, ThrottledMessenger},
    },
    ports::DirectoryPort,
    relay::{Relay, RelaySettings},
    spam::SpamThrottle,
};

use crate::handlers;
use crate::TelegramMessenger;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub relay: Arc<Relay>,
}

/// Build the relay from config and the Telegram adapter.
pub async fn build_relay(cfg: &Config, bot: Bot) -> anyhow::Result<Relay> {
    let telegram = Arc::new(TelegramMessenger::new(bot).with_message_limit(cfg.message_limit));

    // Throttle outbound calls to stay under Telegram's flood limits; the adapter
    // still honours a single RetryAfter on top of this.
    let raw_messenger: Arc<dyn MessagingPort> = telegram.clone();
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));
    let directory: Arc<dyn DirectoryPort> = telegram;

    let ignores: Arc<dyn IgnoreStore> =
        Arc::new(JsonIgnoreStore::open(&cfg.ignored_users_file).await?);
    let spam = SpamThrottle::new(cfg.antispam_messages, cfg.antispam_window);

    Ok(Relay::new(RelaySettings::from(cfg), messenger, directory, ignores, spam)
        .with_audit(AuditLogger::new(cfg.audit_log_path.clone(), cfg.audit_log_json)))
}

pub async fn run_polling(cfg: Arc<Config>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    let relay = Arc::new(build_relay(&cfg, bot.clone()).await?);
    tracing::info!(
        staff_chat = cfg.staff_chat_id.0,
        ignore_file = %cfg.ignored_users_file.display(),
        antispam_messages = cfg.antispam_messages,
        antispam_seconds = cfg.antispam_window.as_secs(),
        "starting relay"
    );

    // Without the staff chat there is nowhere to relay to.
    relay
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("cannot post to staff chat {}: {e}", cfg.staff_chat_id.0))?;

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        relay,
    });

    let handler =
        dptree::entry().branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("relay stopped");
    Ok(())
}
