use std::sync::Arc;

use modmail_core::config::Config;

#[tokio::main]
async fn main() -> Result<(), modmail_core::Error> {
    modmail_core::logging::init("modmail")?;

    let cfg = Arc::new(Config::load()?);
    tracing::info!(staff_chat = cfg.staff_chat_id.0, "configuration loaded");

    modmail_telegram::router::run_polling(cfg)
        .await
        .map_err(|e| modmail_core::Error::External(format!("telegram bot failed: {e}")))?;

    Ok(())
}
