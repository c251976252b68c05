//! Message routing between users' private chats and the staff chat.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::{Mutex, OnceCell};

use crate::{
    audit::{AuditEvent, AuditLogger},
    commands::{self, CommandError, ReplyTarget, StaffCommand},
    config::Config,
    domain::{ChatId, UserId, UserProfile},
    formatting::{escape_html, id_and_mention, mention, truncate_text, user_badge, utf16_len},
    ignore::{IgnoreEntry, IgnoreStore},
    messaging::{
        port::MessagingPort,
        types::{DirectMessage, StaffMessage},
    },
    ports::DirectoryPort,
    spam::{SpamThrottle, SpamVerdict},
    Result,
};

const SPAM_REASON: &str = "auto-ignored due to spam";
const LIST_REASON_MAX: usize = 200;

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub staff_chat: ChatId,
    pub command_prefix: String,
    pub anonymous_staff: bool,
}

impl From<&Config> for RelaySettings {
    fn from(cfg: &Config) -> Self {
        Self {
            staff_chat: cfg.staff_chat_id,
            command_prefix: cfg.command_prefix.clone(),
            anonymous_staff: cfg.anonymous_staff,
        }
    }
}

/// What happened to an inbound direct message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectOutcome {
    NotReady,
    OwnMessage,
    Ignored,
    /// This message tripped the spam throttle; the user is now ignored.
    SpamIgnored,
    Relayed,
}

/// What happened to a staff chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaffOutcome {
    NotReady,
    NotStaffChat,
    NotCommand,
    Handled,
    Failed,
}

pub struct Relay {
    settings: RelaySettings,
    messenger: Arc<dyn MessagingPort>,
    directory: Arc<dyn DirectoryPort>,
    ignores: Arc<dyn IgnoreStore>,
    spam: Mutex<SpamThrottle>,
    last_replied: Mutex<Option<UserId>>,
    me: OnceCell<UserProfile>,
    ready: AtomicBool,
    audit: Option<AuditLogger>,
}

impl Relay {
    pub fn new(
        settings: RelaySettings,
        messenger: Arc<dyn MessagingPort>,
        directory: Arc<dyn DirectoryPort>,
        ignores: Arc<dyn IgnoreStore>,
        spam: SpamThrottle,
    ) -> Self {
        Self {
            settings,
            messenger,
            directory,
            ignores,
            spam: Mutex::new(spam),
            last_replied: Mutex::new(None),
            me: OnceCell::new(),
            ready: AtomicBool::new(false),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub async fn last_replied(&self) -> Option<UserId> {
        *self.last_replied.lock().await
    }

    /// Announce the bot in the staff chat and start accepting messages.
    ///
    /// Calling this again (gateway reconnects) is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }

        let directory = self.directory.clone();
        let me = self
            .me
            .get_or_try_init(|| async move { directory.me().await })
            .await?;

        let text = format!("{} is now ready.", mention(me));
        self.messenger
            .send_html(self.settings.staff_chat, &text)
            .await?;

        tracing::info!(bot = %me.id, staff_chat = self.settings.staff_chat.0, "relay ready");
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_me(&self, user_id: UserId) -> bool {
        self.me.get().is_some_and(|me| me.id == user_id)
    }

    fn record(&self, event: AuditEvent) {
        if let Some(audit) = &self.audit {
            audit.record(event);
        }
    }

    fn max_len(&self) -> usize {
        self.messenger.capabilities().max_message_len
    }

    /// `header` (already HTML) followed by escaped `body`, cut to the message limit.
    fn compose(&self, header: &str, body: &str) -> String {
        compose_html(header, body, self.max_len())
    }

    async fn post_staff(&self, html: &str) -> Result<()> {
        self.messenger
            .send_html(self.settings.staff_chat, html)
            .await?;
        Ok(())
    }

    // ============== Direct messages ==============

    pub async fn handle_direct(&self, msg: &DirectMessage) -> Result<DirectOutcome> {
        if !self.is_ready() {
            return Ok(DirectOutcome::NotReady);
        }
        let user = &msg.author;
        if self.is_me(user.id) {
            return Ok(DirectOutcome::OwnMessage);
        }

        if self.ignores.is_ignored(user.id).await? {
            tracing::debug!(user = %user.id, "dropping message from ignored user");
            return Ok(DirectOutcome::Ignored);
        }

        let verdict = self.spam.lock().await.check_at(user.id, msg.sent_at);
        if let SpamVerdict::Exceeded { count } = verdict {
            self.auto_ignore(user, count).await?;
            return Ok(DirectOutcome::SpamIgnored);
        }

        let header = format!("{} {}", user_badge(user.id), id_and_mention(user));
        let text = msg.text.as_deref().unwrap_or("");
        let html = self.compose(&header, text);
        self.post_staff(&html).await?;

        if msg.has_media {
            if let Err(e) = self
                .messenger
                .copy_message(msg.message, self.settings.staff_chat)
                .await
            {
                tracing::warn!(user = %user.id, error = %e, "failed to copy attachment");
                self.post_staff(&format!(
                    "Attachments in the above message from {} could not be copied.",
                    id_and_mention(user)
                ))
                .await?;
            }
        }

        tracing::info!(user = %user.id, media = msg.has_media, "relayed direct message");
        self.record(AuditEvent::relay(user.id, msg.text.as_deref(), msg.has_media));
        Ok(DirectOutcome::Relayed)
    }

    async fn auto_ignore(&self, user: &UserProfile, count: u32) -> Result<()> {
        let entry = IgnoreEntry::new(user.id).reason(Some(SPAM_REASON.to_string()));
        self.ignores.insert(entry.clone()).await?;
        self.spam.lock().await.reset(user.id);

        tracing::warn!(user = %user.id, count, "auto-ignored user for spam");
        self.record(AuditEvent::spam(user.id, count));
        self.record(AuditEvent::ignore(&entry));

        let prefix = escape_html(&self.settings.command_prefix);
        self.post_staff(&format!(
            "{} auto-ignored due to spam. Use <code>{prefix}unignore</code> to reverse.",
            id_and_mention(user)
        ))
        .await?;

        self.notify_ignored(&entry).await;
        Ok(())
    }

    /// Tell a user their messages no longer reach staff (best-effort).
    async fn notify_ignored(&self, entry: &IgnoreEntry) {
        if entry.quiet {
            return;
        }
        let notice = "Your messages are no longer being delivered to staff.";
        let text = match &entry.reason {
            Some(reason) => self.compose(notice, &format!("Reason: {reason}")),
            None => notice.to_string(),
        };

        if let Err(e) = self
            .messenger
            .send_html(ChatId::from(entry.user_id), &text)
            .await
        {
            tracing::debug!(user = %entry.user_id, error = %e, "could not notify ignored user");
        }
    }

    // ============== Staff chat ==============

    pub async fn handle_staff(&self, msg: &StaffMessage) -> Result<StaffOutcome> {
        if !self.is_ready() {
            return Ok(StaffOutcome::NotReady);
        }
        if msg.message.chat_id != self.settings.staff_chat {
            return Ok(StaffOutcome::NotStaffChat);
        }
        if self.is_me(msg.author.id) || msg.author.is_bot {
            return Ok(StaffOutcome::NotCommand);
        }

        let Some(parsed) = commands::parse(&self.settings.command_prefix, &msg.text) else {
            return Ok(StaffOutcome::NotCommand);
        };

        let result = match parsed {
            Ok(cmd) => self.dispatch(msg, cmd).await,
            Err(err) => self.usage_error(msg, err).await,
        };

        match result {
            Ok(()) => Ok(StaffOutcome::Handled),
            Err(e) => {
                tracing::error!(staff = %msg.author.id, error = %e, "staff command failed");
                self.record(AuditEvent::error(
                    Some(msg.author.id),
                    &e.to_string(),
                    "staff command",
                ));
                let header = format!("{} command failed:", mention(&msg.author));
                self.post_staff(&self.compose(&header, &e.to_string()))
                    .await?;
                Ok(StaffOutcome::Failed)
            }
        }
    }

    async fn dispatch(&self, msg: &StaffMessage, cmd: StaffCommand) -> Result<()> {
        match cmd {
            StaffCommand::Ignore {
                user_id,
                quiet,
                reason,
            } => self.ignore(msg, user_id, quiet, reason).await,
            StaffCommand::Unignore { user_id } => self.unignore(msg, user_id).await,
            StaffCommand::ListIgnored => self.list_ignored().await,
            StaffCommand::Reply { target, text } => self.reply(msg, target, &text).await,
            StaffCommand::Help => {
                let html = format!(
                    "<pre>{}</pre>",
                    escape_html(&commands::help(&self.settings.command_prefix))
                );
                self.post_staff(&html).await
            }
        }
    }

    async fn usage_error(&self, msg: &StaffMessage, err: CommandError) -> Result<()> {
        let mut html = format!("{} {}.", mention(&msg.author), escape_html(&err.to_string()));
        if let CommandError::MissingArgument { command } = &err {
            html.push_str(&format!(
                " Usage: <code>{}</code>",
                escape_html(&commands::usage(&self.settings.command_prefix, command))
            ));
        }
        self.post_staff(&html).await
    }

    async fn ignore(
        &self,
        msg: &StaffMessage,
        user_id: UserId,
        quiet: bool,
        reason: Option<String>,
    ) -> Result<()> {
        let author = mention(&msg.author);
        let entry = IgnoreEntry::new(user_id)
            .quiet(quiet)
            .reason(reason)
            .by(msg.author.id);

        if !self.ignores.insert(entry.clone()).await? {
            return self
                .post_staff(&format!("{author} <code>{user_id}</code> is already ignored."))
                .await;
        }

        tracing::info!(user = %user_id, staff = %msg.author.id, quiet, "user ignored");
        self.record(AuditEvent::ignore(&entry));

        let prefix = escape_html(&self.settings.command_prefix);
        let quiet_note = if quiet { " (quietly)" } else { "" };
        self.post_staff(&format!(
            "{author} <code>{user_id}</code> is now ignored{quiet_note}. Messages from this user \
             will not appear. Use <code>{prefix}unignore</code> to reverse."
        ))
        .await?;

        self.notify_ignored(&entry).await;
        Ok(())
    }

    async fn unignore(&self, msg: &StaffMessage, user_id: UserId) -> Result<()> {
        let author = mention(&msg.author);
        if self.ignores.remove(user_id).await?.is_none() {
            return self
                .post_staff(&format!("{author} <code>{user_id}</code> is not ignored."))
                .await;
        }
        self.spam.lock().await.reset(user_id);

        tracing::info!(user = %user_id, staff = %msg.author.id, "user unignored");
        self.record(AuditEvent::unignore(msg.author.id, user_id));

        let prefix = escape_html(&self.settings.command_prefix);
        self.post_staff(&format!(
            "{author} <code>{user_id}</code> is no longer ignored. Messages from this user will \
             appear again. Use <code>{prefix}ignore</code> to reverse."
        ))
        .await
    }

    async fn list_ignored(&self) -> Result<()> {
        let entries = self.ignores.list().await?;
        if entries.is_empty() {
            return self.post_staff("No users are ignored.").await;
        }

        let lines: Vec<String> = entries.iter().map(format_ignore_line).collect();
        for chunk in chunk_lines(
            &format!("Ignored users ({}):", entries.len()),
            &lines,
            self.max_len(),
        ) {
            self.post_staff(&chunk).await?;
        }
        Ok(())
    }

    async fn reply(&self, msg: &StaffMessage, target: ReplyTarget, text: &str) -> Result<()> {
        let author = mention(&msg.author);

        let user_id = match target {
            ReplyTarget::User(id) => id,
            ReplyTarget::Last => match self.last_replied().await {
                Some(id) => id,
                None => {
                    return self
                        .post_staff(&format!(
                            "{author} there is no previous user to reply to."
                        ))
                        .await;
                }
            },
        };

        let Some(user) = self.directory.lookup_user(user_id).await? else {
            return self
                .post_staff(&format!("{author} user <code>{user_id}</code> was not found."))
                .await;
        };

        let dm_header = if self.settings.anonymous_staff {
            "<b>Staff reply:</b>".to_string()
        } else {
            format!("<b>{}:</b>", escape_html(&msg.author.display_name()))
        };
        let dm = compose_inline(&dm_header, text, self.max_len());

        if let Err(e) = self.messenger.send_html(ChatId::from(user.id), &dm).await {
            if e.is_forbidden() {
                tracing::info!(user = %user.id, "reply refused by platform");
                return self
                    .post_staff(&format!(
                        "{author} {} has blocked the bot or never started a conversation.",
                        mention(&user)
                    ))
                    .await;
            }
            return Err(e);
        }

        let mut header = format!(
            "{author} replying to {} {}",
            user_badge(user.id),
            id_and_mention(&user)
        );
        if self.ignores.is_ignored(user.id).await? {
            header.push_str(" (replies ignored)");
        }
        self.post_staff(&self.compose(&header, text)).await?;

        if let Err(e) = self.messenger.delete_message(msg.message).await {
            tracing::debug!(error = %e, "could not delete staff command message");
        }

        *self.last_replied.lock().await = Some(user.id);
        tracing::info!(user = %user.id, staff = %msg.author.id, "delivered staff reply");
        self.record(AuditEvent::reply(msg.author.id, user.id, text));
        Ok(())
    }
}

fn format_ignore_line(e: &IgnoreEntry) -> String {
    let mut line = format!("• <code>{}</code>", e.user_id);
    if e.quiet {
        line.push_str(" (quiet)");
    }
    line.push_str(&format!(" since {}", e.ignored_at.format("%Y-%m-%d")));
    match e.ignored_by {
        Some(staff) => line.push_str(&format!(" by <code>{staff}</code>")),
        None => line.push_str(" automatically"),
    }
    if let Some(reason) = &e.reason {
        line.push_str(&format!(
            ": {}",
            escape_html(&truncate_text(reason, LIST_REASON_MAX))
        ));
    }
    line
}

/// Group lines into messages no longer than `max_len` UTF-16 units.
fn chunk_lines(title: &str, lines: &[String], max_len: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = title.to_string();
    for line in lines {
        if utf16_len(&cur) + 1 + utf16_len(line) > max_len && !cur.is_empty() {
            out.push(std::mem::take(&mut cur));
        }
        if !cur.is_empty() {
            cur.push('\n');
        }
        cur.push_str(line);
    }
    if !cur.is_empty() {
        out.push(cur);
    }
    out
}

fn compose_with(header: &str, sep: char, body: &str, max_len: usize) -> String {
    if body.is_empty() {
        return header.to_string();
    }

    let room = max_len.saturating_sub(utf16_len(header) + 1);
    let mut budget = utf16_len(body).min(room);
    loop {
        let escaped = escape_html(&truncate_text(body, budget));
        let escaped_len = utf16_len(&escaped);
        if escaped_len <= room || budget == 0 {
            return format!("{header}{sep}{escaped}");
        }
        let over = escaped_len - room;
        budget = budget.saturating_sub(((over + 3) / 4).max(1));
    }
}

/// Header line, newline, escaped body.
pub fn compose_html(header: &str, body: &str, max_len: usize) -> String {
    compose_with(header, '\n', body, max_len)
}

/// Header, space, escaped body.
pub fn compose_inline(header: &str, body: &str, max_len: usize) -> String {
    compose_with(header, ' ', body, max_len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{MessageId, MessageRef},
        errors::Error,
        ignore::MemoryIgnoreStore,
        messaging::{
            throttled::{ThrottleConfig, ThrottledMessenger},
            types::MessagingCapabilities,
        },
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    const STAFF: ChatId = ChatId(-100);
    const BOT: UserId = UserId(1);

    #[derive(Default)]
    struct FakeMessenger {
        next_id: StdMutex<i32>,
        sends: StdMutex<Vec<(ChatId, String)>>,
        deletes: StdMutex<Vec<MessageRef>>,
        copies: StdMutex<Vec<(MessageRef, ChatId)>>,
        blocked: StdMutex<HashSet<i64>>,
    }

    impl FakeMessenger {
        fn alloc(&self, chat_id: ChatId) -> MessageRef {
            let mut guard = self.next_id.lock().unwrap();
            *guard += 1;
            MessageRef {
                chat_id,
                message_id: MessageId(*guard),
            }
        }

        fn sent_to(&self, chat_id: ChatId) -> Vec<String> {
            self.sends
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| *c == chat_id)
                .map(|(_, s)| s.clone())
                .collect()
        }

        fn block(&self, user: UserId) {
            self.blocked.lock().unwrap().insert(user.0);
        }
    }

    #[async_trait]
    impl MessagingPort for FakeMessenger {
        fn capabilities(&self) -> MessagingCapabilities {
            MessagingCapabilities {
                max_message_len: 4096,
            }
        }

        async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
            if self.blocked.lock().unwrap().contains(&chat_id.0) {
                return Err(Error::Forbidden("bot was blocked by the user".to_string()));
            }
            self.sends.lock().unwrap().push((chat_id, html.to_string()));
            Ok(self.alloc(chat_id))
        }

        async fn delete_message(&self, msg: MessageRef) -> Result<()> {
            self.deletes.lock().unwrap().push(msg);
            Ok(())
        }

        async fn copy_message(&self, from: MessageRef, to: ChatId) -> Result<MessageRef> {
            self.copies.lock().unwrap().push((from, to));
            Ok(self.alloc(to))
        }
    }

    #[derive(Default)]
    struct FakeDirectory {
        users: StdMutex<HashMap<UserId, UserProfile>>,
    }

    impl FakeDirectory {
        fn add(&self, user: UserProfile) {
            self.users.lock().unwrap().insert(user.id, user);
        }
    }

    #[async_trait]
    impl DirectoryPort for FakeDirectory {
        async fn me(&self) -> Result<UserProfile> {
            let mut me = UserProfile::new(BOT, "ModMail");
            me.is_bot = true;
            Ok(me)
        }

        async fn lookup_user(&self, user_id: UserId) -> Result<Option<UserProfile>> {
            Ok(self.users.lock().unwrap().get(&user_id).cloned())
        }
    }

    struct Harness {
        relay: Relay,
        messenger: Arc<FakeMessenger>,
        directory: Arc<FakeDirectory>,
        ignores: Arc<MemoryIgnoreStore>,
    }

    fn settings(anonymous_staff: bool) -> RelaySettings {
        RelaySettings {
            staff_chat: STAFF,
            command_prefix: "/".to_string(),
            anonymous_staff,
        }
    }

    fn harness_with(anonymous_staff: bool, max_messages: u32) -> Harness {
        let messenger = Arc::new(FakeMessenger::default());
        let directory = Arc::new(FakeDirectory::default());
        let ignores = Arc::new(MemoryIgnoreStore::new());
        let relay = Relay::new(
            settings(anonymous_staff),
            messenger.clone(),
            directory.clone(),
            ignores.clone(),
            SpamThrottle::new(max_messages, Duration::from_secs(60)),
        );
        Harness {
            relay,
            messenger,
            directory,
            ignores,
        }
    }

    async fn ready(anonymous_staff: bool, max_messages: u32) -> Harness {
        let h = harness_with(anonymous_staff, max_messages);
        h.relay.start().await.unwrap();
        h
    }

    fn user(id: i64, name: &str) -> UserProfile {
        UserProfile::new(UserId(id), name)
    }

    fn dm(from: &UserProfile, text: &str) -> DirectMessage {
        DirectMessage {
            author: from.clone(),
            message: MessageRef {
                chat_id: ChatId(from.id.0),
                message_id: MessageId(500),
            },
            sent_at: Utc::now(),
            text: Some(text.to_string()),
            has_media: false,
        }
    }

    fn staff(text: &str) -> StaffMessage {
        StaffMessage {
            author: user(900, "Alice"),
            message: MessageRef {
                chat_id: STAFF,
                message_id: MessageId(777),
            },
            text: text.to_string(),
        }
    }

    #[tokio::test]
    async fn drops_messages_until_started() {
        let h = harness_with(false, 5);
        let bob = user(42, "Bob");

        assert_eq!(
            h.relay.handle_direct(&dm(&bob, "hi")).await.unwrap(),
            DirectOutcome::NotReady
        );
        assert_eq!(
            h.relay.handle_staff(&staff("/ignored")).await.unwrap(),
            StaffOutcome::NotReady
        );
        assert!(h.messenger.sends.lock().unwrap().is_empty());

        h.relay.start().await.unwrap();
        h.relay.start().await.unwrap();
        let staff_posts = h.messenger.sent_to(STAFF);
        assert_eq!(staff_posts.len(), 1);
        assert!(staff_posts[0].ends_with("is now ready."));
    }

    #[tokio::test]
    async fn relays_direct_messages_with_header() {
        let h = ready(false, 5).await;
        let bob = user(42, "Bob");

        let outcome = h.relay.handle_direct(&dm(&bob, "help <me>")).await.unwrap();
        assert_eq!(outcome, DirectOutcome::Relayed);

        let posts = h.messenger.sent_to(STAFF);
        let last = posts.last().unwrap();
        assert!(last.starts_with(user_badge(UserId(42))));
        assert!(last.contains("<code>42</code>"));
        assert!(last.contains(r#"<a href="tg://user?id=42">Bob</a>"#));
        assert!(last.ends_with("\nhelp &lt;me&gt;"));
        assert!(h.messenger.copies.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn copies_media_after_header() {
        let h = ready(false, 5).await;
        let bob = user(42, "Bob");
        let mut msg = dm(&bob, "");
        msg.text = None;
        msg.has_media = true;

        h.relay.handle_direct(&msg).await.unwrap();

        let copies = h.messenger.copies.lock().unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0], (msg.message, STAFF));
    }

    #[tokio::test]
    async fn ignores_own_messages() {
        let h = ready(false, 5).await;
        let me = user(BOT.0, "ModMail");
        assert_eq!(
            h.relay.handle_direct(&dm(&me, "loop")).await.unwrap(),
            DirectOutcome::OwnMessage
        );
    }

    #[tokio::test]
    async fn spam_auto_ignores_and_notifies() {
        let h = ready(false, 3).await;
        let bob = user(42, "Bob");

        for _ in 0..2 {
            assert_eq!(
                h.relay.handle_direct(&dm(&bob, "x")).await.unwrap(),
                DirectOutcome::Relayed
            );
        }
        assert_eq!(
            h.relay.handle_direct(&dm(&bob, "x")).await.unwrap(),
            DirectOutcome::SpamIgnored
        );

        let entry = h.ignores.get(UserId(42)).await.unwrap().unwrap();
        assert_eq!(entry.reason.as_deref(), Some(SPAM_REASON));
        assert!(entry.ignored_by.is_none());

        let last = h.messenger.sent_to(STAFF).last().cloned().unwrap();
        assert!(last.contains("auto-ignored due to spam"));
        assert!(last.contains("<code>/unignore</code>"));

        let to_bob = h.messenger.sent_to(ChatId(42));
        assert_eq!(to_bob.len(), 1);
        assert!(to_bob[0].contains("Reason: auto-ignored due to spam"));

        assert_eq!(
            h.relay.handle_direct(&dm(&bob, "x")).await.unwrap(),
            DirectOutcome::Ignored
        );
    }

    #[tokio::test(start_paused = true)]
    async fn burst_counts_by_send_time_behind_outbound_throttle() {
        let messenger = Arc::new(FakeMessenger::default());
        let throttled = Arc::new(ThrottledMessenger::new(
            messenger.clone(),
            ThrottleConfig::default(),
        ));
        let relay = Relay::new(
            settings(false),
            throttled,
            Arc::new(FakeDirectory::default()),
            Arc::new(MemoryIgnoreStore::new()),
            SpamThrottle::new(5, Duration::from_secs(5)),
        );
        relay.start().await.unwrap();

        let bob = user(42, "Bob");
        let sent_at = Utc::now();
        let start = tokio::time::Instant::now();
        let mut outcomes = Vec::new();
        for i in 0..8 {
            let mut msg = dm(&bob, &format!("flood {i}"));
            msg.sent_at = sent_at;
            outcomes.push(relay.handle_direct(&msg).await.unwrap());
        }

        // Staff group posts are spaced 3s apart, far past the 5s window.
        assert!(start.elapsed() >= Duration::from_secs(12));
        assert_eq!(
            outcomes,
            vec![
                DirectOutcome::Relayed,
                DirectOutcome::Relayed,
                DirectOutcome::Relayed,
                DirectOutcome::Relayed,
                DirectOutcome::SpamIgnored,
                DirectOutcome::Ignored,
                DirectOutcome::Ignored,
                DirectOutcome::Ignored,
            ]
        );
    }

    #[tokio::test]
    async fn spaced_messages_handled_together_are_not_spam() {
        let h = ready(false, 2).await;
        let bob = user(42, "Bob");

        let now = Utc::now();
        let mut early = dm(&bob, "1");
        early.sent_at = now - chrono::Duration::seconds(120);
        let mut late = dm(&bob, "2");
        late.sent_at = now;

        assert_eq!(
            h.relay.handle_direct(&early).await.unwrap(),
            DirectOutcome::Relayed
        );
        assert_eq!(
            h.relay.handle_direct(&late).await.unwrap(),
            DirectOutcome::Relayed
        );
    }

    #[tokio::test]
    async fn unignore_resets_spam_counter() {
        let h = ready(false, 2).await;
        let bob = user(42, "Bob");

        h.relay.handle_direct(&dm(&bob, "1")).await.unwrap();
        h.relay.handle_staff(&staff("/ignore 42")).await.unwrap();
        h.relay.handle_staff(&staff("/unignore 42")).await.unwrap();

        assert_eq!(
            h.relay.handle_direct(&dm(&bob, "2")).await.unwrap(),
            DirectOutcome::Relayed
        );
    }

    #[tokio::test]
    async fn ignore_and_unignore_commands() {
        let h = ready(false, 5).await;

        h.relay
            .handle_staff(&staff("/ignore 42 abusive language"))
            .await
            .unwrap();
        let entry = h.ignores.get(UserId(42)).await.unwrap().unwrap();
        assert!(!entry.quiet);
        assert_eq!(entry.reason.as_deref(), Some("abusive language"));
        assert_eq!(entry.ignored_by, Some(UserId(900)));
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .contains("<code>42</code> is now ignored."));
        assert!(h.messenger.sent_to(ChatId(42))[0].contains("abusive language"));

        h.relay.handle_staff(&staff("/ignore 42")).await.unwrap();
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .ends_with("<code>42</code> is already ignored."));

        h.relay.handle_staff(&staff("/unignore 42")).await.unwrap();
        assert!(!h.ignores.is_ignored(UserId(42)).await.unwrap());
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .contains("is no longer ignored"));

        h.relay.handle_staff(&staff("/unignore 42")).await.unwrap();
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .ends_with("<code>42</code> is not ignored."));
    }

    #[tokio::test]
    async fn quiet_ignore_does_not_notify_user() {
        let h = ready(false, 5).await;
        h.relay
            .handle_staff(&staff("/qignore 42 troll"))
            .await
            .unwrap();

        assert!(h.ignores.get(UserId(42)).await.unwrap().unwrap().quiet);
        assert!(h.messenger.sent_to(ChatId(42)).is_empty());
    }

    #[tokio::test]
    async fn lists_ignored_users() {
        let h = ready(false, 5).await;
        h.relay.handle_staff(&staff("/ignored")).await.unwrap();
        assert_eq!(
            h.messenger.sent_to(STAFF).last().unwrap(),
            "No users are ignored."
        );

        h.relay
            .handle_staff(&staff("/qignore 7 <spam>"))
            .await
            .unwrap();
        h.relay.handle_staff(&staff("/ignored")).await.unwrap();
        let listing = h.messenger.sent_to(STAFF).last().cloned().unwrap();
        assert!(listing.starts_with("Ignored users (1):"));
        assert!(listing.contains("<code>7</code> (quiet)"));
        assert!(listing.contains("by <code>900</code>: &lt;spam&gt;"));
    }

    #[tokio::test]
    async fn replies_to_user_and_tracks_last() {
        let h = ready(false, 5).await;
        h.directory.add(user(42, "Bob"));

        let outcome = h
            .relay
            .handle_staff(&staff("/42 we are on it & more"))
            .await
            .unwrap();
        assert_eq!(outcome, StaffOutcome::Handled);

        let to_bob = h.messenger.sent_to(ChatId(42));
        assert_eq!(to_bob, vec!["<b>Alice:</b> we are on it &amp; more".to_string()]);

        let header = h.messenger.sent_to(STAFF).last().cloned().unwrap();
        assert!(header.contains("replying to"));
        assert!(header.contains("<code>42</code>"));
        assert!(!header.contains("(replies ignored)"));

        assert_eq!(h.messenger.deletes.lock().unwrap().len(), 1);
        assert_eq!(h.relay.last_replied().await, Some(UserId(42)));

        h.relay.handle_staff(&staff("/r follow up")).await.unwrap();
        let to_bob = h.messenger.sent_to(ChatId(42));
        assert_eq!(to_bob.last().unwrap(), "<b>Alice:</b> follow up");
    }

    #[tokio::test]
    async fn anonymous_staff_hides_author() {
        let h = ready(true, 5).await;
        h.directory.add(user(42, "Bob"));

        h.relay.handle_staff(&staff("/42 hello")).await.unwrap();
        assert_eq!(
            h.messenger.sent_to(ChatId(42)),
            vec!["<b>Staff reply:</b> hello".to_string()]
        );
    }

    #[tokio::test]
    async fn reply_edge_cases() {
        let h = ready(false, 5).await;

        h.relay.handle_staff(&staff("/r hello")).await.unwrap();
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .contains("there is no previous user to reply to."));

        h.relay.handle_staff(&staff("/42 hello")).await.unwrap();
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .contains("user <code>42</code> was not found."));

        h.directory.add(user(43, "Carol"));
        h.messenger.block(UserId(43));
        h.relay.handle_staff(&staff("/43 hello")).await.unwrap();
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .contains("has blocked the bot or never started a conversation."));
        assert!(h.messenger.deletes.lock().unwrap().is_empty());
        assert_eq!(h.relay.last_replied().await, None);
    }

    #[tokio::test]
    async fn reply_to_ignored_user_is_flagged() {
        let h = ready(false, 5).await;
        h.directory.add(user(42, "Bob"));
        h.relay.handle_staff(&staff("/qignore 42")).await.unwrap();

        h.relay.handle_staff(&staff("/42 one more thing")).await.unwrap();
        let header = h.messenger.sent_to(STAFF).last().cloned().unwrap();
        assert!(header.contains("(replies ignored)"));
    }

    #[tokio::test]
    async fn staff_chat_filtering_and_usage_errors() {
        let h = ready(false, 5).await;

        let mut elsewhere = staff("/ignore 42");
        elsewhere.message.chat_id = ChatId(-5);
        assert_eq!(
            h.relay.handle_staff(&elsewhere).await.unwrap(),
            StaffOutcome::NotStaffChat
        );
        assert_eq!(
            h.relay.handle_staff(&staff("just chatting")).await.unwrap(),
            StaffOutcome::NotCommand
        );

        h.relay.handle_staff(&staff("/ignore")).await.unwrap();
        assert!(h
            .messenger
            .sent_to(STAFF)
            .last()
            .unwrap()
            .contains("Usage: <code>/ignore &lt;user_id&gt; [reason]</code>"));

        h.relay.handle_staff(&staff("/help")).await.unwrap();
        assert!(h.messenger.sent_to(STAFF).last().unwrap().starts_with("<pre>"));
    }

    struct ReadOnlyStore;

    #[async_trait]
    impl IgnoreStore for ReadOnlyStore {
        async fn get(&self, _user_id: UserId) -> Result<Option<IgnoreEntry>> {
            Ok(None)
        }

        async fn insert(&self, _entry: IgnoreEntry) -> Result<bool> {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only file system",
            )))
        }

        async fn remove(&self, _user_id: UserId) -> Result<Option<IgnoreEntry>> {
            Ok(None)
        }

        async fn list(&self) -> Result<Vec<IgnoreEntry>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn store_failure_is_reported_in_staff_chat() {
        let messenger = Arc::new(FakeMessenger::default());
        let relay = Relay::new(
            settings(false),
            messenger.clone(),
            Arc::new(FakeDirectory::default()),
            Arc::new(ReadOnlyStore),
            SpamThrottle::new(5, Duration::from_secs(60)),
        );
        relay.start().await.unwrap();

        assert_eq!(
            relay.handle_staff(&staff("/ignore 42")).await.unwrap(),
            StaffOutcome::Failed
        );
        let last = messenger.sent_to(STAFF).last().cloned().unwrap();
        assert!(last.contains("command failed:"));
        assert!(last.contains("read-only file system"));
        assert!(messenger.sent_to(ChatId(42)).is_empty());
    }

    #[test]
    fn compose_respects_limit_after_escaping() {
        let html = compose_html("<b>h</b>", &"<".repeat(100), 50);
        assert!(html.chars().count() <= 50);
        assert!(html.starts_with("<b>h</b>\n&lt;"));
        assert!(html.ends_with("..."));

        assert_eq!(compose_inline("<b>x:</b>", "hi", 4096), "<b>x:</b> hi");
        assert_eq!(compose_html("head", "", 4096), "head");
    }

    #[test]
    fn compose_counts_astral_characters_twice() {
        let bob = user(42, "Bob");
        let header = format!("{} {}", user_badge(bob.id), id_and_mention(&bob));
        let body = "😀".repeat(2048);

        let html = compose_html(&header, &body, 4096);
        assert!(utf16_len(&html) <= 4096);
        assert!(html.ends_with("..."));
        assert!(html.starts_with(&format!("{header}\n😀")));
    }

    #[test]
    fn chunks_long_listings() {
        let lines: Vec<String> = (0..10).map(|i| format!("line {i:02}")).collect();
        let chunks = chunk_lines("title", &lines, 30);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| utf16_len(c) <= 30));
        assert!(chunks[0].starts_with("title\n"));
    }
}
