use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};

use crate::domain::UserId;

/// Outcome of recording one inbound message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpamVerdict {
    Allowed { count: u32 },
    Exceeded { count: u32 },
}

/// Per-user message counter with decay.
///
/// Every message counts for `window` after it was sent. Timestamps come from
/// the platform, so a backlog handled late is still counted as the burst it
/// was. The message that brings the live count up to `max_messages` is
/// reported as `Exceeded`.
#[derive(Clone, Debug)]
pub struct SpamThrottle {
    max_messages: u32,
    window: Duration,
    recent: HashMap<UserId, VecDeque<DateTime<Utc>>>,
}

impl SpamThrottle {
    /// `max_messages == 0` disables the throttle.
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            recent: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_messages > 0
    }

    /// Record a message sent at `sent_at`.
    pub fn check_at(&mut self, user_id: UserId, sent_at: DateTime<Utc>) -> SpamVerdict {
        if !self.enabled() {
            return SpamVerdict::Allowed { count: 0 };
        }

        self.prune(sent_at);

        let hits = self.recent.entry(user_id).or_default();
        hits.push_back(sent_at);
        let count = hits.len() as u32;

        if count >= self.max_messages {
            SpamVerdict::Exceeded { count }
        } else {
            SpamVerdict::Allowed { count }
        }
    }

    pub fn reset(&mut self, user_id: UserId) {
        self.recent.remove(&user_id);
    }

    /// Drop expired hits and forget users with none left.
    fn prune(&mut self, now: DateTime<Utc>) {
        let window = self.window;
        self.recent.retain(|_, hits| {
            // A stamp newer than `now` has a negative age and stays.
            hits.retain(|t| now.signed_duration_since(*t).to_std().unwrap_or_default() < window);
            !hits.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_users(&self) -> usize {
        self.recent.len()
    }
}
