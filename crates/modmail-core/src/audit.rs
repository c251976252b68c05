use std::{fs::OpenOptions, io::Write, path::PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::{domain::UserId, errors::Error, formatting::truncate_text, ignore::IgnoreEntry, Result};

const AUDIT_MAX_TEXT: usize = 500;

#[derive(Clone, Debug, Default, Serialize)]
pub struct AuditEvent {
    pub timestamp: String,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_media: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub quiet: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl AuditEvent {
    fn base(event: &str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event: event.to_string(),
            ..Default::default()
        }
    }

    /// A DM relayed into the staff chat.
    pub fn relay(user_id: UserId, content: Option<&str>, has_media: bool) -> Self {
        Self {
            user_id: Some(user_id.0),
            content: content.map(|s| s.to_string()),
            has_media: Some(has_media),
            ..Self::base("relay")
        }
    }

    /// A staff reply delivered to a user.
    pub fn reply(staff_id: UserId, user_id: UserId, content: &str) -> Self {
        Self {
            user_id: Some(user_id.0),
            staff_id: Some(staff_id.0),
            content: Some(content.to_string()),
            ..Self::base("reply")
        }
    }

    pub fn ignore(entry: &IgnoreEntry) -> Self {
        Self {
            user_id: Some(entry.user_id.0),
            staff_id: entry.ignored_by.map(|u| u.0),
            quiet: Some(entry.quiet),
            reason: entry.reason.clone(),
            ..Self::base("ignore")
        }
    }

    pub fn unignore(staff_id: UserId, user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id.0),
            staff_id: Some(staff_id.0),
            ..Self::base("unignore")
        }
    }

    pub fn spam(user_id: UserId, count: u32) -> Self {
        Self {
            user_id: Some(user_id.0),
            count: Some(count),
            ..Self::base("spam")
        }
    }

    pub fn error(user_id: Option<UserId>, error: &str, context: &str) -> Self {
        Self {
            user_id: user_id.map(|u| u.0),
            error: Some(error.to_string()),
            context: Some(context.to_string()),
            ..Self::base("error")
        }
    }
}

#[derive(Clone, Debug)]
pub struct AuditLogger {
    path: PathBuf,
    json: bool,
}

impl AuditLogger {
    pub fn new(path: impl Into<PathBuf>, json: bool) -> Self {
        Self {
            path: path.into(),
            json,
        }
    }

    pub fn write(&self, mut event: AuditEvent) -> Result<()> {
        if let Some(s) = &event.content {
            event.content = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }
        if let Some(s) = &event.reason {
            event.reason = Some(truncate_text(s, AUDIT_MAX_TEXT));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        if self.json {
            let line = serde_json::to_string(&event)?;
            writeln!(file, "{line}")?;
            return Ok(());
        }

        // Plain text format for readability.
        let mut out = String::new();
        out.push('\n');
        out.push_str(&"=".repeat(60));

        let value = serde_json::to_value(&event)?;
        let Some(obj) = value.as_object() else {
            return Err(Error::External(
                "audit event is not a JSON object".to_string(),
            ));
        };
        for (k, v) in obj {
            out.push('\n');
            out.push_str(k);
            out.push_str(": ");
            out.push_str(&json_value_to_display(v));
        }
        out.push('\n');

        file.write_all(out.as_bytes())?;
        Ok(())
    }

    /// Write, logging instead of failing. Auditing never blocks relaying.
    pub fn record(&self, event: AuditEvent) {
        let kind = event.event.clone();
        if let Err(e) = self.write(event) {
            tracing::warn!(event = %kind, error = %e, "failed to write audit event");
        }
    }
}

fn json_value_to_display(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::Null => "null".to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.to_string(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unprintable>".to_string()),
    }
}
