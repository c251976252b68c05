//! Ignore list: which users' DMs are dropped instead of relayed.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{fs, sync::Mutex};

use crate::{domain::UserId, errors::Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnoreEntry {
    pub user_id: UserId,
    /// Quiet ignores are never announced to the user.
    #[serde(default)]
    pub quiet: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default = "Utc::now")]
    pub ignored_at: DateTime<Utc>,
    /// Staff member who issued the ignore; `None` for automatic (spam) ignores.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored_by: Option<UserId>,
}

impl IgnoreEntry {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            quiet: false,
            reason: None,
            ignored_at: Utc::now(),
            ignored_by: None,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason.filter(|r| !r.trim().is_empty());
        self
    }

    pub fn by(mut self, staff: UserId) -> Self {
        self.ignored_by = Some(staff);
        self
    }
}

/// Key-value store of ignored users.
#[async_trait]
pub trait IgnoreStore: Send + Sync {
    async fn get(&self, user_id: UserId) -> Result<Option<IgnoreEntry>>;

    async fn is_ignored(&self, user_id: UserId) -> Result<bool> {
        Ok(self.get(user_id).await?.is_some())
    }

    /// Returns `false` (and keeps the existing entry) if the user is already ignored.
    async fn insert(&self, entry: IgnoreEntry) -> Result<bool>;

    /// Returns the removed entry, or `None` if the user was not ignored.
    async fn remove(&self, user_id: UserId) -> Result<Option<IgnoreEntry>>;

    /// All entries, oldest first.
    async fn list(&self) -> Result<Vec<IgnoreEntry>>;
}

fn sorted(map: &HashMap<UserId, IgnoreEntry>) -> Vec<IgnoreEntry> {
    let mut out: Vec<IgnoreEntry> = map.values().cloned().collect();
    out.sort_by(|a, b| {
        a.ignored_at
            .cmp(&b.ignored_at)
            .then(a.user_id.cmp(&b.user_id))
    });
    out
}

// ============== In-memory ==============

#[derive(Debug, Default)]
pub struct MemoryIgnoreStore {
    entries: Mutex<HashMap<UserId, IgnoreEntry>>,
}

impl MemoryIgnoreStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IgnoreStore for MemoryIgnoreStore {
    async fn get(&self, user_id: UserId) -> Result<Option<IgnoreEntry>> {
        Ok(self.entries.lock().await.get(&user_id).cloned())
    }

    async fn insert(&self, entry: IgnoreEntry) -> Result<bool> {
        let mut map = self.entries.lock().await;
        if map.contains_key(&entry.user_id) {
            return Ok(false);
        }
        map.insert(entry.user_id, entry);
        Ok(true)
    }

    async fn remove(&self, user_id: UserId) -> Result<Option<IgnoreEntry>> {
        Ok(self.entries.lock().await.remove(&user_id))
    }

    async fn list(&self) -> Result<Vec<IgnoreEntry>> {
        Ok(sorted(&*self.entries.lock().await))
    }
}

// ============== JSON file ==============

/// On-disk record. Older files are a bare array of ids (strings or numbers).
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Entry(IgnoreEntry),
    LegacyNumber(i64),
    LegacyString(String),
}

/// Ignore list persisted as a JSON array, rewritten in full on every change.
#[derive(Debug)]
pub struct JsonIgnoreStore {
    path: PathBuf,
    entries: Mutex<HashMap<UserId, IgnoreEntry>>,
}

impl JsonIgnoreStore {
    /// Load the store, creating an empty file if none exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = if fs::try_exists(&path).await? {
            load_entries(&path).await?
        } else {
            write_entries(&path, &[]).await?;
            tracing::info!(path = %path.display(), "created empty ignore list");
            HashMap::new()
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }
}

async fn load_entries(path: &Path) -> Result<HashMap<UserId, IgnoreEntry>> {
    let txt = fs::read_to_string(path).await?;
    if txt.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let records: Vec<StoredRecord> = serde_json::from_str(&txt).map_err(|e| Error::Store {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut out = HashMap::new();
    for record in records {
        let entry = match record {
            StoredRecord::Entry(e) => e,
            StoredRecord::LegacyNumber(id) => IgnoreEntry::new(UserId(id)),
            StoredRecord::LegacyString(s) => {
                let id = s.parse::<UserId>().map_err(|e| Error::Store {
                    path: path.to_path_buf(),
                    reason: format!("invalid user id {s:?}: {e}"),
                })?;
                IgnoreEntry::new(id)
            }
        };
        // First occurrence wins.
        out.entry(entry.user_id).or_insert(entry);
    }
    Ok(out)
}

async fn write_entries(path: &Path, entries: &[IgnoreEntry]) -> Result<()> {
    let txt = serde_json::to_string_pretty(entries)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, txt).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl IgnoreStore for JsonIgnoreStore {
    async fn get(&self, user_id: UserId) -> Result<Option<IgnoreEntry>> {
        Ok(self.entries.lock().await.get(&user_id).cloned())
    }

    async fn insert(&self, entry: IgnoreEntry) -> Result<bool> {
        let mut map = self.entries.lock().await;
        if map.contains_key(&entry.user_id) {
            return Ok(false);
        }

        let mut next = map.clone();
        next.insert(entry.user_id, entry);
        write_entries(&self.path, &sorted(&next)).await?;
        *map = next;
        Ok(true)
    }

    async fn remove(&self, user_id: UserId) -> Result<Option<IgnoreEntry>> {
        let mut map = self.entries.lock().await;
        if !map.contains_key(&user_id) {
            return Ok(None);
        }

        let mut next = map.clone();
        let removed = next.remove(&user_id);
        write_entries(&self.path, &sorted(&next)).await?;
        *map = next;
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<IgnoreEntry>> {
        Ok(sorted(&*self.entries.lock().await))
    }
}
