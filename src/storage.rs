//! Persisted key-value boundary. Blacklist and history managers never write
//! storage themselves: they send a `StorageMutation` through a
//! `StorageChannel` and wait for a change notification carrying the changed
//! keys. The SQLite implementation here is the local authoritative side of
//! that channel.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::cache::CacheEntry;
use crate::models::{BlacklistEntry, FilterResult, HistoryEntry};

pub const BLACKLIST_KEY: &str = "blacklist";
pub const JOB_HISTORY_KEY: &str = "job_history";
pub const FILTER_CACHE_KEY: &str = "filter_cache";

#[derive(Debug, Clone)]
pub enum StorageMutation {
    BlacklistAdd(BlacklistEntry),
    BlacklistRemove { company: String },
    HistoryUpsert(HistoryEntry),
    HistoryRemove { job_id: String },
    CacheStore { job_id: String, result: FilterResult },
}

impl StorageMutation {
    pub fn key(&self) -> &'static str {
        match self {
            StorageMutation::BlacklistAdd(_) | StorageMutation::BlacklistRemove { .. } => {
                BLACKLIST_KEY
            }
            StorageMutation::HistoryUpsert(_) | StorageMutation::HistoryRemove { .. } => {
                JOB_HISTORY_KEY
            }
            StorageMutation::CacheStore { .. } => FILTER_CACHE_KEY,
        }
    }
}

#[async_trait]
pub trait StorageChannel: Send + Sync {
    /// Requests a mutation. The authoritative write happens on the other side
    /// of the channel; the change notification on `changes()` is the only
    /// reliable completion signal.
    async fn request(&self, mutation: StorageMutation) -> Result<()>;

    /// Reads the current authoritative value under `key`.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// Subscribes to change notifications; each message lists the changed keys.
    fn changes(&self) -> broadcast::Receiver<Vec<String>>;
}

pub struct SqliteStorage {
    conn: Mutex<Connection>,
    path: PathBuf,
    change_tx: broadcast::Sender<Vec<String>>,
}

impl SqliteStorage {
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        Ok(Self::with_connection(conn, path))
    }

    pub fn open_at(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self::with_connection(conn, path.to_path_buf()))
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self::with_connection(conn, PathBuf::from(":memory:"));
        storage.init()?;
        Ok(storage)
    }

    fn with_connection(conn: Connection, path: PathBuf) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            conn: Mutex::new(conn),
            path,
            change_tx,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "vetta") {
            Ok(proj_dirs.data_dir().join("vetta.db"))
        } else {
            Ok(PathBuf::from("vetta.db"))
        }
    }

    pub fn init(&self) -> Result<()> {
        self.conn.lock().unwrap().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.lock().unwrap().query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='kv'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            anyhow::bail!("Storage not initialized. Run 'vetta init' first.");
        }
        Ok(())
    }

    fn read_value(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = match conn.query_row(
            "SELECT value FROM kv WHERE key = ?1",
            [key],
            |row| row.get(0),
        ) {
            Ok(value) => Some(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw)
                    .with_context(|| format!("corrupt stored value under key '{}'", key))?,
            )),
            None => Ok(None),
        }
    }

    fn read_typed<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        match self.read_value(key)? {
            Some(value) => Ok(serde_json::from_value(value)
                .with_context(|| format!("unexpected shape under key '{}'", key))?),
            None => Ok(T::default()),
        }
    }

    fn write_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.conn.lock().unwrap().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, raw],
        )?;
        Ok(())
    }

    fn apply(&self, mutation: &StorageMutation) -> Result<()> {
        match mutation {
            StorageMutation::BlacklistAdd(entry) => {
                let mut list: Vec<BlacklistEntry> = self.read_typed(BLACKLIST_KEY)?;
                match list.iter_mut().find(|e| e.company == entry.company) {
                    Some(existing) => {
                        existing.reason = entry.reason.clone();
                        existing.notes = entry.notes.clone();
                        existing.date_updated = Utc::now();
                    }
                    None => list.push(entry.clone()),
                }
                self.write_typed(BLACKLIST_KEY, &list)
            }
            StorageMutation::BlacklistRemove { company } => {
                let mut list: Vec<BlacklistEntry> = self.read_typed(BLACKLIST_KEY)?;
                list.retain(|e| &e.company != company);
                self.write_typed(BLACKLIST_KEY, &list)
            }
            StorageMutation::HistoryUpsert(entry) => {
                let mut list: Vec<HistoryEntry> = self.read_typed(JOB_HISTORY_KEY)?;
                match list.iter_mut().find(|e| e.job_id == entry.job_id) {
                    Some(existing) => *existing = entry.clone(),
                    None => list.push(entry.clone()),
                }
                self.write_typed(JOB_HISTORY_KEY, &list)
            }
            StorageMutation::HistoryRemove { job_id } => {
                let mut list: Vec<HistoryEntry> = self.read_typed(JOB_HISTORY_KEY)?;
                list.retain(|e| &e.job_id != job_id);
                self.write_typed(JOB_HISTORY_KEY, &list)
            }
            StorageMutation::CacheStore { job_id, result } => {
                let mut map: HashMap<String, CacheEntry> = self.read_typed(FILTER_CACHE_KEY)?;
                map.insert(
                    job_id.clone(),
                    CacheEntry {
                        result: result.clone(),
                        stored_at: Utc::now(),
                    },
                );
                self.write_typed(FILTER_CACHE_KEY, &map)
            }
        }
    }
}

#[async_trait]
impl StorageChannel for SqliteStorage {
    async fn request(&self, mutation: StorageMutation) -> Result<()> {
        let key = mutation.key();
        self.apply(&mutation)?;
        // No receivers is fine; nobody is watching yet.
        let _ = self.change_tx.send(vec![key.to_string()]);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        self.read_value(key)
    }

    fn changes(&self) -> broadcast::Receiver<Vec<String>> {
        self.change_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterStatus;

    #[tokio::test]
    async fn test_blacklist_add_remove_roundtrip() {
        let storage = SqliteStorage::in_memory().unwrap();

        storage
            .request(StorageMutation::BlacklistAdd(BlacklistEntry::new(
                "Acme", "spam", "",
            )))
            .await
            .unwrap();

        let value = storage.get(BLACKLIST_KEY).await.unwrap().unwrap();
        let list: Vec<BlacklistEntry> = serde_json::from_value(value).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].company, "Acme");
        assert_eq!(list[0].reason, "spam");

        storage
            .request(StorageMutation::BlacklistRemove {
                company: "Acme".to_string(),
            })
            .await
            .unwrap();

        let value = storage.get(BLACKLIST_KEY).await.unwrap().unwrap();
        let list: Vec<BlacklistEntry> = serde_json::from_value(value).unwrap();
        assert!(list.is_empty());
    }

    #[tokio::test]
    async fn test_blacklist_add_is_upsert() {
        let storage = SqliteStorage::in_memory().unwrap();
        storage
            .request(StorageMutation::BlacklistAdd(BlacklistEntry::new(
                "Acme", "first", "",
            )))
            .await
            .unwrap();
        storage
            .request(StorageMutation::BlacklistAdd(BlacklistEntry::new(
                "Acme", "second", "notes",
            )))
            .await
            .unwrap();

        let value = storage.get(BLACKLIST_KEY).await.unwrap().unwrap();
        let list: Vec<BlacklistEntry> = serde_json::from_value(value).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reason, "second");
        assert_eq!(list[0].notes, "notes");
    }

    #[tokio::test]
    async fn test_change_notification_carries_key() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut rx = storage.changes();

        storage
            .request(StorageMutation::HistoryUpsert(HistoryEntry::bare("job-1")))
            .await
            .unwrap();

        let keys = rx.recv().await.unwrap();
        assert_eq!(keys, vec![JOB_HISTORY_KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_history_upsert_replaces_by_job_id() {
        let storage = SqliteStorage::in_memory().unwrap();
        let mut entry = HistoryEntry::bare("job-1");
        entry.title = "v1".to_string();
        storage
            .request(StorageMutation::HistoryUpsert(entry.clone()))
            .await
            .unwrap();
        entry.title = "v2".to_string();
        storage
            .request(StorageMutation::HistoryUpsert(entry))
            .await
            .unwrap();

        let value = storage.get(JOB_HISTORY_KEY).await.unwrap().unwrap();
        let list: Vec<HistoryEntry> = serde_json::from_value(value).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title, "v2");
    }

    #[tokio::test]
    async fn test_cache_store_accumulates() {
        let storage = SqliteStorage::in_memory().unwrap();
        for id in ["a", "b"] {
            storage
                .request(StorageMutation::CacheStore {
                    job_id: id.to_string(),
                    result: FilterResult::with_status(FilterStatus::LikelyMatch, vec![]),
                })
                .await
                .unwrap();
        }

        let value = storage.get(FILTER_CACHE_KEY).await.unwrap().unwrap();
        let map: HashMap<String, CacheEntry> = serde_json::from_value(value).unwrap();
        assert_eq!(map.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let storage = SqliteStorage::in_memory().unwrap();
        assert!(storage.get("nothing_here").await.unwrap().is_none());
    }
}
