//! Company-level deny list. The authoritative copy lives behind the storage
//! channel; this manager is a thin notifier. Mutations are requested over
//! the channel and resolve when a storage-change notification arrives - all
//! pending callers share one resolver queue and are resolved per
//! notification batch, so a caller may resolve on a change that was not
//! specifically its own. Subsequent reads use authoritative state, which
//! keeps that best-effort contract safe.

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, oneshot};

use crate::events::{Subscribers, Subscription};
use crate::models::BlacklistEntry;
use crate::storage::{BLACKLIST_KEY, StorageChannel, StorageMutation};

#[derive(Debug, Clone)]
pub enum BlacklistEvent {
    Added(BlacklistEntry),
    Removed { company: String },
}

pub struct BlacklistManager {
    channel: Arc<dyn StorageChannel>,
    entries: Mutex<Vec<BlacklistEntry>>,
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
    subscribers: Subscribers<BlacklistEvent>,
}

impl BlacklistManager {
    pub async fn new(channel: Arc<dyn StorageChannel>) -> Result<Arc<Self>> {
        // Subscribe before the initial load so no change slips between them.
        let rx = channel.changes();
        let initial = load_entries(channel.as_ref()).await?;

        let manager = Arc::new(Self {
            channel,
            entries: Mutex::new(initial),
            waiters: Mutex::new(Vec::new()),
            subscribers: Subscribers::new(),
        });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(listen(weak, rx));
        Ok(manager)
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&BlacklistEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    pub async fn add(&self, company: &str, reason: &str, notes: &str) -> Result<()> {
        let ack = self.register_waiter();
        self.channel
            .request(StorageMutation::BlacklistAdd(BlacklistEntry::new(
                company, reason, notes,
            )))
            .await
            .context("blacklist add rejected by storage")?;
        ack.await.context("storage change listener went away")?;
        Ok(())
    }

    pub async fn remove(&self, company: &str) -> Result<()> {
        let ack = self.register_waiter();
        self.channel
            .request(StorageMutation::BlacklistRemove {
                company: company.to_string(),
            })
            .await
            .context("blacklist remove rejected by storage")?;
        ack.await.context("storage change listener went away")?;
        Ok(())
    }

    pub fn is_blacklisted(&self, company: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|e| companies_match(&e.company, company))
    }

    pub fn find(&self, company: &str) -> Option<BlacklistEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|e| companies_match(&e.company, company))
            .cloned()
    }

    pub fn entries(&self) -> Vec<BlacklistEntry> {
        let mut entries = self.entries.lock().unwrap().clone();
        entries.sort_by(|a, b| a.company.to_lowercase().cmp(&b.company.to_lowercase()));
        entries
    }

    fn register_waiter(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().push(tx);
        rx
    }

    async fn reload(&self) -> Result<()> {
        let fresh = load_entries(self.channel.as_ref()).await?;

        let events = {
            let mut entries = self.entries.lock().unwrap();
            let mut events = Vec::new();
            for old in entries.iter() {
                if !fresh.iter().any(|e| e.company == old.company) {
                    events.push(BlacklistEvent::Removed {
                        company: old.company.clone(),
                    });
                }
            }
            for new in fresh.iter() {
                if !entries.iter().any(|e| e.company == new.company) {
                    events.push(BlacklistEvent::Added(new.clone()));
                }
            }
            *entries = fresh;
            events
        };

        for event in &events {
            self.subscribers.notify(event);
        }
        Ok(())
    }

    fn drain_waiters(&self) {
        for waiter in self.waiters.lock().unwrap().drain(..) {
            let _ = waiter.send(());
        }
    }
}

async fn listen(weak: Weak<BlacklistManager>, mut rx: broadcast::Receiver<Vec<String>>) {
    loop {
        match rx.recv().await {
            Ok(keys) => {
                if !keys.iter().any(|k| k == BLACKLIST_KEY) {
                    continue;
                }
                let Some(manager) = weak.upgrade() else { break };
                if let Err(e) = manager.reload().await {
                    tracing::warn!(error = %e, "blacklist reload after storage change failed");
                }
                // Resolve pending mutations even if the reload failed; callers
                // re-read authoritative state anyway.
                manager.drain_waiters();
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "blacklist change stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn load_entries(channel: &dyn StorageChannel) -> Result<Vec<BlacklistEntry>> {
    match channel.get(BLACKLIST_KEY).await? {
        Some(value) => {
            serde_json::from_value(value).context("unexpected shape for stored blacklist")
        }
        None => Ok(Vec::new()),
    }
}

/// Company names on job boards are messy ("Acme", "Acme Inc.", "ACME, Inc").
/// Exact match on the normalized form first, then a conservative fuzzy
/// fallback.
pub fn companies_match(a: &str, b: &str) -> bool {
    let na = normalize_company(a);
    let nb = normalize_company(b);
    if na.is_empty() || nb.is_empty() {
        return false;
    }
    if na == nb {
        return true;
    }
    strsim::jaro_winkler(&na, &nb) >= 0.93
}

fn normalize_company(name: &str) -> String {
    const SUFFIXES: &[&str] = &[
        "inc",
        "llc",
        "ltd",
        "gmbh",
        "co",
        "corp",
        "corporation",
        "limited",
        "ag",
        "sa",
    ];

    let lowered: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let words: Vec<&str> = lowered.split_whitespace().collect();
    let mut end = words.len();
    while end > 1 && SUFFIXES.contains(&words[end - 1]) {
        end -= 1;
    }
    words[..end].join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    #[test]
    fn test_companies_match_normalization() {
        assert!(companies_match("Acme", "ACME"));
        assert!(companies_match("Acme Inc.", "Acme"));
        assert!(companies_match("Acme, Inc", "Acme Inc."));
        assert!(companies_match("Initech GmbH", "initech"));
        assert!(companies_match("Weyland-Yutani", "Weyland Yutani Corp"));
        assert!(!companies_match("Acme", "Globex"));
        assert!(!companies_match("", "Acme"));
    }

    #[test]
    fn test_companies_match_fuzzy_fallback() {
        // A duplicated letter still matches; unrelated names do not.
        assert!(companies_match("Hoooli Inc", "Hooli"));
        assert!(!companies_match("Cyberdyne", "Tyrell"));
    }

    #[tokio::test]
    async fn test_add_resolves_and_marks_blacklisted() {
        let channel: Arc<dyn StorageChannel> = Arc::new(SqliteStorage::in_memory().unwrap());
        let manager = BlacklistManager::new(channel).await.unwrap();

        assert!(!manager.is_blacklisted("Acme"));
        manager.add("Acme", "bad reviews", "").await.unwrap();
        assert!(manager.is_blacklisted("Acme"));
        assert!(manager.is_blacklisted("Acme Inc."));

        let entry = manager.find("Acme").unwrap();
        assert_eq!(entry.reason, "bad reviews");
    }

    #[tokio::test]
    async fn test_remove_emits_removed_event() {
        let channel: Arc<dyn StorageChannel> = Arc::new(SqliteStorage::in_memory().unwrap());
        let manager = BlacklistManager::new(channel).await.unwrap();
        manager.add("Acme", "", "").await.unwrap();

        let removed = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&removed);
        let _sub = manager.subscribe(move |event| {
            if let BlacklistEvent::Removed { company } = event {
                r.lock().unwrap().push(company.clone());
            }
        });

        manager.remove("Acme").await.unwrap();
        assert!(!manager.is_blacklisted("Acme"));
        assert_eq!(*removed.lock().unwrap(), vec!["Acme"]);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_all_resolve() {
        let channel: Arc<dyn StorageChannel> = Arc::new(SqliteStorage::in_memory().unwrap());
        let manager = BlacklistManager::new(channel).await.unwrap();

        let a = manager.add("Acme", "", "");
        let b = manager.add("Globex", "", "");
        let (ra, rb) = tokio::join!(a, b);
        ra.unwrap();
        rb.unwrap();

        assert!(manager.is_blacklisted("Acme"));
        assert!(manager.is_blacklisted("Globex"));
        assert_eq!(manager.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_initial_load_sees_existing_entries() {
        let storage = Arc::new(SqliteStorage::in_memory().unwrap());
        storage
            .request(StorageMutation::BlacklistAdd(BlacklistEntry::new(
                "Preexisting", "", "",
            )))
            .await
            .unwrap();

        let manager = BlacklistManager::new(storage).await.unwrap();
        assert!(manager.is_blacklisted("Preexisting"));
    }
}
