//! Persisted record of jobs already seen or applied to. Same channel/ack
//! pattern as the blacklist manager: the authoritative write happens behind
//! the storage channel and the change notification is the completion signal.

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, oneshot};

use crate::events::{Subscribers, Subscription};
use crate::models::{ApplicationStatus, FilterStatus, HistoryEntry};
use crate::storage::{JOB_HISTORY_KEY, StorageChannel, StorageMutation};

#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Updated(HistoryEntry),
    Removed { job_id: String },
}

pub struct HistoryManager {
    channel: Arc<dyn StorageChannel>,
    entries: Mutex<HashMap<String, HistoryEntry>>,
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
    subscribers: Subscribers<HistoryEvent>,
}

impl HistoryManager {
    pub async fn new(channel: Arc<dyn StorageChannel>) -> Result<Arc<Self>> {
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
        F: Fn(&HistoryEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    pub fn get(&self, job_id: &str) -> Option<HistoryEntry> {
        self.entries.lock().unwrap().get(job_id).cloned()
    }

    pub fn all(&self) -> Vec<HistoryEntry> {
        let mut entries: Vec<HistoryEntry> =
            self.entries.lock().unwrap().values().cloned().collect();
        entries.sort_by(|a, b| b.date_updated.cmp(&a.date_updated));
        entries
    }

    pub async fn upsert(&self, mut entry: HistoryEntry) -> Result<()> {
        entry.date_updated = Utc::now();
        let ack = self.register_waiter();
        self.channel
            .request(StorageMutation::HistoryUpsert(entry))
            .await
            .context("history upsert rejected by storage")?;
        ack.await.context("storage change listener went away")?;
        Ok(())
    }

    /// Records the match status for a job, creating the entry if needed.
    pub async fn record_match_status(
        &self,
        entry_template: HistoryEntry,
        status: FilterStatus,
    ) -> Result<()> {
        let mut entry = self
            .get(&entry_template.job_id)
            .unwrap_or(entry_template);
        entry.match_status = status;
        self.upsert(entry).await
    }

    /// Moves a job's application status, stamping the applied/rejected
    /// timestamps on the corresponding transitions.
    pub async fn set_application_status(
        &self,
        job_id: &str,
        status: ApplicationStatus,
        note: Option<&str>,
    ) -> Result<()> {
        let mut entry = self
            .get(job_id)
            .ok_or_else(|| anyhow!("no history entry for job '{}'", job_id))?;

        entry.application_status = status;
        match status {
            ApplicationStatus::Applied if entry.date_applied.is_none() => {
                entry.date_applied = Some(Utc::now());
            }
            ApplicationStatus::Rejected if entry.date_rejected.is_none() => {
                entry.date_rejected = Some(Utc::now());
            }
            _ => {}
        }
        if let Some(note) = note {
            entry.user_notes = note.to_string();
        }
        self.upsert(entry).await
    }

    pub async fn set_notes(&self, job_id: &str, notes: &str) -> Result<()> {
        let mut entry = self
            .get(job_id)
            .ok_or_else(|| anyhow!("no history entry for job '{}'", job_id))?;
        entry.user_notes = notes.to_string();
        self.upsert(entry).await
    }

    pub async fn remove(&self, job_id: &str) -> Result<()> {
        let ack = self.register_waiter();
        self.channel
            .request(StorageMutation::HistoryRemove {
                job_id: job_id.to_string(),
            })
            .await
            .context("history remove rejected by storage")?;
        ack.await.context("storage change listener went away")?;
        Ok(())
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
            for job_id in entries.keys() {
                if !fresh.contains_key(job_id) {
                    events.push(HistoryEvent::Removed {
                        job_id: job_id.clone(),
                    });
                }
            }
            for (job_id, entry) in fresh.iter() {
                let changed = match entries.get(job_id) {
                    Some(old) => old.date_updated != entry.date_updated,
                    None => true,
                };
                if changed {
                    events.push(HistoryEvent::Updated(entry.clone()));
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

async fn listen(weak: Weak<HistoryManager>, mut rx: broadcast::Receiver<Vec<String>>) {
    loop {
        match rx.recv().await {
            Ok(keys) => {
                if !keys.iter().any(|k| k == JOB_HISTORY_KEY) {
                    continue;
                }
                let Some(manager) = weak.upgrade() else { break };
                if let Err(e) = manager.reload().await {
                    tracing::warn!(error = %e, "history reload after storage change failed");
                }
                manager.drain_waiters();
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "history change stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn load_entries(channel: &dyn StorageChannel) -> Result<HashMap<String, HistoryEntry>> {
    let list: Vec<HistoryEntry> = match channel.get(JOB_HISTORY_KEY).await? {
        Some(value) => {
            serde_json::from_value(value).context("unexpected shape for stored job history")?
        }
        None => Vec::new(),
    };
    Ok(list.into_iter().map(|e| (e.job_id.clone(), e)).collect())
}
