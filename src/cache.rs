//! Time-expiring memoization of classification results, keyed by job id.
//! Eviction is lazy (on read); there is no background sweep and no size
//! bound. A single registered listener mirrors writes into persisted
//! storage for cross-session reuse.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::FilterResult;

/// Cached results expire after seven days.
pub const CACHE_EXPIRY_SECS: i64 = 604_800;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub result: FilterResult,
    pub stored_at: DateTime<Utc>,
}

type UpdateListener = Box<dyn Fn(&str, &FilterResult) + Send + Sync>;

pub struct FilterCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    listener: Mutex<Option<UpdateListener>>,
}

impl FilterCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    /// Returns the cached result if present and fresh; a stale entry is
    /// evicted and reported as absent.
    pub fn get(&self, job_id: &str) -> Option<FilterResult> {
        self.get_at(job_id, Utc::now())
    }

    fn get_at(&self, job_id: &str, now: DateTime<Utc>) -> Option<FilterResult> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(job_id)?;
        if now.signed_duration_since(entry.stored_at) >= Duration::seconds(CACHE_EXPIRY_SECS) {
            entries.remove(job_id);
            return None;
        }
        Some(entry.result.clone())
    }

    /// Unconditional overwrite, timestamped at write time. Notifies the
    /// update listener after the entry is stored.
    pub fn set(&self, job_id: &str, result: &FilterResult) {
        self.set_at(job_id, result, Utc::now());
        if let Some(listener) = self.listener.lock().unwrap().as_ref() {
            listener(job_id, result);
        }
    }

    fn set_at(&self, job_id: &str, result: &FilterResult, now: DateTime<Utc>) {
        self.entries.lock().unwrap().insert(
            job_id.to_string(),
            CacheEntry {
                result: result.clone(),
                stored_at: now,
            },
        );
    }

    /// Registers the single mirror listener, replacing any previous one.
    pub fn set_listener<F>(&self, listener: F)
    where
        F: Fn(&str, &FilterResult) + Send + Sync + 'static,
    {
        *self.listener.lock().unwrap() = Some(Box::new(listener));
    }

    /// Seeds the cache from persisted entries, keeping their original
    /// timestamps and without notifying the listener.
    pub fn load(&self, entries: HashMap<String, CacheEntry>) {
        self.entries.lock().unwrap().extend(entries);
    }
}

impl Default for FilterCache {
    fn default() -> Self {
        Self::new()
    }
}
