//! Job state manager: the single source of truth for per-job lifecycle.
//!
//! Listings route through blacklist, history and cache checks before they are
//! queued for classification. Queued jobs are flushed as one batch when the
//! debounce window closes or the batch cap is hit, whichever comes first.
//! Updates are last-write-wins; a cache hit bypasses the processing guards
//! entirely.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::blacklist::{BlacklistManager, companies_match};
use crate::cache::FilterCache;
use crate::events::{Subscribers, Subscription};
use crate::filter::FilterService;
use crate::history::HistoryManager;
use crate::models::{
    FilterResult, FilterStatus, HistoryEntry, JobDetailedRecord, JobPhase, JobRecord, JobState,
};

/// Quiet period after the last enqueue before a partial batch is flushed.
pub const BATCH_DEBOUNCE: Duration = Duration::from_millis(1000);
/// A full batch is flushed immediately without waiting out the debounce.
pub const MAX_BATCH_SIZE: usize = 6;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("job '{0}' is already being processed")]
    AlreadyProcessing(String),
    #[error("listing '{0}' has no usable title or company yet")]
    IncompleteRecord(String),
}

#[derive(Debug, Clone)]
pub struct StateEvent {
    pub job_id: String,
    pub state: JobState,
}

struct StateInner {
    jobs: HashMap<String, JobState>,
    pending: VecDeque<JobRecord>,
    pending_set: HashSet<String>,
    in_flight: HashSet<String>,
    flush_timer: Option<JoinHandle<()>>,
}

pub struct JobStateManager {
    filter: Arc<FilterService>,
    blacklist: Arc<BlacklistManager>,
    history: Arc<HistoryManager>,
    cache: Arc<FilterCache>,
    inner: Mutex<StateInner>,
    subscribers: Subscribers<StateEvent>,
    debounce: Duration,
    batch_size: usize,
}

impl JobStateManager {
    pub fn new(
        filter: Arc<FilterService>,
        blacklist: Arc<BlacklistManager>,
        history: Arc<HistoryManager>,
        cache: Arc<FilterCache>,
    ) -> Arc<Self> {
        Self::with_timing(filter, blacklist, history, cache, BATCH_DEBOUNCE, MAX_BATCH_SIZE)
    }

    pub fn with_timing(
        filter: Arc<FilterService>,
        blacklist: Arc<BlacklistManager>,
        history: Arc<HistoryManager>,
        cache: Arc<FilterCache>,
        debounce: Duration,
        batch_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            filter,
            blacklist,
            history,
            cache,
            inner: Mutex::new(StateInner {
                jobs: HashMap::new(),
                pending: VecDeque::new(),
                pending_set: HashSet::new(),
                in_flight: HashSet::new(),
                flush_timer: None,
            }),
            subscribers: Subscribers::new(),
            debounce,
            batch_size,
        })
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&StateEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    pub fn get(&self, job_id: &str) -> Option<JobState> {
        self.inner.lock().unwrap().jobs.get(job_id).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, JobState> {
        self.inner.lock().unwrap().jobs.clone()
    }

    /// True when no job is waiting on classification.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pending.is_empty() && inner.in_flight.is_empty()
    }

    /// Routes a freshly scraped listing. Blacklisted companies and jobs the
    /// user has already decided about never reach the backend; a fresh cache
    /// entry resolves the job without queueing it.
    pub fn process_record(self: &Arc<Self>, record: JobRecord) -> Result<(), StateError> {
        if record.title.trim().is_empty() || record.company.trim().is_empty() {
            return Err(StateError::IncompleteRecord(record.job_id));
        }

        if self.blacklist.is_blacklisted(&record.company) {
            self.mark_blacklisted(&record);
            return Ok(());
        }

        if let Some(entry) = self.history.get(&record.job_id)
            && entry.application_status.is_decided()
        {
            self.complete_from_history(&record, &entry);
            return Ok(());
        }

        if let Some(result) = self.cache.get(&record.job_id) {
            tracing::debug!(job_id = %record.job_id, "cache hit, skipping classification");
            self.update_from_cache(&record, result);
            return Ok(());
        }

        self.add_to_batch(record)
    }

    /// Queues a job for the next preliminary batch. Rejected while the same
    /// job is already queued or in flight.
    pub fn add_to_batch(self: &Arc<Self>, record: JobRecord) -> Result<(), StateError> {
        let job_id = record.job_id.clone();
        let (event, ready) = {
            let mut inner = self.inner.lock().unwrap();

            let busy = inner.pending_set.contains(&job_id)
                || inner.in_flight.contains(&job_id)
                || inner
                    .jobs
                    .get(&job_id)
                    .is_some_and(|s| s.phase == JobPhase::Filtering);
            if busy {
                return Err(StateError::AlreadyProcessing(job_id));
            }

            let state = Self::apply(&mut inner.jobs, &job_id, |s| {
                s.phase = JobPhase::Filtering;
                s.record = Some(record.clone());
                s.result = None;
                s.tooltip = "Checking...".to_string();
            });

            inner.pending_set.insert(job_id.clone());
            inner.pending.push_back(record);

            let ready = if inner.pending.len() >= self.batch_size {
                Some(Self::drain(&mut inner, self.batch_size))
            } else {
                // Every enqueue restarts the quiet period.
                self.arm_timer(&mut inner);
                None
            };
            (StateEvent { job_id, state }, ready)
        };

        self.subscribers.notify(&event);
        if let Some(batch) = ready {
            self.spawn_dispatch(batch);
        }
        Ok(())
    }

    /// Flushes whatever is pending right now. If more jobs than one batch are
    /// queued, the remainder is re-armed on a fresh debounce window.
    pub fn flush_now(self: &Arc<Self>) {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(timer) = inner.flush_timer.take() {
                timer.abort();
            }
            let batch = Self::drain(&mut inner, self.batch_size);
            if !inner.pending.is_empty() {
                self.arm_timer(&mut inner);
            }
            batch
        };
        if !batch.is_empty() {
            self.spawn_dispatch(batch);
        }
    }

    /// Single-job detailed classification. On success the result also lands
    /// in the cache and the job's history entry.
    pub async fn handle_detailed(self: &Arc<Self>, job: JobDetailedRecord) -> Result<FilterResult> {
        let job_id = job.job.job_id.clone();
        {
            let mut inner = self.inner.lock().unwrap();
            let busy = inner.pending_set.contains(&job_id)
                || inner.in_flight.contains(&job_id)
                || inner
                    .jobs
                    .get(&job_id)
                    .is_some_and(|s| s.phase == JobPhase::Filtering);
            if busy {
                return Err(StateError::AlreadyProcessing(job_id).into());
            }
            inner.in_flight.insert(job_id.clone());
            let state = Self::apply(&mut inner.jobs, &job_id, |s| {
                s.phase = JobPhase::Filtering;
                s.record = Some(job.job.clone());
                s.tooltip = "Detailed check...".to_string();
            });
            drop(inner);
            self.subscribers.notify(&StateEvent {
                job_id: job_id.clone(),
                state,
            });
        }

        match self.filter.detailed(&job).await {
            Ok(result) => {
                self.complete_processing(&job_id, result.clone());
                self.history
                    .record_match_status(HistoryEntry::from_record(&job.job), result.status)
                    .await
                    .context("recording detailed result in history")?;
                Ok(result)
            }
            Err(err) => {
                self.fail(&job_id, &err.to_string());
                Err(err.into())
            }
        }
    }

    /// Final transition out of Filtering. Error-status results are shown but
    /// never cached.
    pub fn complete_processing(&self, job_id: &str, result: FilterResult) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(job_id);
            let state = Self::apply(&mut inner.jobs, job_id, |s| {
                s.phase = if result.status == FilterStatus::Error {
                    JobPhase::Error
                } else {
                    JobPhase::Complete
                };
                s.tooltip = result.reasons.join("; ");
                s.result = Some(result.clone());
            });
            StateEvent {
                job_id: job_id.to_string(),
                state,
            }
        };

        if result.status != FilterStatus::Error {
            self.cache.set(job_id, &result);
        }
        self.subscribers.notify(&event);
    }

    pub fn fail(&self, job_id: &str, message: &str) {
        tracing::warn!(job_id = %job_id, message, "classification failed");
        let event = {
            let mut inner = self.inner.lock().unwrap();
            inner.in_flight.remove(job_id);
            if inner.pending_set.remove(job_id) {
                inner.pending.retain(|r| r.job_id != job_id);
            }
            let state = Self::apply(&mut inner.jobs, job_id, |s| {
                s.phase = JobPhase::Error;
                s.tooltip = message.to_string();
                s.result = Some(FilterResult::error(message));
            });
            StateEvent {
                job_id: job_id.to_string(),
                state,
            }
        };
        self.subscribers.notify(&event);
    }

    /// Applies a cached result directly, bypassing the processing guards.
    pub fn update_from_cache(&self, record: &JobRecord, result: FilterResult) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::apply(&mut inner.jobs, &record.job_id, |s| {
                s.phase = if result.status == FilterStatus::Error {
                    JobPhase::Error
                } else {
                    JobPhase::Complete
                };
                s.record = Some(record.clone());
                s.tooltip = result.reasons.join("; ");
                s.result = Some(result.clone());
            });
            StateEvent {
                job_id: record.job_id.clone(),
                state,
            }
        };
        self.subscribers.notify(&event);
    }

    pub fn mark_blacklisted(&self, record: &JobRecord) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            if inner.pending_set.remove(&record.job_id) {
                let job_id = record.job_id.clone();
                inner.pending.retain(|r| r.job_id != job_id);
            }
            let state = Self::apply(&mut inner.jobs, &record.job_id, |s| {
                s.phase = JobPhase::Blacklisted;
                s.record = Some(record.clone());
                s.result = None;
                s.tooltip = format!("Company blacklisted: {}", record.company);
            });
            StateEvent {
                job_id: record.job_id.clone(),
                state,
            }
        };
        self.subscribers.notify(&event);
    }

    fn complete_from_history(&self, record: &JobRecord, entry: &HistoryEntry) {
        let event = {
            let mut inner = self.inner.lock().unwrap();
            let state = Self::apply(&mut inner.jobs, &record.job_id, |s| {
                s.phase = JobPhase::Complete;
                s.record = Some(record.clone());
                s.result = Some(FilterResult::with_status(entry.match_status, Vec::new()));
                s.tooltip = format!("Already {}", entry.application_status.as_str());
            });
            StateEvent {
                job_id: record.job_id.clone(),
                state,
            }
        };
        self.subscribers.notify(&event);
    }

    /// Moves every blacklisted job of `company` back to Initial and returns
    /// the records so the caller can reprocess them.
    pub fn reset_company(&self, company: &str) -> Vec<JobRecord> {
        let (events, records) = {
            let mut inner = self.inner.lock().unwrap();
            let ids: Vec<String> = inner
                .jobs
                .iter()
                .filter(|(_, s)| {
                    s.phase == JobPhase::Blacklisted
                        && s.record
                            .as_ref()
                            .is_some_and(|r| companies_match(&r.company, company))
                })
                .map(|(id, _)| id.clone())
                .collect();

            let mut events = Vec::new();
            let mut records = Vec::new();
            for id in ids {
                let state = Self::apply(&mut inner.jobs, &id, |s| {
                    s.phase = JobPhase::Initial;
                    s.result = None;
                    s.tooltip = String::new();
                });
                if let Some(record) = state.record.clone() {
                    records.push(record);
                }
                events.push(StateEvent { job_id: id, state });
            }
            (events, records)
        };

        for event in &events {
            self.subscribers.notify(event);
        }
        records
    }

    fn apply<F>(jobs: &mut HashMap<String, JobState>, job_id: &str, mutate: F) -> JobState
    where
        F: FnOnce(&mut JobState),
    {
        let state = jobs.entry(job_id.to_string()).or_default();
        mutate(state);
        state.updated_at = Utc::now();
        state.clone()
    }

    fn drain(inner: &mut StateInner, cap: usize) -> Vec<JobRecord> {
        let take = inner.pending.len().min(cap);
        let mut batch = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(record) = inner.pending.pop_front() {
                inner.pending_set.remove(&record.job_id);
                inner.in_flight.insert(record.job_id.clone());
                batch.push(record);
            }
        }
        batch
    }

    // The timer task only covers the quiet-period sleep. The dispatch itself
    // runs on an independent task so an aborted timer can never cancel a
    // request already on the wire.
    fn arm_timer(self: &Arc<Self>, inner: &mut StateInner) {
        if let Some(timer) = inner.flush_timer.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        let debounce = self.debounce;
        inner.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(manager) = weak.upgrade() {
                manager.flush_now();
            }
        }));
    }

    fn spawn_dispatch(self: &Arc<Self>, batch: Vec<JobRecord>) {
        tracing::debug!(size = batch.len(), "dispatching preliminary batch");
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.dispatch(batch).await;
        });
    }

    async fn dispatch(self: Arc<Self>, batch: Vec<JobRecord>) {
        match self.filter.batch_preliminary(&batch).await {
            Ok(results) => {
                for (job, result) in batch.iter().zip(results) {
                    self.complete_processing(&job.job_id, result);
                }
            }
            Err(err) => {
                let message = err.to_string();
                for job in &batch {
                    self.fail(&job.job_id, &message);
                }
            }
        }
    }
}
