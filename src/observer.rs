//! Page observer: turns a noisy stream of DOM mutation batches into widely
//! spaced rescan signals. Only mutations whose added markup looks like job
//! content count; anything else (spinners, class toggles) is dropped before
//! it can restart the quiet window.
//!
//! Also hosts the rating waiter: rating widgets hydrate late, so extraction
//! parks a bounded async wait per job that the mutation handler resolves.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::extract::{extract_listing, looks_like_job_content, parse_rating};
use crate::models::CompanyRating;

/// Quiet window after the last relevant mutation before a rescan fires.
pub const RESCAN_DEBOUNCE: Duration = Duration::from_millis(500);
/// Ceiling on how long extraction waits for a rating widget to hydrate.
pub const RATING_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Default)]
pub struct MutationBatch {
    /// Outer HTML of nodes added since the previous snapshot.
    pub added: Vec<String>,
    /// Outer HTML of nodes that disappeared.
    pub removed: Vec<String>,
}

impl MutationBatch {
    /// Added-node markup decides relevance; removals alone never trigger a
    /// rescan (the listing is gone, there is nothing new to classify).
    pub fn is_relevant(&self) -> bool {
        self.added.iter().any(|html| looks_like_job_content(html))
    }
}

pub struct PageObserver {
    debounce: Duration,
}

impl PageObserver {
    pub fn new() -> Self {
        Self::with_debounce(RESCAN_DEBOUNCE)
    }

    pub fn with_debounce(debounce: Duration) -> Self {
        Self { debounce }
    }

    /// Consumes mutation batches until the stream closes, emitting one rescan
    /// signal per quiet window. A deadline armed when the stream closes still
    /// fires once so the final mutations are not lost. Every batch, relevant
    /// or not, is also scanned for late-hydrating rating widgets.
    pub async fn run(
        &self,
        mut mutations: mpsc::Receiver<MutationBatch>,
        rescans: mpsc::Sender<()>,
        ratings: Arc<RatingWaiter>,
    ) {
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                batch = mutations.recv() => {
                    match batch {
                        Some(batch) => {
                            resolve_ratings(&batch, &ratings);
                            if batch.is_relevant() {
                                tracing::trace!(added = batch.added.len(), "relevant mutation, window restarted");
                                deadline = Some(Instant::now() + self.debounce);
                            }
                        }
                        None => break,
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    deadline = None;
                    if rescans.send(()).await.is_err() {
                        return;
                    }
                }
            }
        }

        if deadline.is_some() {
            let _ = rescans.send(()).await;
        }
    }
}

impl Default for PageObserver {
    fn default() -> Self {
        Self::new()
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// A rating widget usually hydrates inside an already-seen listing, so the
/// mutation shows the whole container again. Re-extract it and wake whoever
/// is waiting on that job's rating.
fn resolve_ratings(batch: &MutationBatch, ratings: &RatingWaiter) {
    for html in &batch.added {
        if let Some(rating) = parse_rating(html)
            && let Some(record) = extract_listing(html)
        {
            ratings.resolve(&record.job_id, rating);
        }
    }
}

/// Parks waiters for rating widgets that have not hydrated yet. `resolve`
/// wakes every waiter for the job; a waiter that times out gets the invalid
/// sentinel rather than an error.
pub struct RatingWaiter {
    waiting: Mutex<HashMap<String, Vec<oneshot::Sender<CompanyRating>>>>,
}

impl RatingWaiter {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn resolve(&self, job_id: &str, rating: CompanyRating) {
        let senders = self.waiting.lock().unwrap().remove(job_id);
        if let Some(senders) = senders {
            for tx in senders {
                let _ = tx.send(rating);
            }
        }
    }

    pub async fn wait(&self, job_id: &str, ceiling: Duration) -> CompanyRating {
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.waiting
                .lock()
                .unwrap()
                .entry(job_id.to_string())
                .or_default()
                .push(tx);
            rx
        };

        match tokio::time::timeout(ceiling, rx).await {
            Ok(Ok(rating)) => rating,
            _ => {
                self.prune(job_id);
                CompanyRating::invalid()
            }
        }
    }

    fn prune(&self, job_id: &str) {
        let mut waiting = self.waiting.lock().unwrap();
        if let Some(senders) = waiting.get_mut(job_id) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                waiting.remove(job_id);
            }
        }
    }

    #[cfg(test)]
    fn waiting_count(&self, job_id: &str) -> usize {
        self.waiting
            .lock()
            .unwrap()
            .get(job_id)
            .map_or(0, |v| v.len())
    }
}

impl Default for RatingWaiter {
    fn default() -> Self {
        Self::new()
    }
}
