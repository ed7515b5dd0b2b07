//! Listing processor: the retrying front door to the state manager. A
//! transient enqueue failure is retried a few times with a fixed delay;
//! "already processing" counts as success since the work is underway either
//! way. Also reacts to blacklist removals by re-running the affected jobs.

use std::sync::Arc;
use std::time::Duration;

use crate::blacklist::{BlacklistEvent, BlacklistManager};
use crate::events::Subscription;
use crate::models::JobRecord;
use crate::state::{JobStateManager, StateError};

pub const PROCESS_ATTEMPTS: u32 = 3;
pub const RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct ListingProcessor {
    states: Arc<JobStateManager>,
    attempts: u32,
    retry_delay: Duration,
}

impl ListingProcessor {
    pub fn new(states: Arc<JobStateManager>) -> Arc<Self> {
        Self::with_retry(states, PROCESS_ATTEMPTS, RETRY_DELAY)
    }

    pub fn with_retry(
        states: Arc<JobStateManager>,
        attempts: u32,
        retry_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            states,
            attempts,
            retry_delay,
        })
    }

    /// Routes one scraped listing, retrying transient failures. After the
    /// last attempt the job is marked failed so it is visible rather than
    /// silently dropped.
    pub async fn process(&self, record: JobRecord) {
        let job_id = record.job_id.clone();
        let mut last_error = String::new();

        for attempt in 1..=self.attempts {
            match self.states.process_record(record.clone()) {
                Ok(()) => return,
                Err(StateError::AlreadyProcessing(_)) => return,
                Err(err @ StateError::IncompleteRecord(_)) => {
                    // The listing may still be hydrating; give it a beat.
                    last_error = err.to_string();
                    tracing::debug!(job_id = %job_id, attempt, "listing not ready, retrying");
                }
            }
            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        self.states.fail(&job_id, &last_error);
    }

    pub async fn process_all(&self, records: Vec<JobRecord>) {
        for record in records {
            self.process(record).await;
        }
    }

    /// Wires blacklist removals to reprocessing: when a company comes off the
    /// list, its blacklisted jobs go back through classification. Keep the
    /// returned subscription alive for as long as the wiring should hold.
    pub fn watch_blacklist(self: &Arc<Self>, blacklist: &BlacklistManager) -> Subscription {
        let weak = Arc::downgrade(self);
        blacklist.subscribe(move |event| {
            if let BlacklistEvent::Removed { company } = event {
                let Some(processor) = weak.upgrade() else { return };
                let company = company.clone();
                tokio::spawn(async move {
                    processor.reprocess_company(&company).await;
                });
            }
        })
    }

    async fn reprocess_company(&self, company: &str) {
        let records = self.states.reset_company(company);
        if records.is_empty() {
            return;
        }
        tracing::info!(company, count = records.len(), "reprocessing after blacklist removal");
        for record in records {
            self.process(record).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::FilterCache;
    use crate::filter::{FilterError, FilterService, FilterTransport};
    use crate::history::HistoryManager;
    use crate::models::{
        CompanyRating, FilterResult, FilterStatus, JobDetailedRecord, JobPhase,
    };
    use crate::storage::{SqliteStorage, StorageChannel};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct FakeTransport {
        batch_responses: Mutex<VecDeque<Result<Vec<FilterResult>, FilterError>>>,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                batch_responses: Mutex::new(VecDeque::new()),
            })
        }

        fn push_batch(&self, response: Result<Vec<FilterResult>, FilterError>) {
            self.batch_responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl FilterTransport for FakeTransport {
        async fn batch_preliminary(
            &self,
            jobs: &[JobRecord],
        ) -> Result<Vec<FilterResult>, FilterError> {
            self.batch_responses.lock().unwrap().pop_front().unwrap_or_else(|| {
                Ok(jobs
                    .iter()
                    .map(|_| FilterResult::with_status(FilterStatus::LikelyMatch, vec![]))
                    .collect())
            })
        }

        async fn detailed(&self, _job: &JobDetailedRecord) -> Result<FilterResult, FilterError> {
            Err(FilterError::Transport("unused".to_string()))
        }
    }

    struct Fixture {
        transport: Arc<FakeTransport>,
        blacklist: Arc<BlacklistManager>,
        states: Arc<JobStateManager>,
        processor: Arc<ListingProcessor>,
    }

    async fn fixture(batch_size: usize) -> Fixture {
        let channel: Arc<dyn StorageChannel> = Arc::new(SqliteStorage::in_memory().unwrap());
        let transport = FakeTransport::new();
        let blacklist = BlacklistManager::new(Arc::clone(&channel)).await.unwrap();
        let history = HistoryManager::new(channel).await.unwrap();
        let states = JobStateManager::with_timing(
            Arc::new(FilterService::new(transport.clone() as Arc<dyn FilterTransport>)),
            Arc::clone(&blacklist),
            history,
            Arc::new(FilterCache::new()),
            Duration::from_millis(1000),
            batch_size,
        );
        let processor =
            ListingProcessor::with_retry(Arc::clone(&states), 3, Duration::from_millis(500));
        Fixture {
            transport,
            blacklist,
            states,
            processor,
        }
    }

    fn record(id: &str, company: &str) -> JobRecord {
        JobRecord {
            job_id: id.to_string(),
            title: format!("Engineer {}", id),
            company: company.to_string(),
            location: "Remote".to_string(),
            rating: CompanyRating::invalid(),
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_enqueues_on_first_attempt() {
        let fx = fixture(1).await;
        fx.processor.process(record("a", "Acme")).await;
        settle().await;
        assert_eq!(fx.states.get("a").unwrap().phase, JobPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_is_success_equivalent() {
        let fx = fixture(6).await;
        fx.processor.process(record("a", "Acme")).await;
        // Second call returns quickly instead of burning retries.
        fx.processor.process(record("a", "Acme")).await;
        assert_eq!(fx.states.get("a").unwrap().phase, JobPhase::Filtering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_mark_failed() {
        let fx = fixture(6).await;
        let mut rec = record("a", "Acme");
        rec.title = String::new();

        let processor = Arc::clone(&fx.processor);
        let handle = tokio::spawn(async move { processor.process(rec).await });
        settle().await;
        // Two retry sleeps of 500ms each.
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        tokio::time::advance(Duration::from_millis(501)).await;
        settle().await;
        handle.await.unwrap();

        let state = fx.states.get("a").unwrap();
        assert_eq!(state.phase, JobPhase::Error);
        assert!(state.tooltip.contains("no usable title"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blacklist_removal_triggers_reprocess() {
        let fx = fixture(1).await;
        fx.blacklist.add("Acme", "", "").await.unwrap();
        let _wiring = fx.processor.watch_blacklist(&fx.blacklist);

        fx.processor.process(record("a", "Acme")).await;
        settle().await;
        assert_eq!(fx.states.get("a").unwrap().phase, JobPhase::Blacklisted);

        fx.transport.push_batch(Ok(vec![FilterResult::with_status(
            FilterStatus::LikelyMatch,
            vec![],
        )]));
        fx.blacklist.remove("Acme").await.unwrap();
        settle().await;

        assert_eq!(fx.states.get("a").unwrap().phase, JobPhase::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_subscription_stops_reprocessing() {
        let fx = fixture(1).await;
        fx.blacklist.add("Acme", "", "").await.unwrap();
        {
            let _wiring = fx.processor.watch_blacklist(&fx.blacklist);
        }

        fx.processor.process(record("a", "Acme")).await;
        settle().await;
        fx.blacklist.remove("Acme").await.unwrap();
        settle().await;

        // Wiring was dropped, so the job stays blacklisted.
        assert_eq!(fx.states.get("a").unwrap().phase, JobPhase::Blacklisted);
    }
}
