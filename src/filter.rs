//! Filter service: the request/response abstraction over the two
//! classification calls. Holds no state beyond its subscriber lists; the
//! transport is swappable so tests run against an in-memory fake.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

use crate::events::{Subscribers, Subscription};
use crate::models::{FilterResult, FilterStatus, JobDetailedRecord, JobRecord, now_ts};

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter transport failure: {0}")]
    Transport(String),
    #[error("backend returned {got} results for {want} jobs")]
    CountMismatch { want: usize, got: usize },
    #[error("malformed filter response: {0}")]
    Malformed(String),
}

impl FilterError {
    /// Malformed responses are data-integrity violations and must not be
    /// retried; transport failures may be.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FilterError::Transport(_))
    }
}

#[async_trait]
pub trait FilterTransport: Send + Sync {
    async fn batch_preliminary(&self, jobs: &[JobRecord]) -> Result<Vec<FilterResult>, FilterError>;
    async fn detailed(&self, job: &JobDetailedRecord) -> Result<FilterResult, FilterError>;
}

#[derive(Debug, Clone)]
pub struct FilterCompletion {
    pub job_id: String,
    pub result: FilterResult,
}

#[derive(Debug, Clone)]
pub struct FilterFailure {
    pub job_id: String,
    pub message: String,
}

pub struct FilterService {
    transport: Arc<dyn FilterTransport>,
    completions: Subscribers<FilterCompletion>,
    failures: Subscribers<FilterFailure>,
}

impl FilterService {
    pub fn new(transport: Arc<dyn FilterTransport>) -> Self {
        Self {
            transport,
            completions: Subscribers::new(),
            failures: Subscribers::new(),
        }
    }

    pub fn subscribe_completions<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&FilterCompletion) + Send + Sync + 'static,
    {
        self.completions.subscribe(handler)
    }

    pub fn subscribe_failures<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&FilterFailure) + Send + Sync + 'static,
    {
        self.failures.subscribe(handler)
    }

    /// Batched preliminary classification. Postcondition on success:
    /// `results.len() == jobs.len()` with positional correspondence. A count
    /// mismatch fails the whole batch, never individual items.
    pub async fn batch_preliminary(
        &self,
        jobs: &[JobRecord],
    ) -> Result<Vec<FilterResult>, FilterError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let results = match self.transport.batch_preliminary(jobs).await {
            Ok(results) => results,
            Err(err) => {
                self.notify_failure_all(jobs, &err);
                return Err(err);
            }
        };

        if results.len() != jobs.len() {
            let err = FilterError::CountMismatch {
                want: jobs.len(),
                got: results.len(),
            };
            tracing::error!(want = jobs.len(), got = results.len(), "preliminary result count mismatch");
            self.notify_failure_all(jobs, &err);
            return Err(err);
        }

        for (job, result) in jobs.iter().zip(results.iter()) {
            self.completions.notify(&FilterCompletion {
                job_id: job.job_id.clone(),
                result: result.clone(),
            });
        }
        Ok(results)
    }

    /// Detailed single-job classification with strict response validation.
    pub async fn detailed(&self, job: &JobDetailedRecord) -> Result<FilterResult, FilterError> {
        let job_id = job.job.job_id.clone();

        let result = match self.transport.detailed(job).await {
            Ok(result) => result,
            Err(err) => {
                self.failures.notify(&FilterFailure {
                    job_id,
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        if let Err(err) = validate_detailed(&result) {
            tracing::error!(job_id = %job_id, error = %err, "rejecting malformed detailed result");
            self.failures.notify(&FilterFailure {
                job_id,
                message: err.to_string(),
            });
            return Err(err);
        }

        self.completions.notify(&FilterCompletion {
            job_id,
            result: result.clone(),
        });
        Ok(result)
    }

    fn notify_failure_all(&self, jobs: &[JobRecord], err: &FilterError) {
        let message = err.to_string();
        for job in jobs {
            self.failures.notify(&FilterFailure {
                job_id: job.job_id.clone(),
                message: message.clone(),
            });
        }
    }
}

/// A well-formed detailed result carries a status, a match flag and a reasons
/// list (possibly empty). Anything else is rejected, never coerced.
pub fn validate_detailed(result: &FilterResult) -> Result<(), FilterError> {
    if result.is_match.is_none() {
        return Err(FilterError::Malformed(
            "detailed result is missing the match flag".to_string(),
        ));
    }
    Ok(())
}

// --- HTTP transport ---

pub struct HttpFilterTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFilterTransport {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDetailedResponse {
    status: Option<FilterStatus>,
    #[serde(rename = "match")]
    is_match: Option<bool>,
    reasons: Option<Vec<String>>,
    title_score: Option<f64>,
}

#[async_trait]
impl FilterTransport for HttpFilterTransport {
    async fn batch_preliminary(&self, jobs: &[JobRecord]) -> Result<Vec<FilterResult>, FilterError> {
        let url = format!("{}/api/preliminary-filter", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(jobs)
            .send()
            .await
            .map_err(|e| FilterError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FilterError::Transport(format!(
                "preliminary filter returned {}: {}",
                status, body
            )));
        }

        response
            .json::<Vec<FilterResult>>()
            .await
            .map_err(|e| FilterError::Malformed(e.to_string()))
    }

    async fn detailed(&self, job: &JobDetailedRecord) -> Result<FilterResult, FilterError> {
        let url = format!("{}/api/detailed-filter", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(job)
            .send()
            .await
            .map_err(|e| FilterError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FilterError::Transport(format!(
                "detailed filter returned {}: {}",
                status, body
            )));
        }

        let raw: RawDetailedResponse = response
            .json()
            .await
            .map_err(|e| FilterError::Malformed(e.to_string()))?;

        let status = raw
            .status
            .ok_or_else(|| FilterError::Malformed("detailed result is missing status".to_string()))?;
        let reasons = raw.reasons.ok_or_else(|| {
            FilterError::Malformed("detailed result is missing the reasons list".to_string())
        })?;

        Ok(FilterResult {
            status,
            reasons,
            is_match: raw.is_match,
            title_score: raw.title_score,
            timestamp: now_ts(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CompanyRating;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn record(id: &str) -> JobRecord {
        JobRecord {
            job_id: id.to_string(),
            title: format!("title {}", id),
            company: "Acme".to_string(),
            location: "Remote".to_string(),
            rating: CompanyRating::invalid(),
        }
    }

    fn detailed_record(id: &str) -> JobDetailedRecord {
        JobDetailedRecord {
            job: record(id),
            description: "desc".to_string(),
            url: None,
            about_company: String::new(),
            company_size: String::new(),
        }
    }

    struct FakeTransport {
        batch_responses: Mutex<VecDeque<Result<Vec<FilterResult>, FilterError>>>,
        detailed_responses: Mutex<VecDeque<Result<FilterResult, FilterError>>>,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                batch_responses: Mutex::new(VecDeque::new()),
                detailed_responses: Mutex::new(VecDeque::new()),
            }
        }

        fn push_batch(&self, response: Result<Vec<FilterResult>, FilterError>) {
            self.batch_responses.lock().unwrap().push_back(response);
        }

        fn push_detailed(&self, response: Result<FilterResult, FilterError>) {
            self.detailed_responses.lock().unwrap().push_back(response);
        }
    }

    #[async_trait]
    impl FilterTransport for FakeTransport {
        async fn batch_preliminary(
            &self,
            _jobs: &[JobRecord],
        ) -> Result<Vec<FilterResult>, FilterError> {
            self.batch_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FilterError::Transport("no scripted response".to_string())))
        }

        async fn detailed(&self, _job: &JobDetailedRecord) -> Result<FilterResult, FilterError> {
            self.detailed_responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(FilterError::Transport("no scripted response".to_string())))
        }
    }

    fn preliminary(status: FilterStatus) -> FilterResult {
        FilterResult::with_status(status, vec![])
    }

    #[tokio::test]
    async fn test_batch_success_notifies_positionally() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_batch(Ok(vec![
            preliminary(FilterStatus::LikelyMatch),
            preliminary(FilterStatus::NotLikely),
        ]));
        let service = FilterService::new(transport);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let _sub = service.subscribe_completions(move |c| {
            s.lock().unwrap().push((c.job_id.clone(), c.result.status));
        });

        let jobs = vec![record("a"), record("b")];
        let results = service.batch_preliminary(&jobs).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, FilterStatus::LikelyMatch);
        assert_eq!(results[1].status, FilterStatus::NotLikely);

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("a".to_string(), FilterStatus::LikelyMatch),
                ("b".to_string(), FilterStatus::NotLikely),
            ]
        );
    }

    #[tokio::test]
    async fn test_count_mismatch_fails_whole_batch() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_batch(Ok(vec![preliminary(FilterStatus::LikelyMatch)]));
        let service = FilterService::new(transport);

        let failed = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&failed);
        let _sub = service.subscribe_failures(move |e| {
            f.lock().unwrap().push(e.job_id.clone());
        });

        let jobs = vec![record("a"), record("b"), record("c")];
        let err = service.batch_preliminary(&jobs).await.unwrap_err();
        assert!(matches!(err, FilterError::CountMismatch { want: 3, got: 1 }));
        assert!(!err.is_retryable());

        let failed = failed.lock().unwrap();
        assert_eq!(*failed, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_transport_failure_notifies_every_id() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_batch(Err(FilterError::Transport("connection refused".to_string())));
        let service = FilterService::new(transport);

        let failed = Arc::new(Mutex::new(Vec::new()));
        let f = Arc::clone(&failed);
        let _sub = service.subscribe_failures(move |e| {
            f.lock().unwrap().push((e.job_id.clone(), e.message.clone()));
        });

        let jobs = vec![record("a"), record("b")];
        let err = service.batch_preliminary(&jobs).await.unwrap_err();
        assert!(err.is_retryable());

        let failed = failed.lock().unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed[0].1.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_empty_batch_short_circuits() {
        let service = FilterService::new(Arc::new(FakeTransport::new()));
        let results = service.batch_preliminary(&[]).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_detailed_missing_match_flag_rejected() {
        let transport = Arc::new(FakeTransport::new());
        // status present, reasons present (empty), match flag absent.
        transport.push_detailed(Ok(FilterResult::with_status(
            FilterStatus::ConfirmedMatch,
            vec![],
        )));
        let service = FilterService::new(transport);

        let err = service.detailed(&detailed_record("a")).await.unwrap_err();
        assert!(matches!(err, FilterError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_detailed_success_with_empty_reasons() {
        let transport = Arc::new(FakeTransport::new());
        let mut ok = FilterResult::with_status(FilterStatus::ConfirmedMatch, vec![]);
        ok.is_match = Some(true);
        transport.push_detailed(Ok(ok));
        let service = FilterService::new(transport);

        let result = service.detailed(&detailed_record("a")).await.unwrap();
        assert_eq!(result.status, FilterStatus::ConfirmedMatch);
        assert_eq!(result.is_match, Some(true));
        assert!(result.reasons.is_empty());
    }
}
