use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification outcome for a job, as produced by the filter backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStatus {
    Unknown,
    LikelyMatch,
    PossibleMatch,
    NotLikely,
    ConfirmedMatch,
    ConfirmedNoMatch,
    Error,
}

impl FilterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStatus::Unknown => "unknown",
            FilterStatus::LikelyMatch => "likely_match",
            FilterStatus::PossibleMatch => "possible_match",
            FilterStatus::NotLikely => "not_likely",
            FilterStatus::ConfirmedMatch => "confirmed_match",
            FilterStatus::ConfirmedNoMatch => "confirmed_no_match",
            FilterStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub status: FilterStatus,
    #[serde(default)]
    pub reasons: Vec<String>,
    /// Present on detailed results, absent on preliminary ones.
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub is_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_score: Option<f64>,
    #[serde(default = "now_ts")]
    pub timestamp: f64,
}

pub fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl FilterResult {
    pub fn error(reason: &str) -> Self {
        Self {
            status: FilterStatus::Error,
            reasons: vec![reason.to_string()],
            is_match: None,
            title_score: None,
            timestamp: now_ts(),
        }
    }

    pub fn with_status(status: FilterStatus, reasons: Vec<String>) -> Self {
        Self {
            status,
            reasons,
            is_match: None,
            title_score: None,
            timestamp: now_ts(),
        }
    }
}

/// Third-party rating widget data, when the host page embeds one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompanyRating {
    pub rating: f64,
    pub review_count: u32,
    pub is_valid: bool,
}

impl CompanyRating {
    /// Well-defined "unavailable" value used when the widget is absent or timed out.
    pub fn invalid() -> Self {
        Self {
            rating: 0.0,
            review_count: 0,
            is_valid: false,
        }
    }
}

/// One job listing as extracted from the page. Immutable per scrape pass;
/// a later scrape of the same listing produces a new record with the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub rating: CompanyRating,
}

/// Richer record for the detailed (single-job) classification path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDetailedRecord {
    #[serde(flatten)]
    pub job: JobRecord,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub about_company: String,
    #[serde(default)]
    pub company_size: String,
}

/// Lifecycle phase of a job in the state manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    Initial,
    Filtering,
    Complete,
    Error,
    Blacklisted,
}

/// Per-job state. One entry per identifier; the in-memory map in the state
/// manager is the single source of truth for rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    pub phase: JobPhase,
    pub record: Option<JobRecord>,
    pub result: Option<FilterResult>,
    pub tooltip: String,
    pub updated_at: DateTime<Utc>,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            phase: JobPhase::Initial,
            record: None,
            result: None,
            tooltip: String::new(),
            updated_at: Utc::now(),
        }
    }

    /// True when no further work is outstanding for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.phase,
            JobPhase::Complete | JobPhase::Error | JobPhase::Blacklisted
        )
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    New,
    Reviewing,
    WillApply,
    Applied,
    Rejected,
    InProgress,
    Offer,
    Accepted,
    Declined,
    NotInterested,
    NoResponse,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::New => "new",
            ApplicationStatus::Reviewing => "reviewing",
            ApplicationStatus::WillApply => "will_apply",
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::Rejected => "rejected",
            ApplicationStatus::InProgress => "in_progress",
            ApplicationStatus::Offer => "offer",
            ApplicationStatus::Accepted => "accepted",
            ApplicationStatus::Declined => "declined",
            ApplicationStatus::NotInterested => "not_interested",
            ApplicationStatus::NoResponse => "no_response",
        }
    }

    /// The user has already decided about this job; a fresh scrape should not
    /// re-enqueue it for classification.
    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Applied
                | ApplicationStatus::Rejected
                | ApplicationStatus::Accepted
                | ApplicationStatus::Declined
                | ApplicationStatus::NotInterested
        )
    }
}

impl std::str::FromStr for ApplicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(ApplicationStatus::New),
            "reviewing" => Ok(ApplicationStatus::Reviewing),
            "will_apply" => Ok(ApplicationStatus::WillApply),
            "applied" => Ok(ApplicationStatus::Applied),
            "rejected" => Ok(ApplicationStatus::Rejected),
            "in_progress" => Ok(ApplicationStatus::InProgress),
            "offer" => Ok(ApplicationStatus::Offer),
            "accepted" => Ok(ApplicationStatus::Accepted),
            "declined" => Ok(ApplicationStatus::Declined),
            "not_interested" => Ok(ApplicationStatus::NotInterested),
            "no_response" => Ok(ApplicationStatus::NoResponse),
            other => Err(format!("unknown application status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyType {
    EasyApply,
    External,
}

impl std::str::FromStr for ApplyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "easy_apply" | "easy" => Ok(ApplyType::EasyApply),
            "external" => Ok(ApplyType::External),
            other => Err(format!("unknown apply type '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub company: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub notes: String,
    pub date_created: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
}

impl BlacklistEntry {
    pub fn new(company: &str, reason: &str, notes: &str) -> Self {
        let now = Utc::now();
        Self {
            company: company.to_string(),
            reason: reason.to_string(),
            notes: notes.to_string(),
            date_created: now,
            date_updated: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub url: String,
    pub match_status: FilterStatus,
    pub application_status: ApplicationStatus,
    #[serde(default)]
    pub rejection_reason: String,
    #[serde(default)]
    pub skip_reason: String,
    #[serde(default)]
    pub user_notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cover_letter_path: Option<String>,
    pub date_created: DateTime<Utc>,
    pub date_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_applied: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_rejected: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn from_record(record: &JobRecord) -> Self {
        let now = Utc::now();
        Self {
            job_id: record.job_id.clone(),
            title: record.title.clone(),
            company: record.company.clone(),
            location: record.location.clone(),
            url: String::new(),
            match_status: FilterStatus::Unknown,
            application_status: ApplicationStatus::New,
            rejection_reason: String::new(),
            skip_reason: String::new(),
            user_notes: String::new(),
            resume_path: None,
            cover_letter_path: None,
            date_created: now,
            date_updated: now,
            date_applied: None,
            date_rejected: None,
        }
    }

    /// Minimal entry for a job we only know by id (e.g. apply from the CLI).
    pub fn bare(job_id: &str) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.to_string(),
            title: String::new(),
            company: String::new(),
            location: String::new(),
            url: String::new(),
            match_status: FilterStatus::Unknown,
            application_status: ApplicationStatus::New,
            rejection_reason: String::new(),
            skip_reason: String::new(),
            user_notes: String::new(),
            resume_path: None,
            cover_letter_path: None,
            date_created: now,
            date_updated: now,
            date_applied: None,
            date_rejected: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_status_serde_snake_case() {
        let json = serde_json::to_string(&FilterStatus::LikelyMatch).unwrap();
        assert_eq!(json, "\"likely_match\"");

        let status: FilterStatus = serde_json::from_str("\"confirmed_no_match\"").unwrap();
        assert_eq!(status, FilterStatus::ConfirmedNoMatch);
    }

    #[test]
    fn test_filter_result_match_field_rename() {
        let json = r#"{"status":"confirmed_match","reasons":["good fit"],"match":true}"#;
        let result: FilterResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.status, FilterStatus::ConfirmedMatch);
        assert_eq!(result.is_match, Some(true));
        assert_eq!(result.reasons, vec!["good fit"]);

        let back = serde_json::to_string(&result).unwrap();
        assert!(back.contains("\"match\":true"));
        assert!(!back.contains("is_match"));
    }

    #[test]
    fn test_filter_result_missing_optionals() {
        let json = r#"{"status":"not_likely"}"#;
        let result: FilterResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.status, FilterStatus::NotLikely);
        assert!(result.reasons.is_empty());
        assert!(result.is_match.is_none());
        assert!(result.title_score.is_none());
    }

    #[test]
    fn test_application_status_from_str() {
        assert_eq!(
            "will_apply".parse::<ApplicationStatus>().unwrap(),
            ApplicationStatus::WillApply
        );
        assert!("bogus".parse::<ApplicationStatus>().is_err());
    }

    #[test]
    fn test_application_status_decided() {
        assert!(ApplicationStatus::Rejected.is_decided());
        assert!(ApplicationStatus::Applied.is_decided());
        assert!(!ApplicationStatus::New.is_decided());
        assert!(!ApplicationStatus::Reviewing.is_decided());
    }

    #[test]
    fn test_detailed_record_flattens_job_fields() {
        let record = JobDetailedRecord {
            job: JobRecord {
                job_id: "123".to_string(),
                title: "Engineer".to_string(),
                company: "Acme".to_string(),
                location: "Remote".to_string(),
                rating: CompanyRating::invalid(),
            },
            description: "desc".to_string(),
            url: None,
            about_company: String::new(),
            company_size: String::new(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["jobId"], "123");
        assert_eq!(json["description"], "desc");
    }

    #[test]
    fn test_job_state_terminal_phases() {
        let mut state = JobState::new();
        assert!(!state.is_terminal());
        state.phase = JobPhase::Filtering;
        assert!(!state.is_terminal());
        for phase in [JobPhase::Complete, JobPhase::Error, JobPhase::Blacklisted] {
            state.phase = phase;
            assert!(state.is_terminal());
        }
    }
}
