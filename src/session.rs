//! Apply-flow handoff. Starting an application is a single backend call that
//! returns the URL of an editor session; everything inside that session is
//! the backend's business.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::models::ApplyType;

pub struct EditorHandoff {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ApplyRequest {
    apply_type: ApplyType,
}

#[derive(Debug, Deserialize)]
struct ApplyResponse {
    editor_url: String,
}

impl EditorHandoff {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    /// Starts an application for `job_id` and returns the absolute editor
    /// session URL.
    pub async fn start_application(&self, job_id: &str, apply_type: ApplyType) -> Result<String> {
        let url = format!("{}/api/apply/{}", self.base_url, job_id);
        let response = self
            .client
            .post(&url)
            .json(&ApplyRequest { apply_type })
            .send()
            .await
            .with_context(|| format!("starting application for job '{}'", job_id))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("apply endpoint returned {}: {}", status, body);
        }

        let parsed: ApplyResponse = response
            .json()
            .await
            .context("apply response is missing editor_url")?;
        Ok(absolutize(&self.base_url, &parsed.editor_url))
    }
}

/// The backend may hand back a relative editor path; resolve it against the
/// backend base URL so it is directly openable.
fn absolutize(base_url: &str, editor_url: &str) -> String {
    if editor_url.starts_with("http://") || editor_url.starts_with("https://") {
        return editor_url.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        editor_url.trim_start_matches('/')
    )
}
