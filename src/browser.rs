//! WebDriver page access. Connects to an already-running chromedriver
//! session, snapshots the listing containers and diffs successive snapshots
//! into mutation batches for the observer. There is no DOM mutation API over
//! WebDriver, so polling plus set-difference stands in for one.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use thirtyfour::prelude::*;
use tokio::sync::mpsc;

use crate::extract::CONTAINER_CSS;
use crate::observer::MutationBatch;

/// How often the watch loop re-snapshots the page.
pub const POLL_INTERVAL: Duration = Duration::from_millis(750);

pub struct PageSession {
    driver: WebDriver,
}

impl PageSession {
    pub async fn connect(webdriver_url: &str, page_url: &str) -> Result<Self> {
        let caps = DesiredCapabilities::chrome();
        let driver = WebDriver::new(webdriver_url, caps)
            .await
            .with_context(|| format!("connecting to webdriver at {}", webdriver_url))?;
        driver
            .goto(page_url)
            .await
            .with_context(|| format!("navigating to {}", page_url))?;
        Ok(Self { driver })
    }

    pub async fn page_source(&self) -> Result<String> {
        Ok(self.driver.source().await?)
    }

    /// Outer HTML of every listing container currently on the page. The
    /// first selector that matches anything wins; an empty page yields an
    /// empty snapshot, not an error.
    pub async fn listing_snapshots(&self) -> Result<Vec<String>> {
        for css in CONTAINER_CSS.iter().copied() {
            let elements = self.driver.find_all(By::Css(css)).await?;
            if elements.is_empty() {
                continue;
            }
            let mut snapshots = Vec::with_capacity(elements.len());
            for element in elements {
                snapshots.push(element.outer_html().await?);
            }
            return Ok(snapshots);
        }
        Ok(Vec::new())
    }

    /// Polls the page until the mutation channel closes, sending one batch
    /// per snapshot that differs from the previous one.
    pub async fn watch(
        &self,
        interval: Duration,
        mutations: mpsc::Sender<MutationBatch>,
    ) -> Result<()> {
        let mut previous: HashSet<String> = HashSet::new();
        loop {
            let current: HashSet<String> = self.listing_snapshots().await?.into_iter().collect();
            let batch = diff_snapshots(&previous, &current);
            if !batch.added.is_empty() || !batch.removed.is_empty() {
                tracing::debug!(
                    added = batch.added.len(),
                    removed = batch.removed.len(),
                    "page changed"
                );
                if mutations.send(batch).await.is_err() {
                    return Ok(());
                }
            }
            previous = current;
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn quit(self) -> Result<()> {
        self.driver.quit().await?;
        Ok(())
    }
}

/// Set difference between two snapshots. A listing whose markup changed in
/// place shows up as one removal plus one addition.
pub fn diff_snapshots(previous: &HashSet<String>, current: &HashSet<String>) -> MutationBatch {
    MutationBatch {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> HashSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_diff_first_snapshot_is_all_added() {
        let batch = diff_snapshots(&HashSet::new(), &set(&["<li>a</li>", "<li>b</li>"]));
        assert_eq!(batch.added.len(), 2);
        assert!(batch.removed.is_empty());
    }

    #[test]
    fn test_diff_unchanged_snapshot_is_empty() {
        let snapshot = set(&["<li>a</li>"]);
        let batch = diff_snapshots(&snapshot, &snapshot);
        assert!(batch.added.is_empty());
        assert!(batch.removed.is_empty());
    }

    #[test]
    fn test_diff_in_place_edit_is_remove_plus_add() {
        let batch = diff_snapshots(&set(&["<li>a v1</li>"]), &set(&["<li>a v2</li>"]));
        assert_eq!(batch.added, vec!["<li>a v2</li>"]);
        assert_eq!(batch.removed, vec!["<li>a v1</li>"]);
    }

    // Needs a chromedriver listening on 9515.
    #[tokio::test]
    #[ignore]
    async fn test_connect_and_snapshot_live() {
        let session = PageSession::connect("http://localhost:9515", "https://example.com")
            .await
            .unwrap();
        let source = session.page_source().await.unwrap();
        assert!(source.contains("<html"));
        session.quit().await.unwrap();
    }
}
