mod blacklist;
mod browser;
mod cache;
mod events;
mod extract;
mod filter;
mod history;
mod models;
mod observer;
mod process;
mod session;
mod state;
mod storage;
mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use blacklist::BlacklistManager;
use browser::PageSession;
use cache::{CacheEntry, FilterCache};
use filter::{FilterService, HttpFilterTransport};
use history::HistoryManager;
use models::{ApplicationStatus, ApplyType, HistoryEntry, JobPhase};
use observer::{PageObserver, RATING_WAIT, RatingWaiter};
use process::ListingProcessor;
use session::EditorHandoff;
use state::JobStateManager;
use storage::{FILTER_CACHE_KEY, SqliteStorage, StorageChannel, StorageMutation};

#[derive(Parser)]
#[command(name = "vetta")]
#[command(about = "Job-listing triage - watch a job board, classify listings, track applications")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize local storage
    Init,

    /// Watch a live job-board page and classify listings as they appear
    Watch {
        /// URL of the job-board page to observe
        page_url: String,

        /// Classification backend base URL
        #[arg(short, long, default_value = "http://localhost:5000")]
        backend: String,

        /// WebDriver endpoint (a running chromedriver)
        #[arg(short, long, default_value = "http://localhost:9515")]
        webdriver: String,
    },

    /// Classify listings from a saved HTML page, one shot
    Scan {
        /// Path to an HTML file containing the listing page
        file: std::path::PathBuf,

        /// Classification backend base URL
        #[arg(short, long, default_value = "http://localhost:5000")]
        backend: String,
    },

    /// Manage the company blacklist
    Blacklist {
        #[command(subcommand)]
        command: BlacklistCommands,
    },

    /// Manage application history
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    /// Start an application and print the editor session URL
    Apply {
        /// Job ID
        job_id: String,

        /// Apply type (easy_apply, external)
        #[arg(short = 't', long, default_value = "easy_apply")]
        apply_type: String,

        /// Classification backend base URL
        #[arg(short, long, default_value = "http://localhost:5000")]
        backend: String,
    },
}

#[derive(Subcommand)]
enum BlacklistCommands {
    /// Add a company to the blacklist
    Add {
        /// Company name
        company: String,

        /// Why this company is blocked
        #[arg(short, long, default_value = "")]
        reason: String,

        /// Free-form notes
        #[arg(short, long, default_value = "")]
        notes: String,
    },

    /// Remove a company from the blacklist
    Remove {
        /// Company name
        company: String,
    },

    /// List blacklisted companies
    List,
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// List tracked jobs
    List {
        /// Filter by application status
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Show one job's history entry
    Show {
        /// Job ID
        job_id: String,
    },

    /// Attach a note to a job
    Note {
        /// Job ID
        job_id: String,

        /// Note text
        note: String,
    },

    /// Set a job's application status
    Status {
        /// Job ID
        job_id: String,

        /// New status (new, reviewing, will_apply, applied, rejected, ...)
        status: String,
    },
}

struct Pipeline {
    blacklist: Arc<BlacklistManager>,
    states: Arc<JobStateManager>,
    processor: Arc<ListingProcessor>,
}

/// Builds the full classification pipeline over the given storage channel:
/// managers, persisted-cache mirror, filter service, state manager and the
/// retrying processor.
async fn build_pipeline(channel: Arc<dyn StorageChannel>, backend: &str) -> Result<Pipeline> {
    let blacklist = BlacklistManager::new(Arc::clone(&channel)).await?;
    let history = HistoryManager::new(Arc::clone(&channel)).await?;

    let cache = Arc::new(FilterCache::new());
    if let Some(value) = channel.get(FILTER_CACHE_KEY).await? {
        match serde_json::from_value::<HashMap<String, CacheEntry>>(value) {
            Ok(entries) => {
                tracing::info!(entries = entries.len(), "loaded persisted filter cache");
                cache.load(entries);
            }
            Err(e) => tracing::warn!(error = %e, "ignoring corrupt persisted cache"),
        }
    }
    {
        // Mirror cache writes back into storage for the next session.
        let channel = Arc::clone(&channel);
        cache.set_listener(move |job_id, result| {
            let channel = Arc::clone(&channel);
            let mutation = StorageMutation::CacheStore {
                job_id: job_id.to_string(),
                result: result.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = channel.request(mutation).await {
                    tracing::warn!(error = %e, "persisting cache entry failed");
                }
            });
        });
    }

    let transport = Arc::new(HttpFilterTransport::new(backend));
    let filter = Arc::new(FilterService::new(transport));
    filter
        .subscribe_completions(|c| {
            tracing::debug!(job_id = %c.job_id, status = c.result.status.as_str(), "classified");
        })
        .detach();
    filter
        .subscribe_failures(|f| {
            tracing::warn!(job_id = %f.job_id, message = %f.message, "classification failure");
        })
        .detach();
    let states = JobStateManager::new(filter, Arc::clone(&blacklist), history, cache);
    let processor = ListingProcessor::new(Arc::clone(&states));

    Ok(Pipeline {
        blacklist,
        states,
        processor,
    })
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vetta=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let storage = Arc::new(SqliteStorage::open()?);

    match cli.command {
        Commands::Init => {
            storage.init()?;
            println!("Storage initialized at {}", storage.path().display());
        }

        Commands::Watch {
            page_url,
            backend,
            webdriver,
        } => {
            storage.ensure_initialized()?;
            let channel: Arc<dyn StorageChannel> = storage;
            let pipeline = build_pipeline(channel, &backend).await?;
            let _wiring = pipeline.processor.watch_blacklist(&pipeline.blacklist);

            let page = Arc::new(PageSession::connect(&webdriver, &page_url).await?);

            let (mutation_tx, mutation_rx) = mpsc::channel(64);
            let (rescan_tx, mut rescan_rx) = mpsc::channel(16);
            let ratings = Arc::new(RatingWaiter::new());

            {
                let ratings = Arc::clone(&ratings);
                tokio::spawn(async move {
                    PageObserver::new().run(mutation_rx, rescan_tx, ratings).await;
                });
            }

            {
                let page = Arc::clone(&page);
                tokio::spawn(async move {
                    if let Err(e) = page.watch(browser::POLL_INTERVAL, mutation_tx).await {
                        tracing::error!(error = %e, "page watch loop stopped");
                    }
                });
            }

            {
                let page = Arc::clone(&page);
                let processor = Arc::clone(&pipeline.processor);
                tokio::spawn(async move {
                    // First pass before any mutation arrives.
                    rescan(&page, &processor, &ratings).await;
                    while rescan_rx.recv().await.is_some() {
                        rescan(&page, &processor, &ratings).await;
                    }
                });
            }

            let states = Arc::clone(&pipeline.states);
            tokio::task::spawn_blocking(move || tui::run_dashboard(states))
                .await
                .context("dashboard thread panicked")??;
        }

        Commands::Scan { file, backend } => {
            storage.ensure_initialized()?;
            let channel: Arc<dyn StorageChannel> = storage;
            let pipeline = build_pipeline(channel, &backend).await?;

            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let records = extract::extract_listings(&html);
            if records.is_empty() {
                println!("No listings found in {}.", file.display());
                return Ok(());
            }
            println!("Classifying {} listing(s)...", records.len());
            pipeline.processor.process_all(records).await;
            wait_until_settled(&pipeline.states, Duration::from_secs(60)).await;
            print_scan_table(&pipeline.states);
        }

        Commands::Blacklist { command } => {
            storage.ensure_initialized()?;
            let channel: Arc<dyn StorageChannel> = storage;
            let blacklist = BlacklistManager::new(channel).await?;
            match command {
                BlacklistCommands::Add {
                    company,
                    reason,
                    notes,
                } => {
                    blacklist.add(&company, &reason, &notes).await?;
                    println!("Blacklisted '{}'.", company);
                }
                BlacklistCommands::Remove { company } => {
                    blacklist.remove(&company).await?;
                    println!("Removed '{}' from the blacklist.", company);
                }
                BlacklistCommands::List => {
                    let entries = blacklist.entries();
                    if entries.is_empty() {
                        println!("Blacklist is empty.");
                    } else {
                        println!("{:<25} {:<30} {:<20}", "COMPANY", "REASON", "SINCE");
                        println!("{}", "-".repeat(75));
                        for entry in entries {
                            println!(
                                "{:<25} {:<30} {:<20}",
                                truncate(&entry.company, 23),
                                truncate(&entry.reason, 28),
                                entry.date_created.format("%Y-%m-%d").to_string()
                            );
                        }
                    }
                }
            }
        }

        Commands::History { command } => {
            storage.ensure_initialized()?;
            let channel: Arc<dyn StorageChannel> = storage;
            let history = HistoryManager::new(channel).await?;
            match command {
                HistoryCommands::List { status } => {
                    let filter: Option<ApplicationStatus> =
                        status.as_deref().map(str::parse).transpose().map_err(
                            |e: String| anyhow::anyhow!(e),
                        )?;
                    let entries: Vec<HistoryEntry> = history
                        .all()
                        .into_iter()
                        .filter(|e| filter.is_none_or(|f| e.application_status == f))
                        .collect();
                    if entries.is_empty() {
                        println!("No history entries found.");
                    } else {
                        println!(
                            "{:<14} {:<14} {:<28} {:<20} {:<12}",
                            "JOB", "STATUS", "TITLE", "COMPANY", "UPDATED"
                        );
                        println!("{}", "-".repeat(88));
                        for entry in entries {
                            println!(
                                "{:<14} {:<14} {:<28} {:<20} {:<12}",
                                truncate(&entry.job_id, 12),
                                entry.application_status.as_str(),
                                truncate(&entry.title, 26),
                                truncate(&entry.company, 18),
                                entry.date_updated.format("%Y-%m-%d").to_string()
                            );
                        }
                    }
                }
                HistoryCommands::Show { job_id } => match history.get(&job_id) {
                    Some(entry) => {
                        println!("Job {}", entry.job_id);
                        if !entry.title.is_empty() {
                            println!("Title: {}", entry.title);
                        }
                        if !entry.company.is_empty() {
                            println!("Company: {}", entry.company);
                        }
                        if !entry.location.is_empty() {
                            println!("Location: {}", entry.location);
                        }
                        if !entry.url.is_empty() {
                            println!("URL: {}", entry.url);
                        }
                        println!("Match: {}", entry.match_status.as_str());
                        println!("Application: {}", entry.application_status.as_str());
                        if let Some(applied) = entry.date_applied {
                            println!("Applied: {}", applied.format("%Y-%m-%d %H:%M"));
                        }
                        if let Some(rejected) = entry.date_rejected {
                            println!("Rejected: {}", rejected.format("%Y-%m-%d %H:%M"));
                        }
                        if let Some(resume) = &entry.resume_path {
                            println!("Resume: {}", resume);
                        }
                        if let Some(cover) = &entry.cover_letter_path {
                            println!("Cover letter: {}", cover);
                        }
                        if !entry.user_notes.is_empty() {
                            println!("\nNotes:\n{}", entry.user_notes);
                        }
                    }
                    None => println!("Job '{}' not found in history.", job_id),
                },
                HistoryCommands::Note { job_id, note } => {
                    history.set_notes(&job_id, &note).await?;
                    println!("Noted.");
                }
                HistoryCommands::Status { job_id, status } => {
                    let status: ApplicationStatus =
                        status.parse().map_err(|e: String| anyhow::anyhow!(e))?;
                    history.set_application_status(&job_id, status, None).await?;
                    println!("Job '{}' is now {}.", job_id, status.as_str());
                }
            }
        }

        Commands::Apply {
            job_id,
            apply_type,
            backend,
        } => {
            storage.ensure_initialized()?;
            let apply_type: ApplyType =
                apply_type.parse().map_err(|e: String| anyhow::anyhow!(e))?;
            let channel: Arc<dyn StorageChannel> = storage;
            let history = HistoryManager::new(channel).await?;

            let editor_url = EditorHandoff::new(&backend)
                .start_application(&job_id, apply_type)
                .await?;

            if history.get(&job_id).is_none() {
                history.upsert(HistoryEntry::bare(&job_id)).await?;
            }
            history
                .set_application_status(&job_id, ApplicationStatus::InProgress, None)
                .await?;

            println!("Editor session: {}", editor_url);
        }
    }

    Ok(())
}

async fn rescan(page: &PageSession, processor: &ListingProcessor, ratings: &Arc<RatingWaiter>) {
    let snapshots = match page.listing_snapshots().await {
        Ok(snapshots) => snapshots,
        Err(e) => {
            tracing::warn!(error = %e, "rescan snapshot failed");
            return;
        }
    };
    let mut records = Vec::new();
    for html in &snapshots {
        if let Some(record) = extract::extract_listing(html) {
            records.push(record);
        }
    }
    tracing::debug!(listings = records.len(), "rescan complete");

    // Ratings hydrate late; give each incomplete listing a bounded chance to
    // pick one up. The waits run concurrently, so the whole pass is capped at
    // one ceiling.
    let mut waits = tokio::task::JoinSet::new();
    for mut record in records {
        let ratings = Arc::clone(ratings);
        waits.spawn(async move {
            if !record.rating.is_valid {
                record.rating = ratings.wait(&record.job_id, RATING_WAIT).await;
            }
            record
        });
    }
    let mut resolved = Vec::new();
    while let Some(joined) = waits.join_next().await {
        if let Ok(record) = joined {
            resolved.push(record);
        }
    }
    processor.process_all(resolved).await;
}

/// Polls until every known job reaches a terminal phase, or the deadline
/// passes.
async fn wait_until_settled(states: &JobStateManager, limit: Duration) {
    let deadline = std::time::Instant::now() + limit;
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snapshot = states.snapshot();
        let settled = !snapshot.is_empty() && snapshot.values().all(|s| s.is_terminal());
        if settled || std::time::Instant::now() >= deadline {
            break;
        }
    }
}

fn print_scan_table(states: &JobStateManager) {
    let mut rows: Vec<_> = states.snapshot().into_iter().collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    println!(
        "{:<14} {:<18} {:<28} {:<20} {:<30}",
        "JOB", "RESULT", "TITLE", "COMPANY", "REASONS"
    );
    println!("{}", "-".repeat(110));
    for (job_id, state) in rows {
        let result_label = match state.phase {
            JobPhase::Blacklisted => "blacklisted".to_string(),
            JobPhase::Error => "error".to_string(),
            JobPhase::Filtering | JobPhase::Initial => "pending".to_string(),
            JobPhase::Complete => state
                .result
                .as_ref()
                .map_or("complete".to_string(), |r| r.status.as_str().to_string()),
        };
        let (title, company) = match &state.record {
            Some(r) => (r.title.clone(), r.company.clone()),
            None => (String::new(), String::new()),
        };
        println!(
            "{:<14} {:<18} {:<28} {:<20} {:<30}",
            truncate(&job_id, 12),
            result_label,
            truncate(&title, 26),
            truncate(&company, 18),
            truncate(&state.tooltip, 28)
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    // Back off to a char boundary so multibyte text never splits mid-char.
    let mut end = max.saturating_sub(3);
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn test_truncate_short_string_unchanged() {
        assert_eq!(truncate("Backend Dev", 26), "Backend Dev");
    }

    #[test]
    fn test_truncate_long_ascii() {
        assert_eq!(truncate("Senior Backend Developer", 10), "Senior ...");
    }

    #[test]
    fn test_truncate_multibyte_at_cut_point() {
        // 'é' straddles the cut index; the slice must land before it.
        let title = "Software Engineer DevOps Caféteria";
        let out = truncate(title, 32);
        assert_eq!(out, "Software Engineer DevOps Caf...");

        let company = "Café Müller Gesellschaft";
        let out = truncate(company, 8);
        assert_eq!(out, "Café...");
    }
}
