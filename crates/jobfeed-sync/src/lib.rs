//! Refresh orchestration: source registry, dedup, quality backfill, upserts and the read path.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use jobfeed_adapters::{
    adapter_for_source, fetch_source, normalize_all, AdapterContext, AdapterSettings,
    SourceAdapter, SourceFetch,
};
use jobfeed_core::{fallback_listings, fallback_raw_records, JobListing, Provider, RawRecord};
use jobfeed_storage::{
    BackoffPolicy, HttpClientConfig, HttpFetcher, JobStore, MemoryJobStore, PgJobStore,
    UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-sync";

pub const DEFAULT_LIST_LIMIT: usize = 250;
pub const DEFAULT_REFRESH_CRON: &str = "0 0 6,18 * * *";

/// Slack on top of the HTTP deadline before a source task is abandoned.
const SOURCE_DEADLINE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    /// Every known provider, enabled, in merge order.
    pub fn builtin() -> Self {
        let display = |p: Provider| match p {
            Provider::RemoteOk => "RemoteOK",
            Provider::Arbeitnow => "Arbeitnow",
            Provider::Adzuna => "Adzuna",
        };
        Self {
            sources: Provider::ALL
                .into_iter()
                .map(|p| SourceConfig {
                    source_id: p.as_str().to_string(),
                    display_name: display(p).to_string(),
                    enabled: true,
                    listing_url: None,
                    notes: None,
                })
                .collect(),
        }
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn load_or_builtin(path: &Path) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            info!(path = %path.display(), "no source registry file; using built-in sources");
            Ok(Self::builtin())
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub sources_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub http_max_retries: usize,
    pub adzuna_app_id: Option<String>,
    pub adzuna_app_key: Option<String>,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
    pub web_port: u16,
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: text("DATABASE_URL"),
            sources_path: text("JOBFEED_SOURCES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("sources.yaml")),
            user_agent: text("JOBFEED_USER_AGENT").unwrap_or_else(|| "jobfeed-bot/0.1".to_string()),
            http_timeout_secs: parse_or(text("JOBFEED_HTTP_TIMEOUT_SECS"), 20),
            http_max_retries: parse_or(text("JOBFEED_HTTP_MAX_RETRIES"), 0),
            adzuna_app_id: text("ADZUNA_APP_ID"),
            adzuna_app_key: text("ADZUNA_APP_KEY"),
            scheduler_enabled: text("JOBFEED_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            refresh_cron: text("JOBFEED_REFRESH_CRON")
                .unwrap_or_else(|| DEFAULT_REFRESH_CRON.to_string()),
            web_port: parse_or(text("JOBFEED_WEB_PORT"), 8000),
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.http_max_retries,
                ..Default::default()
            },
        }
    }

    pub fn adapter_settings(&self, source: &SourceConfig) -> AdapterSettings {
        AdapterSettings {
            listing_url: source.listing_url.clone(),
            adzuna_app_id: self.adzuna_app_id.clone(),
            adzuna_app_key: self.adzuna_app_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DedupOutcome {
    pub kept: Vec<JobListing>,
    /// Composite keys of the dropped later occurrences, in batch order.
    pub dropped: Vec<String>,
}

/// Collapses a batch to one listing per composite key. The first occurrence wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupEngine;

impl DedupEngine {
    pub fn apply(&self, items: Vec<JobListing>) -> DedupOutcome {
        let mut seen = HashSet::with_capacity(items.len());
        let mut outcome = DedupOutcome::default();
        for item in items {
            let key = item.composite_key();
            if seen.contains(&key) {
                outcome.dropped.push(key);
            } else {
                seen.insert(key);
                outcome.kept.push(item);
            }
        }
        outcome
    }
}

pub const DEFAULT_LOCATION: &str = "Remote/Flexible";
const AVATAR_BASE_URL: &str = "https://ui-avatars.com/api/";
const MIN_DESCRIPTION_CHARS: usize = 10;

fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn placeholder_logo(company: &str) -> String {
    let name = if is_blank(company) { "Company" } else { company };
    reqwest::Url::parse_with_params(
        AVATAR_BASE_URL,
        &[("name", name), ("background", "random"), ("size", "150")],
    )
    .map(String::from)
    .unwrap_or_else(|_| AVATAR_BASE_URL.to_string())
}

fn placeholder_description(company: &str, title: &str) -> String {
    let company = if is_blank(company) { "A company" } else { company };
    let title = if is_blank(title) { "position" } else { title };
    format!(
        "Join {company} as a {title}. This role offers an opportunity to work with a great team on exciting projects."
    )
}

fn needs_description(description: &str) -> bool {
    description.trim().chars().count() < MIN_DESCRIPTION_CHARS
}

/// True when [`enhance`] would change `listing`.
pub fn needs_enhancement(listing: &JobListing) -> bool {
    is_blank(&listing.location) || is_blank(&listing.logo) || needs_description(&listing.description)
}

/// Backfills empty display fields. Pure and idempotent.
pub fn enhance(mut listing: JobListing) -> JobListing {
    if is_blank(&listing.location) {
        listing.location = if is_blank(&listing.job_location) {
            DEFAULT_LOCATION.to_string()
        } else {
            listing.job_location.clone()
        };
    }
    if is_blank(&listing.logo) {
        listing.logo = if is_blank(&listing.image) {
            placeholder_logo(&listing.company)
        } else {
            listing.image.clone()
        };
    }
    if needs_description(&listing.description) {
        listing.description = placeholder_description(&listing.company, &listing.title);
    }
    listing
}

/// Returns the enhanced listings and how many of them needed a backfill.
pub fn enhance_all(listings: Vec<JobListing>) -> (Vec<JobListing>, usize) {
    let mut improved = 0;
    let enhanced = listings
        .into_iter()
        .map(|listing| {
            if needs_enhancement(&listing) {
                improved += 1;
            }
            enhance(listing)
        })
        .collect();
    (enhanced, improved)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub inserted: usize,
    pub updated: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Writes listings one statement at a time; a failed row never aborts the batch.
#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn JobStore>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn write(&self, listings: &[JobListing]) -> UpsertReport {
        let mut report = UpsertReport::default();
        for listing in listings {
            match self.store.upsert(listing).await {
                Ok(UpsertOutcome::Inserted) => report.inserted += 1,
                Ok(UpsertOutcome::Updated) => report.updated += 1,
                Err(err) => {
                    report.failed += 1;
                    warn!(
                        title = %listing.title,
                        company = %listing.company,
                        key = %listing.composite_key(),
                        error = %err,
                        "failed to upsert listing"
                    );
                }
            }
        }
        report
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source: String,
    pub fetched: usize,
    pub failure: Option<String>,
}

impl From<&SourceFetch> for SourceReport {
    fn from(fetch: &SourceFetch) -> Self {
        Self {
            source: fetch.source.clone(),
            fetched: fetch.records.len(),
            failure: fetch.failure.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
    pub used_fallback: bool,
    pub normalized: usize,
    pub duplicates_dropped: usize,
    pub written: usize,
    pub inserted: usize,
    pub updated: usize,
    pub failed_writes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestratorState {
    Idle,
    Refreshing,
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadOrigin {
    Store,
    Refreshed,
    Fallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobsRead {
    pub origin: ReadOrigin,
    pub jobs: Vec<JobListing>,
    pub improved: usize,
}

/// Concatenates fetched records in fetch order.
pub fn merge_records(fetches: &[SourceFetch]) -> Vec<RawRecord> {
    fetches
        .iter()
        .flat_map(|fetch| fetch.records.iter().cloned())
        .collect()
}

struct RefreshGuard<'a>(&'a AtomicUsize);

impl<'a> RefreshGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Orchestrator {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    store: Arc<dyn JobStore>,
    upserts: UpsertEngine,
    dedup: DedupEngine,
    source_deadline: Duration,
    in_flight: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        adapters: Vec<Arc<dyn SourceAdapter>>,
        http_config: HttpClientConfig,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let source_deadline = http_config.request_deadline() + SOURCE_DEADLINE_GRACE;
        let http = HttpFetcher::new(http_config)?;
        Ok(Self {
            adapters,
            http: Arc::new(http),
            upserts: UpsertEngine::new(Arc::clone(&store)),
            store,
            dedup: DedupEngine,
            source_deadline,
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Builds adapters for every enabled registry entry, in declaration order.
    pub async fn from_config(config: &SyncConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let registry = SourceRegistry::load_or_builtin(&config.sources_path).await?;
        let mut adapters = Vec::new();
        for source in registry.enabled() {
            let adapter = adapter_for_source(&source.source_id, &config.adapter_settings(source))
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            adapters.push(adapter);
        }
        info!(sources = adapters.len(), "configured sources");
        Self::new(adapters, config.http_config(), store)
    }

    pub fn with_source_deadline(mut self, deadline: Duration) -> Self {
        self.source_deadline = deadline;
        self
    }

    pub fn source_ids(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.source_id()).collect()
    }

    pub fn state(&self) -> OrchestratorState {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            OrchestratorState::Refreshing
        } else {
            OrchestratorState::Idle
        }
    }

    /// Fetches every source concurrently. Errors, panics and deadline overruns all
    /// come back as empty fetches carrying a failure reason.
    pub async fn fetch_all(&self, ctx: &AdapterContext) -> Vec<SourceFetch> {
        let handles = self.adapters.iter().map(|adapter| {
            let adapter = Arc::clone(adapter);
            let http = Arc::clone(&self.http);
            let ctx = ctx.clone();
            let deadline = self.source_deadline;
            tokio::spawn(
                async move {
                    let source = adapter.source_id();
                    match tokio::time::timeout(deadline, fetch_source(adapter.as_ref(), &http, &ctx))
                        .await
                    {
                        Ok(fetch) => fetch,
                        Err(_) => {
                            warn!(source, ?deadline, "source fetch exceeded deadline");
                            SourceFetch::failed(source, format!("deadline of {deadline:?} exceeded"))
                        }
                    }
                }
                .in_current_span(),
            )
        });

        join_all(handles)
            .await
            .into_iter()
            .zip(&self.adapters)
            .map(|(joined, adapter)| match joined {
                Ok(fetch) => fetch,
                Err(err) => {
                    let source = adapter.source_id();
                    warn!(source, error = %err, "source task aborted");
                    SourceFetch::failed(source, format!("source task aborted: {err}"))
                }
            })
            .collect()
    }

    pub async fn refresh(&self) -> RefreshSummary {
        let _guard = RefreshGuard::enter(&self.in_flight);
        let run_id = Uuid::new_v4();
        let span = info_span!("refresh", %run_id);
        self.run_refresh(run_id).instrument(span).await
    }

    async fn run_refresh(&self, run_id: Uuid) -> RefreshSummary {
        let ctx = AdapterContext::new(run_id);
        let started_at = ctx.fetched_at;

        let fetches = self.fetch_all(&ctx).await;
        let mut raw = merge_records(&fetches);
        let used_fallback = raw.is_empty();
        if used_fallback {
            warn!("no source returned listings; using fallback fixtures");
            raw = fallback_raw_records();
        }

        let normalized = normalize_all(&raw);
        let normalized_count = normalized.len();
        let deduped = self.dedup.apply(normalized);
        if !deduped.dropped.is_empty() {
            info!(dropped = deduped.dropped.len(), keys = ?deduped.dropped, "dropped duplicate listings");
        }

        let report = self.upserts.write(&deduped.kept).await;
        let summary = RefreshSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sources: fetches.iter().map(SourceReport::from).collect(),
            used_fallback,
            normalized: normalized_count,
            duplicates_dropped: deduped.dropped.len(),
            written: report.written(),
            inserted: report.inserted,
            updated: report.updated,
            failed_writes: report.failed,
        };
        info!(
            written = summary.written,
            inserted = summary.inserted,
            updated = summary.updated,
            failed = summary.failed_writes,
            used_fallback,
            "refresh finished"
        );
        summary
    }

    /// Reads up to `limit` listings, refreshing once on an empty store and falling back
    /// to the built-in fixtures when nothing else is available. Never fails.
    pub async fn list_jobs(&self, limit: usize) -> JobsRead {
        let limit = limit.max(1);
        let fallback = || {
            (
                ReadOrigin::Fallback,
                fallback_listings().into_iter().take(limit).collect::<Vec<_>>(),
            )
        };

        let (origin, jobs) = match self.store.select_all(limit).await {
            Ok(rows) if !rows.is_empty() => (ReadOrigin::Store, rows),
            Ok(_) => {
                info!("store is empty; refreshing before read");
                self.refresh().await;
                match self.store.select_all(limit).await {
                    Ok(rows) if !rows.is_empty() => (ReadOrigin::Refreshed, rows),
                    Ok(_) => {
                        warn!("store still empty after refresh; serving fallback listings");
                        fallback()
                    }
                    Err(err) => {
                        warn!(error = %err, "store read failed after refresh; serving fallback listings");
                        fallback()
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "store read failed; serving fallback listings");
                fallback()
            }
        };

        let (jobs, improved) = enhance_all(jobs);
        if improved > 0 {
            info!(improved, "backfilled listing fields");
        }
        JobsRead {
            origin,
            jobs,
            improved,
        }
    }
}

/// Postgres when `DATABASE_URL` is set (migrated on connect), otherwise an in-memory store.
pub async fn store_from_config(config: &SyncConfig) -> Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgJobStore::connect(url).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; listings are kept in memory only");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

pub async fn orchestrator_from_env() -> Result<(SyncConfig, Arc<Orchestrator>)> {
    let config = SyncConfig::from_env();
    let store = store_from_config(&config).await?;
    let orchestrator = Orchestrator::from_config(&config, store).await?;
    Ok((config, Arc::new(orchestrator)))
}

pub async fn run_refresh_once_from_env() -> Result<RefreshSummary> {
    let (_config, orchestrator) = orchestrator_from_env().await?;
    Ok(orchestrator.refresh().await)
}

/// Registers the refresh cron job when scheduling is enabled. The caller starts it.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    orchestrator: Arc<Orchestrator>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let orchestrator = Arc::clone(&orchestrator);
        Box::pin(async move {
            let summary = orchestrator.refresh().await;
            info!(run_id = %summary.run_id, written = summary.written, "scheduled refresh complete");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
