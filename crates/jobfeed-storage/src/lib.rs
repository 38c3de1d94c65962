//! HTTP fetch utilities and the job store contract for jobfeed.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobfeed_core::JobListing;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobfeed-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff between attempts. `max_retries == 0` means a single attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Upper bound on time spent sleeping between attempts.
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    /// Worst-case wall time of one `fetch_json` call under this config.
    pub fn request_deadline(&self) -> Duration {
        let attempts = self.backoff.max_retries as u32 + 1;
        self.timeout.saturating_mul(attempts) + self.backoff.total_delay()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed json body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Drops the query string so provider credentials never reach logs or errors.
pub fn redact_query(url: &str) -> &str {
    url.split_once('?').map(|(base, _)| base).unwrap_or(url)
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GETs `url` and decodes the body as JSON. Non-2xx statuses are errors.
    pub async fn fetch_json(&self, source_id: &str, url: &str) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", source_id, url = redact_query(url));
        self.fetch_json_with_retries(url).instrument(span).await
    }

    async fn fetch_json_with_retries(&self, url: &str) -> Result<JsonValue, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let body = resp.bytes().await?;
                        debug!(bytes = body.len(), "fetched body");
                        return Ok(serde_json::from_slice(&body)?);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying after status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: redact_query(resp.url().as_str()).to_string(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err.without_url()));
                }
            }
        }
    }
}

/// Columns forming the store's conflict target; one row per `(source, external_id)`.
pub const CONFLICT_KEY: [&str; 2] = ["source", "external_id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract the pipeline consumes: keyed upsert plus a bounded read.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts `listing`, or overwrites the row sharing its [`CONFLICT_KEY`].
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError>;

    async fn select_all(&self, limit: usize) -> Result<Vec<JobListing>, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<JobListing>,
    /// Keyed on the same `(source, external_id)` pair as [`CONFLICT_KEY`].
    index: HashMap<(String, String), usize>,
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError> {
        let mut state = self.state.lock().await;
        let key = (listing.source.clone(), listing.external_id.clone());
        if let Some(&pos) = state.index.get(&key) {
            state.rows[pos] = listing.clone();
            return Ok(UpsertOutcome::Updated);
        }
        let pos = state.rows.len();
        state.rows.push(listing.clone());
        state.index.insert(key, pos);
        Ok(UpsertOutcome::Inserted)
    }

    async fn select_all(&self, limit: usize) -> Result<Vec<JobListing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().take(limit).cloned().collect())
    }
}

const UPSERT_JOB_SQL: &str = r#"
    INSERT INTO jobs (
        source, external_id, title, company, location, salary,
        logo, apply_url, description, job_location, image
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
    ON CONFLICT (source, external_id) DO UPDATE
       SET title = EXCLUDED.title,
           company = EXCLUDED.company,
           location = EXCLUDED.location,
           salary = EXCLUDED.salary,
           logo = EXCLUDED.logo,
           apply_url = EXCLUDED.apply_url,
           description = EXCLUDED.description,
           job_location = EXCLUDED.job_location,
           image = EXCLUDED.image,
           updated_at = NOW()
    RETURNING (xmax = 0) AS inserted
"#;

const SELECT_JOBS_SQL: &str = r#"
    SELECT source, external_id, title, company, location, salary,
           logo, apply_url, description, job_location, image
      FROM jobs
     ORDER BY created_at, id
     LIMIT $1
"#;

/// Postgres-backed store over the `jobs` table created by `migrations/`.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running jobs migrations")?;
        Ok(())
    }
}

fn row_to_listing(row: &PgRow) -> Result<JobListing, sqlx::Error> {
    let text = |column: &str| -> Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(column)?.unwrap_or_default())
    };
    Ok(JobListing {
        source: row.try_get("source")?,
        external_id: row.try_get("external_id")?,
        title: text("title")?,
        company: text("company")?,
        location: text("location")?,
        salary: text("salary")?,
        logo: text("logo")?,
        apply_url: text("apply_url")?,
        description: text("description")?,
        job_location: text("job_location")?,
        image: text("image")?,
    })
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn upsert(&self, listing: &JobListing) -> Result<UpsertOutcome, StoreError> {
        let row = sqlx::query(UPSERT_JOB_SQL)
            .bind(&listing.source)
            .bind(&listing.external_id)
            .bind(&listing.title)
            .bind(&listing.company)
            .bind(&listing.location)
            .bind(&listing.salary)
            .bind(&listing.logo)
            .bind(&listing.apply_url)
            .bind(&listing.description)
            .bind(&listing.job_location)
            .bind(&listing.image)
            .fetch_one(&self.pool)
            .await?;
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn select_all(&self, limit: usize) -> Result<Vec<JobListing>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(SELECT_JOBS_SQL)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(row_to_listing(row)?);
        }
        Ok(out)
    }
}
