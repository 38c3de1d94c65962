//! Source adapter contracts, provider adapters and the canonical field normalizer.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::{
    JobListing, Provider, RawRecord, EXTERNAL_ID_KEY, UNKNOWN_EXTERNAL_ID, UNTAGGED_SOURCE,
};
use jobfeed_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobfeed-adapters";

pub const REMOTEOK_LISTING_URL: &str = "https://remoteok.com/api";
pub const ARBEITNOW_LISTING_URL: &str = "https://www.arbeitnow.com/api/job-board-api";
pub const ADZUNA_LISTING_URL: &str = "https://api.adzuna.com/v1/api/jobs/us/search/1";
pub const ADZUNA_RESULTS_PER_PAGE: u32 = 50;

/// Long free text is cut to this many characters before it is stored.
pub const MAX_DESCRIPTION_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("missing credentials for {0}")]
    MissingCredentials(&'static str),
    #[error("unexpected payload shape: {0}")]
    UnexpectedEnvelope(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// One upstream provider. Implementations unwrap their own envelope and tag every
/// record with `source` and `external_id` before returning it.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Fails before any network call when the provider cannot be queried.
    fn listing_url(&self) -> Result<String, AdapterError>;

    fn parse_listing(&self, payload: JsonValue) -> Result<Vec<RawRecord>, AdapterError>;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        _ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        let url = self.listing_url()?;
        let payload = http.fetch_json(self.source_id(), &url).await?;
        self.parse_listing(payload)
    }
}

/// Per-source knobs coming from the source registry and the environment.
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub listing_url: Option<String>,
    pub adzuna_app_id: Option<String>,
    pub adzuna_app_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteOkAdapter {
    listing_url: String,
}

#[derive(Debug, Clone)]
pub struct ArbeitnowAdapter {
    listing_url: String,
}

#[derive(Debug, Clone)]
pub struct AdzunaAdapter {
    listing_url: String,
    app_id: Option<String>,
    app_key: Option<String>,
}

impl RemoteOkAdapter {
    pub fn new(listing_url: Option<String>) -> Self {
        Self {
            listing_url: listing_url.unwrap_or_else(|| REMOTEOK_LISTING_URL.to_string()),
        }
    }
}

impl ArbeitnowAdapter {
    pub fn new(listing_url: Option<String>) -> Self {
        Self {
            listing_url: listing_url.unwrap_or_else(|| ARBEITNOW_LISTING_URL.to_string()),
        }
    }
}

impl AdzunaAdapter {
    pub fn new(listing_url: Option<String>, app_id: Option<String>, app_key: Option<String>) -> Self {
        Self {
            listing_url: listing_url.unwrap_or_else(|| ADZUNA_LISTING_URL.to_string()),
            app_id: app_id.and_then(non_blank),
            app_key: app_key.and_then(non_blank),
        }
    }
}

#[async_trait]
impl SourceAdapter for RemoteOkAdapter {
    fn source_id(&self) -> &'static str {
        Provider::RemoteOk.as_str()
    }

    fn listing_url(&self) -> Result<String, AdapterError> {
        Ok(self.listing_url.clone())
    }

    fn parse_listing(&self, payload: JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
        let JsonValue::Array(items) = payload else {
            return Err(AdapterError::UnexpectedEnvelope(
                "remoteok payload is not an array".to_string(),
            ));
        };
        // Element 0 is the API's legal/metadata notice.
        let jobs = items.into_iter().skip(1).collect();
        Ok(tag_records(self.source_id(), jobs, "id"))
    }
}

#[async_trait]
impl SourceAdapter for ArbeitnowAdapter {
    fn source_id(&self) -> &'static str {
        Provider::Arbeitnow.as_str()
    }

    fn listing_url(&self) -> Result<String, AdapterError> {
        Ok(self.listing_url.clone())
    }

    fn parse_listing(&self, payload: JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
        let jobs = unwrap_envelope(self.source_id(), payload, "data")?;
        Ok(tag_records(self.source_id(), jobs, "slug"))
    }
}

#[async_trait]
impl SourceAdapter for AdzunaAdapter {
    fn source_id(&self) -> &'static str {
        Provider::Adzuna.as_str()
    }

    fn listing_url(&self) -> Result<String, AdapterError> {
        let (Some(app_id), Some(app_key)) = (&self.app_id, &self.app_key) else {
            return Err(AdapterError::MissingCredentials(self.source_id()));
        };
        let per_page = ADZUNA_RESULTS_PER_PAGE.to_string();
        let url = reqwest::Url::parse_with_params(
            &self.listing_url,
            &[
                ("app_id", app_id.as_str()),
                ("app_key", app_key.as_str()),
                ("results_per_page", per_page.as_str()),
                ("content-type", "application/json"),
            ],
        )
        .map_err(|e| AdapterError::Message(format!("invalid adzuna listing url: {e}")))?;
        Ok(url.to_string())
    }

    fn parse_listing(&self, payload: JsonValue) -> Result<Vec<RawRecord>, AdapterError> {
        let jobs = unwrap_envelope(self.source_id(), payload, "results")?;
        Ok(tag_records(self.source_id(), jobs, "id"))
    }
}

pub fn adapter_for_source(
    source_id: &str,
    settings: &AdapterSettings,
) -> Option<Arc<dyn SourceAdapter>> {
    match Provider::parse(source_id)? {
        Provider::RemoteOk => Some(Arc::new(RemoteOkAdapter::new(settings.listing_url.clone()))),
        Provider::Arbeitnow => Some(Arc::new(ArbeitnowAdapter::new(settings.listing_url.clone()))),
        Provider::Adzuna => Some(Arc::new(AdzunaAdapter::new(
            settings.listing_url.clone(),
            settings.adzuna_app_id.clone(),
            settings.adzuna_app_key.clone(),
        ))),
    }
}

/// `{ "<key>": [...] }` envelopes. An object without the key is an empty listing.
fn unwrap_envelope(
    source_id: &str,
    payload: JsonValue,
    key: &str,
) -> Result<Vec<JsonValue>, AdapterError> {
    let JsonValue::Object(mut envelope) = payload else {
        return Err(AdapterError::UnexpectedEnvelope(format!(
            "{source_id} payload is not an object"
        )));
    };
    match envelope.remove(key) {
        Some(JsonValue::Array(items)) => Ok(items),
        Some(JsonValue::Null) | None => Ok(Vec::new()),
        Some(_) => Err(AdapterError::UnexpectedEnvelope(format!(
            "{source_id} field `{key}` is not an array"
        ))),
    }
}

fn tag_records(source_id: &str, items: Vec<JsonValue>, id_key: &str) -> Vec<RawRecord> {
    items
        .into_iter()
        .filter_map(RawRecord::from_value)
        .map(|mut record| {
            let external_id = record.lookup(&[id_key]).and_then(json_id);
            record.tag(source_id, external_id);
            record
        })
        .collect()
}

/// Outcome of one isolated source fetch. A failed source yields no records.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SourceFetch {
    pub source: String,
    pub records: Vec<RawRecord>,
    pub failure: Option<String>,
}

impl SourceFetch {
    pub fn succeeded(source: &str, records: Vec<RawRecord>) -> Self {
        Self {
            source: source.to_string(),
            records,
            failure: None,
        }
    }

    pub fn failed(source: &str, reason: impl Into<String>) -> Self {
        Self {
            source: source.to_string(),
            records: Vec::new(),
            failure: Some(reason.into()),
        }
    }
}

/// Runs one adapter and absorbs every fault into an empty [`SourceFetch`].
pub async fn fetch_source(
    adapter: &dyn SourceAdapter,
    http: &HttpFetcher,
    ctx: &AdapterContext,
) -> SourceFetch {
    let source = adapter.source_id();
    match adapter.fetch_listing(http, ctx).await {
        Ok(records) => {
            info!(run_id = %ctx.run_id, source, count = records.len(), "fetched listings");
            SourceFetch::succeeded(source, records)
        }
        Err(AdapterError::MissingCredentials(_)) => {
            warn!(run_id = %ctx.run_id, source, "credentials not configured; skipping source");
            SourceFetch::failed(source, "missing credentials")
        }
        Err(err) => {
            warn!(run_id = %ctx.run_id, source, error = %err, "source fetch failed");
            SourceFetch::failed(source, err.to_string())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanonicalField {
    Title,
    Company,
    Location,
    Salary,
    Logo,
    ApplyUrl,
    Description,
    JobLocation,
    Image,
}

/// Candidate key paths for one canonical field, highest priority first.
#[derive(Debug, Clone, Copy)]
pub struct FieldRule {
    pub field: CanonicalField,
    pub candidates: &'static [&'static [&'static str]],
}

pub const FIELD_RULES: [FieldRule; 9] = [
    FieldRule {
        field: CanonicalField::Title,
        candidates: &[&["position"], &["title"], &["name"]],
    },
    FieldRule {
        field: CanonicalField::Company,
        candidates: &[
            &["company"],
            &["company_name"],
            &["company", "display_name"],
            &["company_display_name"],
        ],
    },
    FieldRule {
        field: CanonicalField::Location,
        candidates: &[&["location"], &["location_display"], &["location", "display_name"]],
    },
    FieldRule {
        field: CanonicalField::Salary,
        candidates: &[&["salary"], &["salary_min"]],
    },
    FieldRule {
        field: CanonicalField::Logo,
        candidates: &[&["logo"], &["company_logo"]],
    },
    FieldRule {
        field: CanonicalField::ApplyUrl,
        candidates: &[&["url"], &["apply_url"], &["redirect_url"]],
    },
    FieldRule {
        field: CanonicalField::Description,
        candidates: &[&["description"], &["body"], &["description_html"]],
    },
    FieldRule {
        field: CanonicalField::JobLocation,
        candidates: &[&["job_location"]],
    },
    FieldRule {
        field: CanonicalField::Image,
        candidates: &[&["image"]],
    },
];

const EXTERNAL_ID_CANDIDATES: &[&[&str]] = &[&[EXTERNAL_ID_KEY], &["id"]];

/// Display text of a JSON value, or `None` when it carries nothing worth showing.
fn json_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_blank(s.clone()),
        JsonValue::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        _ => None,
    }
}

fn json_id(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => non_blank(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn first_present(
    raw: &RawRecord,
    candidates: &[&[&str]],
    extract: fn(&JsonValue) -> Option<String>,
) -> Option<String> {
    candidates
        .iter()
        .find_map(|path| raw.lookup(path).and_then(extract))
}

/// Resolves one canonical field through [`FIELD_RULES`]; empty when nothing matches.
pub fn resolve_field(raw: &RawRecord, field: CanonicalField) -> String {
    FIELD_RULES
        .iter()
        .find(|rule| rule.field == field)
        .and_then(|rule| first_present(raw, rule.candidates, json_text))
        .unwrap_or_default()
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Maps any raw record onto [`JobListing`]. Never fails: unresolvable fields are empty.
pub fn normalize(raw: &RawRecord) -> JobListing {
    let source = raw
        .source()
        .and_then(|s| non_blank(s.to_string()))
        .unwrap_or_else(|| UNTAGGED_SOURCE.to_string());
    let external_id = first_present(raw, EXTERNAL_ID_CANDIDATES, json_id)
        .unwrap_or_else(|| UNKNOWN_EXTERNAL_ID.to_string());

    JobListing {
        source,
        external_id,
        title: resolve_field(raw, CanonicalField::Title),
        company: resolve_field(raw, CanonicalField::Company),
        location: resolve_field(raw, CanonicalField::Location),
        salary: resolve_field(raw, CanonicalField::Salary),
        logo: resolve_field(raw, CanonicalField::Logo),
        apply_url: resolve_field(raw, CanonicalField::ApplyUrl),
        description: truncate_chars(
            &resolve_field(raw, CanonicalField::Description),
            MAX_DESCRIPTION_CHARS,
        ),
        job_location: resolve_field(raw, CanonicalField::JobLocation),
        image: resolve_field(raw, CanonicalField::Image),
    }
}

pub fn normalize_all(raw: &[RawRecord]) -> Vec<JobListing> {
    raw.iter().map(normalize).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfeed_core::{fallback_listings, fallback_raw_records};
    use jobfeed_storage::HttpClientConfig;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawRecord {
        RawRecord::from_value(value).unwrap()
    }

    #[test]
    fn title_candidates_resolve_in_priority_order() {
        let rec = raw(json!({ "source": "remoteok", "id": 1, "position": "Rust Dev", "title": "Other" }));
        assert_eq!(normalize(&rec).title, "Rust Dev");

        let rec = raw(json!({ "source": "arbeitnow", "slug": "x", "title": "Platform Engineer" }));
        assert_eq!(normalize(&rec).title, "Platform Engineer");

        let rec = raw(json!({ "name": "Fallback Name", "position": "   " }));
        assert_eq!(normalize(&rec).title, "Fallback Name");
    }

    #[test]
    fn nested_company_and_location_objects_are_resolved() {
        let rec = raw(json!({
            "source": "adzuna",
            "external_id": "99",
            "company": { "display_name": "Northwind" },
            "location": { "display_name": "Denver, Colorado" }
        }));
        let listing = normalize(&rec);
        assert_eq!(listing.company, "Northwind");
        assert_eq!(listing.location, "Denver, Colorado");
    }

    #[test]
    fn unresolvable_fields_degrade_to_empty_strings() {
        let listing = normalize(&raw(json!({ "unrelated": true })));
        assert_eq!(listing.source, UNTAGGED_SOURCE);
        assert_eq!(listing.external_id, UNKNOWN_EXTERNAL_ID);
        assert!(listing.title.is_empty());
        assert!(listing.company.is_empty());
        assert!(listing.description.is_empty());
        assert_eq!(listing.composite_key(), "test_unknown");
    }

    #[test]
    fn numeric_salary_is_rendered_and_zero_is_skipped() {
        let rec = raw(json!({ "salary_min": 140000 }));
        assert_eq!(normalize(&rec).salary, "140000");
        let rec = raw(json!({ "salary": "", "salary_min": 0 }));
        assert_eq!(normalize(&rec).salary, "");
    }

    #[test]
    fn external_id_prefers_tag_over_native_id() {
        let rec = raw(json!({ "source": "remoteok", "external_id": "42", "id": 7 }));
        assert_eq!(normalize(&rec).external_id, "42");
        let rec = raw(json!({ "source": "remoteok", "id": 7 }));
        assert_eq!(normalize(&rec).external_id, "7");
    }

    #[test]
    fn description_is_truncated_on_char_boundaries() {
        let long = "ü".repeat(MAX_DESCRIPTION_CHARS + 25);
        let listing = normalize(&raw(json!({ "body": long })));
        assert_eq!(listing.description.chars().count(), MAX_DESCRIPTION_CHARS);
        assert_eq!(truncate_chars("short", 10), "short");
    }

    #[test]
    fn composite_key_is_stable_across_normalizations() {
        let rec = raw(json!({ "source": "remoteok", "external_id": "42", "position": "Engineer" }));
        assert_eq!(normalize(&rec).composite_key(), normalize(&rec).composite_key());
        assert_eq!(normalize(&rec).composite_key(), "remoteok_42");
    }

    #[test]
    fn fallback_raw_records_normalize_to_fallback_listings() {
        assert_eq!(normalize_all(&fallback_raw_records()), fallback_listings());
    }

    #[test]
    fn remoteok_skips_metadata_and_tags_ids() {
        let records = RemoteOkAdapter::new(None)
            .parse_listing(json!([
                { "legal": "terms" },
                { "id": 1093211, "position": "Rust Engineer" },
                "not-an-object",
                { "position": "No Id" }
            ]))
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].source(), Some("remoteok"));
        assert_eq!(normalize(&records[0]).external_id, "1093211");
        assert_eq!(normalize(&records[1]).external_id, UNKNOWN_EXTERNAL_ID);
    }

    #[test]
    fn arbeitnow_uses_slug_as_external_id() {
        let records = ArbeitnowAdapter::new(None)
            .parse_listing(json!({ "data": [{ "slug": "platform-engineer-1", "title": "Platform Engineer" }] }))
            .unwrap();
        assert_eq!(normalize(&records[0]).composite_key(), "arbeitnow_platform-engineer-1");
    }

    #[test]
    fn envelope_shapes_are_checked() {
        let arbeitnow = ArbeitnowAdapter::new(None);
        assert!(arbeitnow.parse_listing(json!({ "meta": {} })).unwrap().is_empty());
        assert!(matches!(
            arbeitnow.parse_listing(json!([])),
            Err(AdapterError::UnexpectedEnvelope(_))
        ));
        assert!(matches!(
            arbeitnow.parse_listing(json!({ "data": "oops" })),
            Err(AdapterError::UnexpectedEnvelope(_))
        ));
        assert!(matches!(
            RemoteOkAdapter::new(None).parse_listing(json!({ "data": [] })),
            Err(AdapterError::UnexpectedEnvelope(_))
        ));
    }

    #[test]
    fn adzuna_listing_url_requires_credentials() {
        let adapter = AdzunaAdapter::new(None, Some("id".into()), None);
        assert!(matches!(
            adapter.listing_url(),
            Err(AdapterError::MissingCredentials("adzuna"))
        ));

        let adapter = AdzunaAdapter::new(None, Some("id".into()), Some("  ".into()));
        assert!(adapter.listing_url().is_err());

        let adapter = AdzunaAdapter::new(None, Some("my-id".into()), Some("my-key".into()));
        let url = adapter.listing_url().unwrap();
        assert!(url.starts_with(ADZUNA_LISTING_URL));
        assert!(url.contains("app_id=my-id"));
        assert!(url.contains("app_key=my-key"));
        assert!(url.contains("results_per_page=50"));
    }

    #[test]
    fn registry_lookup_honours_listing_url_override() {
        let settings = AdapterSettings {
            listing_url: Some("http://localhost:9/api".into()),
            ..Default::default()
        };
        let adapter = adapter_for_source("remoteok", &settings).unwrap();
        assert_eq!(adapter.listing_url().unwrap(), "http://localhost:9/api");
        assert!(adapter_for_source("linkedin", &settings).is_none());
    }

    #[tokio::test]
    async fn missing_credentials_short_circuit_to_empty_fetch() {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let adapter = AdzunaAdapter::new(None, None, None);
        let ctx = AdapterContext::new(Uuid::new_v4());
        let fetch = fetch_source(&adapter, &http, &ctx).await;
        assert_eq!(fetch.source, "adzuna");
        assert!(fetch.records.is_empty());
        assert_eq!(fetch.failure.as_deref(), Some("missing credentials"));
    }
}
