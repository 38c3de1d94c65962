//! Core domain model for jobfeed: raw provider records, canonical listings and fallback fixtures.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub const CRATE_NAME: &str = "jobfeed-core";

/// External id used when a raw record carries no usable provider id.
pub const UNKNOWN_EXTERNAL_ID: &str = "unknown";
/// Source assigned to records that reach normalization without a source tag.
pub const UNTAGGED_SOURCE: &str = "test";
/// Source carried by the built-in fallback fixtures.
pub const FALLBACK_SOURCE: &str = "test_data";

pub const SOURCE_KEY: &str = "source";
pub const EXTERNAL_ID_KEY: &str = "external_id";

/// Upstream job boards with a dedicated adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    RemoteOk,
    Arbeitnow,
    Adzuna,
}

impl Provider {
    /// Declaration order; also the default merge order of a refresh.
    pub const ALL: [Provider; 3] = [Provider::RemoteOk, Provider::Arbeitnow, Provider::Adzuna];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::RemoteOk => "remoteok",
            Provider::Arbeitnow => "arbeitnow",
            Provider::Adzuna => "adzuna",
        }
    }

    pub fn parse(source_id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(source_id.trim()))
    }
}

/// One provider's native job object, exactly as decoded from its payload.
///
/// The only keys jobfeed itself writes are `source` and `external_id`, set by the
/// fetching adapter before the record leaves it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    fields: Map<String, JsonValue>,
}

impl RawRecord {
    /// Wraps a decoded JSON object; anything else is not a record.
    pub fn from_value(value: JsonValue) -> Option<Self> {
        match value {
            JsonValue::Object(fields) => Some(Self { fields }),
            _ => None,
        }
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        Self {
            fields: pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn fields(&self) -> &Map<String, JsonValue> {
        &self.fields
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.fields.insert(key.into(), value);
    }

    /// Stamps provider identity onto the record. A missing id leaves any existing
    /// `external_id` untouched.
    pub fn tag(&mut self, source: &str, external_id: Option<String>) {
        self.insert(SOURCE_KEY, JsonValue::String(source.to_string()));
        if let Some(id) = external_id {
            self.insert(EXTERNAL_ID_KEY, JsonValue::String(id));
        }
    }

    pub fn source(&self) -> Option<&str> {
        self.fields.get(SOURCE_KEY).and_then(JsonValue::as_str)
    }

    /// Walks nested objects, e.g. `["company", "display_name"]`.
    pub fn lookup(&self, path: &[&str]) -> Option<&JsonValue> {
        let (first, rest) = path.split_first()?;
        let mut cur = self.fields.get(*first)?;
        for segment in rest {
            cur = cur.get(*segment)?;
        }
        Some(cur)
    }
}

/// Canonical listing shape shared by the store, the read path and API clients.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct JobListing {
    pub source: String,
    pub external_id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub salary: String,
    pub logo: String,
    pub apply_url: String,
    pub description: String,
    /// Secondary location text some providers send next to `location`.
    #[serde(default)]
    pub job_location: String,
    /// Secondary image URL some providers send next to `logo`.
    #[serde(default)]
    pub image: String,
}

impl JobListing {
    pub fn composite_key(&self) -> String {
        composite_key(&self.source, &self.external_id)
    }
}

/// Stable identity of a listing across runs: `{source}_{external_id}`.
pub fn composite_key(source: &str, external_id: &str) -> String {
    format!("{source}_{external_id}")
}

/// A built-in listing served when no provider yields data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackFixture {
    pub external_id: &'static str,
    pub title: &'static str,
    pub company: &'static str,
    pub location: &'static str,
    pub salary: &'static str,
    pub logo: &'static str,
    pub apply_url: &'static str,
    pub description: &'static str,
}

pub const FALLBACK_FIXTURES: [FallbackFixture; 5] = [
    FallbackFixture {
        external_id: "test_1",
        title: "Frontend Developer",
        company: "TechCorp",
        location: "Remote",
        salary: "$80K - $100K",
        logo: "https://picsum.photos/200",
        apply_url: "https://example.com/apply/1",
        description: "We are looking for a Frontend Developer with experience in React and TypeScript to join our growing team.",
    },
    FallbackFixture {
        external_id: "test_2",
        title: "Backend Engineer",
        company: "DataSystems",
        location: "San Francisco, CA",
        salary: "$100K - $120K",
        logo: "https://picsum.photos/200?random=2",
        apply_url: "https://example.com/apply/2",
        description: "Looking for an experienced backend engineer to help us scale our services.",
    },
    FallbackFixture {
        external_id: "test_3",
        title: "Full Stack Developer",
        company: "WebSolutions",
        location: "New York, NY",
        salary: "$90K - $110K",
        logo: "https://picsum.photos/200?random=3",
        apply_url: "https://example.com/apply/3",
        description: "Join our team as a full stack developer. Experience with React and Node.js required.",
    },
    FallbackFixture {
        external_id: "test_4",
        title: "UX Designer",
        company: "DesignMakers",
        location: "Remote",
        salary: "$75K - $95K",
        logo: "https://picsum.photos/200?random=4",
        apply_url: "https://example.com/apply/4",
        description: "Help us create beautiful and intuitive user experiences for our products.",
    },
    FallbackFixture {
        external_id: "test_5",
        title: "DevOps Engineer",
        company: "CloudTech",
        location: "Austin, TX",
        salary: "$110K - $130K",
        logo: "https://picsum.photos/200?random=5",
        apply_url: "https://example.com/apply/5",
        description: "Looking for a DevOps engineer to help us implement CI/CD pipelines and manage our cloud infrastructure.",
    },
];

impl FallbackFixture {
    /// Raw form fed through normalization when every provider comes back empty.
    pub fn to_raw_record(&self) -> RawRecord {
        let text = |s: &str| JsonValue::String(s.to_string());
        RawRecord::from_pairs([
            (EXTERNAL_ID_KEY, text(self.external_id)),
            (SOURCE_KEY, text(FALLBACK_SOURCE)),
            ("title", text(self.title)),
            ("company", text(self.company)),
            ("location", text(self.location)),
            ("salary", text(self.salary)),
            ("logo", text(self.logo)),
            ("apply_url", text(self.apply_url)),
            ("description", text(self.description)),
        ])
    }

    /// Canonical form served directly by the read path.
    pub fn to_listing(&self) -> JobListing {
        JobListing {
            source: FALLBACK_SOURCE.to_string(),
            external_id: self.external_id.to_string(),
            title: self.title.to_string(),
            company: self.company.to_string(),
            location: self.location.to_string(),
            salary: self.salary.to_string(),
            logo: self.logo.to_string(),
            apply_url: self.apply_url.to_string(),
            description: self.description.to_string(),
            job_location: String::new(),
            image: String::new(),
        }
    }
}

pub fn fallback_raw_records() -> Vec<RawRecord> {
    FALLBACK_FIXTURES.iter().map(FallbackFixture::to_raw_record).collect()
}

pub fn fallback_listings() -> Vec<JobListing> {
    FALLBACK_FIXTURES.iter().map(FallbackFixture::to_listing).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn composite_key_joins_source_and_external_id() {
        let listing = JobListing {
            source: "remoteok".into(),
            external_id: "42".into(),
            ..Default::default()
        };
        assert_eq!(listing.composite_key(), "remoteok_42");
        assert_eq!(composite_key("adzuna", "unknown"), "adzuna_unknown");
    }

    #[test]
    fn fallback_fixtures_are_distinct_test_data_listings() {
        let listings = fallback_listings();
        assert_eq!(listings.len(), 5);
        assert!(listings.iter().all(|l| l.source == FALLBACK_SOURCE));
        let keys: HashSet<_> = listings.iter().map(JobListing::composite_key).collect();
        assert_eq!(keys.len(), 5);
    }

    #[test]
    fn fallback_raw_records_carry_identity_tags() {
        let raw = fallback_raw_records();
        assert_eq!(raw[0].source(), Some(FALLBACK_SOURCE));
        assert_eq!(raw[0].lookup(&[EXTERNAL_ID_KEY]), Some(&json!("test_1")));
    }

    #[test]
    fn raw_record_rejects_non_objects_and_walks_nested_paths() {
        assert!(RawRecord::from_value(json!([1, 2])).is_none());
        let rec = RawRecord::from_value(json!({
            "company": { "display_name": "Acme" },
            "id": 7
        }))
        .unwrap();
        assert_eq!(rec.lookup(&["company", "display_name"]), Some(&json!("Acme")));
        assert_eq!(rec.lookup(&["company", "missing"]), None);
        assert_eq!(rec.lookup(&[]), None);
    }

    #[test]
    fn tag_keeps_existing_external_id_when_none_given() {
        let mut rec = RawRecord::from_pairs([(EXTERNAL_ID_KEY, json!("abc"))]);
        rec.tag("arbeitnow", None);
        assert_eq!(rec.source(), Some("arbeitnow"));
        assert_eq!(rec.lookup(&[EXTERNAL_ID_KEY]), Some(&json!("abc")));
    }

    #[test]
    fn provider_round_trips_through_source_ids() {
        for provider in Provider::ALL {
            assert_eq!(Provider::parse(provider.as_str()), Some(provider));
        }
        assert_eq!(Provider::parse(" RemoteOK "), Some(Provider::RemoteOk));
        assert_eq!(Provider::parse("indeed"), None);
        assert_eq!(serde_json::to_value(Provider::RemoteOk).unwrap(), json!("remoteok"));
    }
}
