use std::path::PathBuf;

use jobfeed_adapters::{
    adapter_for_source, normalize_all, AdapterSettings, SourceAdapter,
};
use jobfeed_core::JobListing;
use serde_json::Value as JsonValue;

fn fixture(source: &str) -> JsonValue {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(source)
        .join("listing.json");
    let body = std::fs::read_to_string(&path).expect("fixture readable");
    serde_json::from_str(&body).expect("fixture is valid json")
}

fn parse_fixture(source: &str) -> Vec<JobListing> {
    let settings = AdapterSettings {
        adzuna_app_id: Some("fixture-id".into()),
        adzuna_app_key: Some("fixture-key".into()),
        ..Default::default()
    };
    let adapter = adapter_for_source(source, &settings).expect("known source");
    let records = adapter.parse_listing(fixture(source)).expect("fixture parses");
    normalize_all(&records)
}

#[test]
fn remoteok_fixture_normalizes() {
    let jobs = parse_fixture("remoteok");
    assert_eq!(jobs.len(), 2);

    let first = &jobs[0];
    assert_eq!(first.composite_key(), "remoteok_1093211");
    assert_eq!(first.title, "Senior Rust Engineer");
    assert_eq!(first.company, "Ferrous Labs");
    assert_eq!(first.location, "Worldwide");
    assert_eq!(first.salary, "140000");
    assert!(!first.apply_url.is_empty());

    let second = &jobs[1];
    assert_eq!(second.external_id, "1093188");
    assert_eq!(second.company, "Helpwise");
    assert!(second.location.is_empty());
    assert!(second.logo.is_empty());
    assert!(second.salary.is_empty());
    assert!(!second.image.is_empty());
}

#[test]
fn arbeitnow_fixture_normalizes() {
    let jobs = parse_fixture("arbeitnow");
    let keys: Vec<_> = jobs.iter().map(JobListing::composite_key).collect();
    assert_eq!(
        keys,
        vec![
            "arbeitnow_platform-engineer-berlin-cloudwerk-204411",
            "arbeitnow_data-analyst-hamburg-nordstat-204398",
        ]
    );
    assert_eq!(jobs[0].title, "Platform Engineer (m/w/d)");
    assert_eq!(jobs[0].company, "Cloudwerk GmbH");
    assert_eq!(jobs[1].location, "Hamburg");
}

#[test]
fn adzuna_fixture_normalizes_nested_fields() {
    let jobs = parse_fixture("adzuna");
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].composite_key(), "adzuna_4921873310");
    assert_eq!(jobs[0].company, "Northwind Logistics");
    assert_eq!(jobs[0].location, "Columbus, Franklin County");
    assert_eq!(jobs[0].salary, "52000");
    assert!(jobs[0].apply_url.starts_with("http"));

    assert_eq!(jobs[1].external_id, "4921870027");
    assert_eq!(jobs[1].company, "St. Mary Health");
    assert_eq!(jobs[1].location, "Denver, Colorado");
}
