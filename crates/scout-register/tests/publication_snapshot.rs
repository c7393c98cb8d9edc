//! Fixture checks against a captured publication page and register snapshot.

use scout_register::{
    extract_attachment_href, extract_last_updated, file_name_from_url, parse_last_updated,
    parse_snapshot, resolve_href, DEFAULT_CRAWL_URL,
};

const PUBLICATION_PAGE: &str = include_str!("fixtures/publication_page.html");
const REGISTER_SNAPSHOT: &str = include_str!("fixtures/register_snapshot.csv");

#[test]
fn publication_page_yields_timestamp_and_attachment_link() {
    let raw = extract_last_updated(PUBLICATION_PAGE).expect("last-updated node");
    assert_eq!(raw, "2025-04-15T09:30:11.000+01:00");
    let last_updated = parse_last_updated(&raw).expect("rfc3339 timestamp");
    assert_eq!(last_updated.to_rfc3339(), "2025-04-15T08:30:11+00:00");

    let href = extract_attachment_href(PUBLICATION_PAGE).expect("attachment link");
    let url = resolve_href(DEFAULT_CRAWL_URL, &href).expect("resolved url");
    assert_eq!(
        url,
        "https://www.gov.uk/media/67fe3d1480f20f8ef0ab71f6/2025-04-15_-_Worker_and_Temporary_Worker.csv"
    );
    assert_eq!(
        file_name_from_url(&url).as_deref(),
        Some("2025-04-15_-_Worker_and_Temporary_Worker.csv")
    );
}

#[test]
fn snapshot_fixture_parses_to_merged_organisations() {
    let organisations = parse_snapshot(REGISTER_SNAPSHOT.as_bytes()).expect("parse");

    let names: Vec<&str> = organisations.iter().map(|org| org.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "0-Hour Cleaning Ltd",
            "1st Call Recruitment, Ltd",
            "20Twenty Care Services",
            "3D Vision Engineering",
        ]
    );

    let recruitment = &organisations[1];
    assert_eq!(recruitment.town_cities, vec!["Norwich"]);
    assert_eq!(
        recruitment.type_and_ratings,
        vec!["Worker (A rating)", "Temporary Worker (A rating)"]
    );
    assert_eq!(recruitment.routes, vec!["Skilled Worker", "Seasonal Worker"]);

    let care = &organisations[2];
    assert_eq!(care.town_cities, vec!["Cardiff", "Newport"]);
    assert_eq!(care.county, "");

    assert!(organisations.iter().all(|org| org.id.is_none()));
}
