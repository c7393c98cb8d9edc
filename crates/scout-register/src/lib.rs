//! Register publication adapter: page scraping and snapshot parsing.
//!
//! The register is published as a gov.uk attachment page. This crate scrapes
//! the page for the attachment link and last-updated timestamp, downloads the
//! delimited snapshot, and parses it into canonical [`Organisation`] records,
//! merging duplicate rows that share an organisation name.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use csv::ReaderBuilder;
use scout_core::{Organisation, RunError, RunRecord};
use scout_storage::HttpFetcher;
use scraper::{Html, Selector};
use thiserror::Error;
use url::Url;

pub const CRATE_NAME: &str = "scout-register";

/// Publication page for the worker/temporary-worker sponsor register.
pub const DEFAULT_CRAWL_URL: &str =
    "https://www.gov.uk/government/publications/register-of-licensed-sponsors-workers";

const ATTACHMENT_LINK_SELECTOR: &str = "a.gem-c-attachment__link";
const LAST_UPDATED_SELECTOR: &str = "time.gem-c-published-dates__change-date.timestamp";

const NAME_HEADER: &str = "Organisation Name";
const TOWN_CITY_HEADER: &str = "Town/City";
const COUNTY_HEADER: &str = "County";
const TYPE_AND_RATING_HEADER: &str = "Type & Rating";
const ROUTE_HEADER: &str = "Route";

#[derive(Debug, Error)]
pub enum SnapshotParseError {
    #[error("snapshot bytes are not valid UTF-8 text")]
    NotText(#[from] std::str::Utf8Error),
}

#[derive(Debug, Clone, Copy, Default)]
struct HeaderIndexes {
    name: Option<usize>,
    town_city: Option<usize>,
    county: Option<usize>,
    type_and_rating: Option<usize>,
    route: Option<usize>,
}

fn map_headers(headers: &csv::StringRecord) -> HeaderIndexes {
    let mut indexes = HeaderIndexes::default();
    for (i, header) in headers.iter().enumerate() {
        match header.trim() {
            NAME_HEADER => indexes.name = indexes.name.or(Some(i)),
            TOWN_CITY_HEADER => indexes.town_city = indexes.town_city.or(Some(i)),
            COUNTY_HEADER => indexes.county = indexes.county.or(Some(i)),
            TYPE_AND_RATING_HEADER => {
                indexes.type_and_rating = indexes.type_and_rating.or(Some(i))
            }
            ROUTE_HEADER => indexes.route = indexes.route.or(Some(i)),
            _ => {}
        }
    }
    indexes
}

fn field_at<'r>(record: &'r csv::StringRecord, index: Option<usize>) -> &'r str {
    index.and_then(|i| record.get(i)).unwrap_or("").trim()
}

fn push_unique(values: &mut Vec<String>, value: &str) {
    if !values.iter().any(|existing| existing == value) {
        values.push(value.to_string());
    }
}

/// Parse snapshot bytes into one canonical organisation per distinct trimmed
/// name.
///
/// Rows sharing a name are merged: the county comes from the group's first
/// row, and town/city, type-and-rating, and route values are deduplicated
/// with first-occurrence order preserved. Header reordering is tolerated,
/// unknown columns are ignored, and rows the reader cannot surface are
/// skipped rather than aborting the parse. The only error is content that is
/// not text at all.
pub fn parse_snapshot(bytes: &[u8]) -> Result<Vec<Organisation>, SnapshotParseError> {
    let text = std::str::from_utf8(bytes)?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());
    let indexes = match reader.headers() {
        Ok(headers) => map_headers(headers),
        Err(_) => HeaderIndexes::default(),
    };

    let mut by_name: HashMap<String, usize> = HashMap::new();
    let mut organisations: Vec<Organisation> = Vec::new();

    for record in reader.records() {
        let Ok(record) = record else {
            continue;
        };
        let name = field_at(&record, indexes.name);
        let slot = match by_name.get(name) {
            Some(&slot) => slot,
            None => {
                let mut organisation = Organisation::new(name);
                organisation.county = field_at(&record, indexes.county).to_string();
                organisations.push(organisation);
                by_name.insert(name.to_string(), organisations.len() - 1);
                organisations.len() - 1
            }
        };

        let organisation = &mut organisations[slot];
        push_unique(&mut organisation.town_cities, field_at(&record, indexes.town_city));
        push_unique(
            &mut organisation.type_and_ratings,
            field_at(&record, indexes.type_and_rating),
        );
        push_unique(&mut organisation.routes, field_at(&record, indexes.route));
    }

    Ok(organisations)
}

fn attr_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn select_first_attr(html: &str, selector: &str, attr: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(selector).ok()?;
    document
        .select(&sel)
        .next()
        .and_then(|node| node.value().attr(attr))
        .and_then(attr_or_none)
}

/// Raw `datetime` attribute of the publication's change-date node.
pub fn extract_last_updated(html: &str) -> Option<String> {
    select_first_attr(html, LAST_UPDATED_SELECTOR, "datetime")
}

/// `href` of the first attachment link on the publication page.
pub fn extract_attachment_href(html: &str) -> Option<String> {
    select_first_attr(html, ATTACHMENT_LINK_SELECTOR, "href")
}

pub fn parse_last_updated(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value.trim()).map(|parsed| parsed.with_timezone(&Utc))
}

/// Resolve an attachment href against the page it was scraped from. gov.uk
/// attachment links are frequently site-relative.
pub fn resolve_href(page_url: &str, href: &str) -> Result<String, url::ParseError> {
    let base = Url::parse(page_url)?;
    Ok(base.join(href)?.to_string())
}

/// Last non-empty path segment of a snapshot URL, used as the logical file
/// name for storage keys and resume matching.
pub fn file_name_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()
        .map(ToString::to_string)
}

/// Freshness and link discovery against the register's publication page.
///
/// Failures are written into the run record's error list and surfaced to the
/// caller as `None`; the orchestrator decides what an absent result means.
#[async_trait]
pub trait RegisterSource: Send + Sync {
    async fn source_last_updated(&self, run: &mut RunRecord) -> Option<DateTime<Utc>>;
    async fn attachment_url(&self, run: &mut RunRecord) -> Option<String>;
}

/// Raw snapshot byte fetch. Same error convention as [`RegisterSource`].
#[async_trait]
pub trait SnapshotDownload: Send + Sync {
    async fn download(&self, url: &str, run: &mut RunRecord) -> Option<Vec<u8>>;
}

/// Live implementation of both register contracts against a gov.uk
/// publication page.
pub struct RegisterPage {
    http: HttpFetcher,
    page_url: String,
}

impl RegisterPage {
    pub fn new(http: HttpFetcher, page_url: impl Into<String>) -> Self {
        Self {
            http,
            page_url: page_url.into(),
        }
    }

    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    async fn fetch_page(&self, run: &mut RunRecord, origin: &str) -> Option<String> {
        match self.http.fetch(&self.page_url).await {
            Ok(response) => Some(response.text()),
            Err(err) => {
                run.record_error(RunError::new(
                    origin,
                    format!("fetching {}: {err}", self.page_url),
                ));
                None
            }
        }
    }
}

#[async_trait]
impl RegisterSource for RegisterPage {
    async fn source_last_updated(&self, run: &mut RunRecord) -> Option<DateTime<Utc>> {
        let html = self.fetch_page(run, "source_last_updated").await?;
        let Some(raw) = extract_last_updated(&html) else {
            run.record_error(RunError::new(
                "source_last_updated",
                "last-updated node not found",
            ));
            return None;
        };
        match parse_last_updated(&raw) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                run.record_error(RunError::new(
                    "source_last_updated",
                    format!("unparseable last-updated timestamp {raw:?}: {err}"),
                ));
                None
            }
        }
    }

    async fn attachment_url(&self, run: &mut RunRecord) -> Option<String> {
        let html = self.fetch_page(run, "attachment_url").await?;
        let Some(href) = extract_attachment_href(&html) else {
            run.record_error(RunError::new(
                "attachment_url",
                "attachment link node not found",
            ));
            return None;
        };
        match resolve_href(&self.page_url, &href) {
            Ok(url) => Some(url),
            Err(err) => {
                run.record_error(RunError::new(
                    "attachment_url",
                    format!("resolving attachment href {href:?}: {err}"),
                ));
                None
            }
        }
    }
}

#[async_trait]
impl SnapshotDownload for RegisterPage {
    async fn download(&self, url: &str, run: &mut RunRecord) -> Option<Vec<u8>> {
        match self.http.fetch(url).await {
            Ok(response) => Some(response.body),
            Err(err) => {
                run.record_error(RunError::new(
                    "download_snapshot",
                    format!("downloading {url}: {err}"),
                ));
                None
            }
        }
    }
}
