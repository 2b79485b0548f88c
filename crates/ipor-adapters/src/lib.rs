//! Source adapter contracts + HTTP-backed clients for the two listing feeds.
//!
//! The primary source serves the listing grid as loosely-typed JSON rows; the
//! secondary source serves a cross-reference report whose company cell is an
//! HTML anchor carrying the detail id and URL slug. Both are validated at
//! this boundary so nothing downstream has to guess at field presence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use ipor_core::{normalize_name, slug_for_url, Category};
use ipor_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "ipor-adapters";

/// Offer-window filter understood by the primary source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFilter {
    Live,
    Upcoming,
    Closed,
}

impl StatusFilter {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusFilter::Live => "live",
            StatusFilter::Upcoming => "upcoming",
            StatusFilter::Closed => "closed",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "live" => Some(StatusFilter::Live),
            "upcoming" => Some(StatusFilter::Upcoming),
            "closed" => Some(StatusFilter::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Malformed(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One row from the primary listings API, exactly as loosely shaped as the
/// source sends it. Numbers arrive as numbers or strings depending on the
/// column and the day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default, deserialize_with = "de_loose_id")]
    pub id: Option<i64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub current_status: Option<String>,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub premium: Option<String>,
    #[serde(default, deserialize_with = "de_loose_string")]
    pub subscription: Option<String>,
    #[serde(default)]
    pub open: Option<String>,
    #[serde(default)]
    pub close: Option<String>,
    #[serde(default)]
    pub allotment_date: Option<String>,
    #[serde(default)]
    pub listing_date: Option<String>,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// A primary-source row that passed boundary validation: it has a usable id
/// and a non-empty name. Text fields may still carry markup.
#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryListing {
    pub id: i64,
    pub name: String,
    pub status: Option<String>,
    pub price_band: Option<String>,
    pub gmp: Option<String>,
    pub subscription: Option<String>,
    pub open: Option<String>,
    pub close: Option<String>,
    pub allotment_date: Option<String>,
    pub listing_date: Option<String>,
    pub image_url: Option<String>,
}

impl RawListing {
    pub fn into_validated(self) -> Result<PrimaryListing, String> {
        let id = match self.id {
            Some(id) if id > 0 => id,
            Some(id) => return Err(format!("non-positive id {id}")),
            None => return Err("missing id".to_string()),
        };
        let name = match self.name {
            Some(name) if !strip_markup(&name).is_empty() => name,
            _ => return Err(format!("missing name on row id {id}")),
        };
        Ok(PrimaryListing {
            id,
            name,
            status: self.current_status,
            price_band: self.price,
            gmp: self.premium,
            subscription: self.subscription,
            open: self.open,
            close: self.close,
            allotment_date: self.allotment_date,
            listing_date: self.listing_date,
            image_url: self.icon_url,
        })
    }
}

/// Supplementary cross-reference data for one offering from the secondary
/// source. Returned keyed by normalized company name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossReference {
    pub details_ipo_id: i64,
    pub url_slug: String,
    pub price_band: Option<String>,
    pub issue_size: Option<String>,
    pub listing_venue: String,
    pub is_sme_venue: bool,
}

#[async_trait]
pub trait PrimarySource: Send + Sync {
    async fn fetch_listings(
        &self,
        category: Category,
        status: StatusFilter,
    ) -> Result<Vec<PrimaryListing>, AdapterError>;
}

#[async_trait]
pub trait SecondarySource: Send + Sync {
    async fn fetch_cross_references(
        &self,
        category: Category,
    ) -> Result<HashMap<String, CrossReference>, AdapterError>;
}

#[async_trait]
pub trait LiveSubscriptionSource: Send + Sync {
    /// Best-effort read of the live "times subscribed" total from a detail
    /// page. `Ok(None)` when the page has no readable total.
    async fn fetch_live_subscription(
        &self,
        id: i64,
        name: &str,
    ) -> Result<Option<String>, AdapterError>;
}

/// Strip tags from a source-provided text fragment.
pub fn strip_markup(input: &str) -> String {
    if !input.contains('<') {
        return input.trim().to_string();
    }
    let fragment = Html::parse_fragment(input);
    fragment
        .root_element()
        .text()
        .collect::<String>()
        .trim()
        .to_string()
}

fn de_loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        JsonValue::String(s) => Some(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }))
}

fn de_loose_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }))
}

#[derive(Debug, Deserialize)]
struct ListingEnvelope {
    data: Vec<JsonValue>,
}

/// Parse the primary listing grid body, skipping rows that fail boundary
/// validation with a logged reason. A body without the expected envelope is
/// malformed and fatal to the caller's batch.
pub fn parse_listing_body(body: &str) -> Result<Vec<PrimaryListing>, AdapterError> {
    let envelope: ListingEnvelope = serde_json::from_str(body)
        .map_err(|err| AdapterError::Malformed(format!("primary listing envelope: {err}")))?;

    let mut listings = Vec::with_capacity(envelope.data.len());
    for value in envelope.data {
        let parsed = serde_json::from_value::<RawListing>(value)
            .map_err(|err| err.to_string())
            .and_then(RawListing::into_validated);
        match parsed {
            Ok(listing) => listings.push(listing),
            Err(reason) => warn!(%reason, "skipping malformed primary listing row"),
        }
    }
    Ok(listings)
}

/// Client for the primary listings API (grid endpoint + per-offering detail
/// pages, same host).
#[derive(Debug, Clone)]
pub struct IpoPremiumClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl IpoPremiumClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn grid_query(category: Category, status: StatusFilter, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        vec![
            ("draw", "2".to_string()),
            ("start", "0".to_string()),
            ("length", "1000".to_string()),
            ("search[value]", String::new()),
            ("search[regex]", "false".to_string()),
            ("all", "true".to_string()),
            ("eq", (category == Category::Mainboard).to_string()),
            ("sme", (category == Category::Sme).to_string()),
            ("upcoming_ipos", (status == StatusFilter::Upcoming).to_string()),
            ("open_ipos", (status == StatusFilter::Live).to_string()),
            ("closed_ipos", (status == StatusFilter::Closed).to_string()),
            // cache buster, same as the browser grid sends
            ("_", now.timestamp_millis().to_string()),
        ]
    }
}

#[async_trait]
impl PrimarySource for IpoPremiumClient {
    async fn fetch_listings(
        &self,
        category: Category,
        status: StatusFilter,
    ) -> Result<Vec<PrimaryListing>, AdapterError> {
        let url = format!("{}/ipo", self.base_url);
        let referer = url.clone();
        let headers = [
            ("Accept", "application/json, text/plain, */*"),
            ("Referer", referer.as_str()),
            ("X-Requested-With", "XMLHttpRequest"),
        ];
        let query = Self::grid_query(category, status, Utc::now());
        let body = self.http.get_text(&url, &query, &headers).await?;
        parse_listing_body(&body)
    }
}

#[async_trait]
impl LiveSubscriptionSource for IpoPremiumClient {
    async fn fetch_live_subscription(
        &self,
        id: i64,
        name: &str,
    ) -> Result<Option<String>, AdapterError> {
        let url = format!("{}/view/ipo/{}/{}", self.base_url, id, slug_for_url(name));
        let html = self.http.get_text(&url, &[], &[]).await?;
        Ok(parse_subscription_total(&html))
    }
}

/// Walk the detail page's subscription table for the row whose header cell
/// reads "Total" and return its closing bold figure, provided it leads with
/// a number.
pub fn parse_subscription_total(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let bold = Selector::parse("b").ok()?;
    let cell = Selector::parse("td").ok()?;

    let total_header = document
        .select(&bold)
        .find(|node| node.text().collect::<String>().trim() == "Total")?;

    let row = enclosing_row(total_header)?;
    let last_cell = row.select(&cell).last()?;
    let value = last_cell
        .select(&bold)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();

    leading_number(&value).map(|_| value)
}

fn enclosing_row(node: ElementRef<'_>) -> Option<ElementRef<'_>> {
    let mut current = node.parent();
    while let Some(parent) = current {
        if let Some(element) = ElementRef::wrap(parent) {
            if element.value().name() == "tr" {
                return Some(element);
            }
        }
        current = parent.parent();
    }
    None
}

fn leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    let len = trimmed
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    if len == 0 {
        return None;
    }
    trimmed[..len].parse::<f64>().ok().filter(|v| v.is_finite())
}

#[derive(Debug, Deserialize)]
struct ReportEnvelope {
    #[serde(rename = "reportTableData")]
    report_table_data: Vec<ReportRow>,
}

#[derive(Debug, Deserialize)]
struct ReportRow {
    #[serde(rename = "Company")]
    company: Option<String>,
    #[serde(rename = "Issue Price (Rs.)", default, deserialize_with = "de_loose_string")]
    issue_price: Option<String>,
    #[serde(
        rename = "Total Issue Amount (Incl.Firm reservations) (Rs.cr.)",
        default,
        deserialize_with = "de_loose_string"
    )]
    issue_size: Option<String>,
    #[serde(rename = "Listing at")]
    listing_at: Option<String>,
}

/// Parse the secondary report body into a normalized-name keyed map.
/// Rows whose company cell cannot be decomposed are skipped with a reason.
pub fn parse_report_body(body: &str) -> Result<HashMap<String, CrossReference>, AdapterError> {
    let envelope: ReportEnvelope = serde_json::from_str(body)
        .map_err(|err| AdapterError::Malformed(format!("secondary report envelope: {err}")))?;

    let mut references = HashMap::with_capacity(envelope.report_table_data.len());
    for row in envelope.report_table_data {
        let Some(company_cell) = row.company.as_deref() else {
            continue;
        };
        let Some((name, url_slug, details_ipo_id)) = parse_company_cell(company_cell) else {
            warn!(cell = company_cell, "skipping secondary row with unparsable company cell");
            continue;
        };
        let listing_venue = row.listing_at.unwrap_or_default().to_lowercase();
        let is_sme_venue = listing_venue.contains("sme");
        references.insert(
            normalize_name(&name),
            CrossReference {
                details_ipo_id,
                url_slug,
                price_band: row.issue_price,
                issue_size: row.issue_size,
                listing_venue,
                is_sme_venue,
            },
        );
    }
    Ok(references)
}

/// Pull the display name plus the `/ipo/<slug>/<id>/` pieces out of the
/// anchor markup in the secondary report's company cell.
fn parse_company_cell(html: &str) -> Option<(String, String, i64)> {
    let fragment = Html::parse_fragment(html);
    let anchor_selector = Selector::parse("a[href]").ok()?;
    let anchor = fragment.select(&anchor_selector).next()?;
    let name = anchor.text().collect::<String>().trim().to_string();
    if name.is_empty() {
        return None;
    }
    let (slug, id) = parse_detail_href(anchor.value().attr("href")?)?;
    Some((name, slug, id))
}

fn parse_detail_href(href: &str) -> Option<(String, i64)> {
    let rest = &href[href.find("/ipo/")? + "/ipo/".len()..];
    let mut segments = rest.split('/');
    let slug = segments.next()?.to_string();
    let id = segments.next()?.parse::<i64>().ok()?;
    if slug.is_empty() {
        return None;
    }
    Some((slug, id))
}

/// Client for the secondary cross-reference report.
#[derive(Debug, Clone)]
pub struct ChittorgarhClient {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ChittorgarhClient {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// The report path encodes the calendar year, the Indian financial year
    /// (April to March), and a cache-busting version stamp.
    fn report_url(&self, category: Category, now: DateTime<Utc>) -> String {
        let year = now.year();
        let (fy_start, fy_end) = if now.month() < 4 {
            (year - 1, year)
        } else {
            (year, year + 1)
        };
        let financial_year = format!("{fy_start}-{:02}", fy_end % 100);
        let category_id = match category {
            Category::Mainboard => 82,
            Category::Sme => 83,
        };
        format!(
            "{}/cloud/report/data-read/{category_id}/1/8/{year}/{financial_year}/0/all/0?search=&v={}",
            self.base_url,
            now.timestamp()
        )
    }
}

#[async_trait]
impl SecondarySource for ChittorgarhClient {
    async fn fetch_cross_references(
        &self,
        category: Category,
    ) -> Result<HashMap<String, CrossReference>, AdapterError> {
        let url = self.report_url(category, Utc::now());
        let body = self.http.get_text(&url, &[], &[]).await?;
        parse_report_body(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_body_skips_malformed_rows_but_keeps_valid_ones() {
        let body = r#"{
            "data": [
                {"id": 501, "name": "Beta Tech IPO", "current_status": "open",
                 "open": "2025-06-01", "price": "100-105", "subscription": 4.2},
                {"name": "No Id Industries"},
                {"id": "502", "name": "<b>Gamma Foods</b>", "premium": 55}
            ]
        }"#;
        let listings = parse_listing_body(body).unwrap();
        assert_eq!(listings.len(), 2);

        assert_eq!(listings[0].id, 501);
        assert_eq!(listings[0].subscription.as_deref(), Some("4.2"));
        assert_eq!(listings[0].price_band.as_deref(), Some("100-105"));

        assert_eq!(listings[1].id, 502);
        assert_eq!(listings[1].name, "<b>Gamma Foods</b>");
        assert_eq!(listings[1].gmp.as_deref(), Some("55"));
    }

    #[test]
    fn listing_body_without_envelope_is_malformed() {
        assert!(matches!(
            parse_listing_body(r#"{"error": "blocked"}"#),
            Err(AdapterError::Malformed(_))
        ));
        assert!(matches!(
            parse_listing_body("<html>maintenance</html>"),
            Err(AdapterError::Malformed(_))
        ));
    }

    #[test]
    fn company_cell_yields_name_slug_and_id() {
        let cell = r#"<a href="https://example.com/ipo/alpha-industries/4512/" target="_blank">Alpha Industries</a> <span class="badge">SME</span>"#;
        let (name, slug, id) = parse_company_cell(cell).unwrap();
        assert_eq!(name, "Alpha Industries");
        assert_eq!(slug, "alpha-industries");
        assert_eq!(id, 4512);
    }

    #[test]
    fn company_cell_without_detail_link_is_rejected() {
        assert!(parse_company_cell("<span>Plain Text Co</span>").is_none());
        assert!(parse_company_cell(r#"<a href="/news/123/">Alpha</a>"#).is_none());
        assert!(parse_company_cell(r#"<a href="/ipo//99/">Alpha</a>"#).is_none());
    }

    #[test]
    fn report_body_keys_by_normalized_name() {
        let body = r#"{
            "reportTableData": [
                {"Company": "<a href=\"/ipo/alpha-industries/4512/\">Alpha Industries Ltd</a>",
                 "Issue Price (Rs.)": "100 to 105",
                 "Total Issue Amount (Incl.Firm reservations) (Rs.cr.)": 120.5,
                 "Listing at": "BSE SME"},
                {"Company": "<span>no link</span>"}
            ]
        }"#;
        let map = parse_report_body(body).unwrap();
        assert_eq!(map.len(), 1);
        let reference = &map["alpha industries"];
        assert_eq!(reference.details_ipo_id, 4512);
        assert_eq!(reference.url_slug, "alpha-industries");
        assert_eq!(reference.issue_size.as_deref(), Some("120.5"));
        assert!(reference.is_sme_venue);
    }

    #[test]
    fn subscription_total_reads_the_total_row() {
        let html = r#"
            <table>
              <tr><td><b>Retail</b></td><td><b>2.10</b></td></tr>
              <tr><td><b>Total</b></td><td><b>4.25</b></td></tr>
            </table>"#;
        assert_eq!(parse_subscription_total(html).as_deref(), Some("4.25"));
    }

    #[test]
    fn subscription_total_requires_a_numeric_figure() {
        let pending = r#"<table><tr><td><b>Total</b></td><td><b>awaited</b></td></tr></table>"#;
        assert_eq!(parse_subscription_total(pending), None);
        assert_eq!(parse_subscription_total("<p>no table here</p>"), None);
    }

    #[test]
    fn report_url_rolls_the_financial_year_in_april() {
        let http = Arc::new(
            HttpFetcher::new(ipor_storage::HttpClientConfig::default()).unwrap(),
        );
        let client = ChittorgarhClient::new(http, "https://secondary.example");

        let february = "2026-02-10T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let url = client.report_url(Category::Mainboard, february);
        assert!(url.contains("/82/1/8/2026/2025-26/"), "{url}");

        let june = "2026-06-10T09:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let url = client.report_url(Category::Sme, june);
        assert!(url.contains("/83/1/8/2026/2026-27/"), "{url}");
    }

    #[test]
    fn strip_markup_flattens_fragments() {
        assert_eq!(strip_markup("<b>Beta</b> Tech"), "Beta Tech");
        assert_eq!(strip_markup("  plain  "), "plain");
    }
}
