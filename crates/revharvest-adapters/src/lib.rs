//! Fetch-capability contracts + booking-site and fixture review sources.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use revharvest_core::{resolve_hotel_name, RawReview};
use revharvest_storage::{FetchError, HttpClientConfig, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

mod extract;

pub use extract::{
    extract_hotel, extract_hotel_since, ExtractError, ExtractLimits, HotelExtraction,
    HotelReviewCursor, OrderingPolicy, StopReason,
};

pub const CRATE_NAME: &str = "revharvest-adapters";

/// A hotel to crawl: its review listing URL and the name used for watermark lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotelTarget {
    pub name: String,
    pub url: String,
}

impl HotelTarget {
    /// Normalizes the URL scheme and falls back to a URL-derived name.
    pub fn from_url(url: &str, name: Option<&str>) -> Self {
        let url = normalize_hotel_url(url);
        let name = resolve_hotel_name(name, Some(&url));
        Self { name, url }
    }
}

/// Prefixes scheme-less URLs (`site.com/...`) with `https://www.`.
pub fn normalize_hotel_url(raw: &str) -> String {
    let url = raw.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else if let Some(rest) = url.strip_prefix("www.") {
        format!("https://www.{rest}")
    } else {
        format!("https://www.{url}")
    }
}

/// One page of a hotel's review listing, in site order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ReviewPage {
    pub hotel_name: Option<String>,
    pub reviews: Vec<RawReview>,
    pub has_next: bool,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// An open page-fetch session (HTTP client, rendering browser, fixtures).
///
/// Sessions are used by one crawl at a time and must be closed by their owner.
#[async_trait]
pub trait ReviewSource: Send {
    fn source_id(&self) -> &'static str;

    async fn discover_hotels(
        &mut self,
        entry_point: &str,
        max_hotels: usize,
    ) -> Result<Vec<HotelTarget>, AdapterError>;

    /// `page` is 1-based.
    async fn fetch_review_page(
        &mut self,
        hotel: &HotelTarget,
        page: usize,
    ) -> Result<ReviewPage, AdapterError>;

    async fn close(&mut self) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Starts a [`ReviewSource`]; a launch failure is fatal to a crawl run.
#[async_trait]
pub trait SourceLauncher: Send + Sync {
    async fn launch(&self) -> Result<Box<dyn ReviewSource>, AdapterError>;
}

/// CSS selectors for the booking site's listing and review pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteSelectors {
    pub listing_hotel_link: String,
    pub hotel_name: String,
    pub review_card: String,
    pub reviewer_name: String,
    pub reviewer_country: String,
    pub reviewer_score: String,
    pub review_title: String,
    pub review_text: String,
    pub review_date: String,
    pub room_type: String,
    pub stay_duration: String,
    pub traveler_type: String,
    pub next_page: String,
    pub review_page_param: String,
}

impl Default for SiteSelectors {
    fn default() -> Self {
        Self {
            listing_hotel_link: r#"a[data-selenium="hotel-name"]"#.to_string(),
            hotel_name: r#"h1[data-selenium="hotel-header-name"]"#.to_string(),
            review_card: ".Review-comment".to_string(),
            reviewer_name: ".Review-comment-reviewer strong".to_string(),
            reviewer_country: r#"[data-info-type="reviewer-country"]"#.to_string(),
            reviewer_score: ".Review-comment-leftScore".to_string(),
            review_title: ".Review-comment-bodyTitle".to_string(),
            review_text: ".Review-comment-bodyText".to_string(),
            review_date: ".Review-statusBar-date".to_string(),
            room_type: r#"[data-info-type="room-type"]"#.to_string(),
            stay_duration: r#"[data-info-type="stay-detail"]"#.to_string(),
            traveler_type: r#"[data-info-type="group-name"]"#.to_string(),
            next_page: r#"[data-element-name="review-paginator-next"]"#.to_string(),
            review_page_param: "reviewPage".to_string(),
        }
    }
}

impl SiteSelectors {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn compile(&self) -> Result<CompiledSelectors, AdapterError> {
        Ok(CompiledSelectors {
            listing_hotel_link: parse_selector(&self.listing_hotel_link)?,
            hotel_name: parse_selector(&self.hotel_name)?,
            review_card: parse_selector(&self.review_card)?,
            reviewer_name: parse_selector(&self.reviewer_name)?,
            reviewer_country: parse_selector(&self.reviewer_country)?,
            reviewer_score: parse_selector(&self.reviewer_score)?,
            review_title: parse_selector(&self.review_title)?,
            review_text: parse_selector(&self.review_text)?,
            review_date: parse_selector(&self.review_date)?,
            room_type: parse_selector(&self.room_type)?,
            stay_duration: parse_selector(&self.stay_duration)?,
            traveler_type: parse_selector(&self.traveler_type)?,
            next_page: parse_selector(&self.next_page)?,
            review_page_param: self.review_page_param.clone(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    listing_hotel_link: Selector,
    hotel_name: Selector,
    review_card: Selector,
    reviewer_name: Selector,
    reviewer_country: Selector,
    reviewer_score: Selector,
    review_title: Selector,
    review_text: Selector,
    review_date: Selector,
    room_type: Selector,
    stay_duration: Selector,
    traveler_type: Selector,
    next_page: Selector,
    review_page_param: String,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector)
        .map_err(|e| AdapterError::Message(format!("invalid selector {selector:?}: {e}")))
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(element: ElementRef<'_>, selector: &Selector) -> Option<String> {
    element
        .select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

/// First decimal number in `text` ("Exceptional 9,2" → 9.2).
fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if (ch == '.' || ch == ',') && !seen_dot && !current.is_empty() {
            current.push('.');
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.trim_end_matches('.').parse::<f64>().ok()
}

fn score_value(text: Option<String>) -> Option<JsonValue> {
    let text = text?;
    match first_number(&text).and_then(serde_json::Number::from_f64) {
        Some(n) => Some(JsonValue::Number(n)),
        None => Some(JsonValue::String(text)),
    }
}

fn origin_of(url: &str) -> &str {
    let Some(scheme_end) = url.find("://") else {
        return url;
    };
    let host_start = scheme_end + 3;
    match url[host_start..].find('/') {
        Some(idx) => &url[..host_start + idx],
        None => url,
    }
}

fn absolute_url(base_url: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{rest}")
    } else if href.starts_with('/') {
        format!("{}{}", origin_of(base_url), href)
    } else {
        format!("{}/{}", origin_of(base_url), href)
    }
}

/// URL of the `page`-th review page; page 1 is the hotel URL itself.
pub fn review_page_url(hotel_url: &str, param: &str, page: usize) -> String {
    if page <= 1 {
        return hotel_url.to_string();
    }
    let sep = if hotel_url.contains('?') { '&' } else { '?' };
    format!("{hotel_url}{sep}{param}={page}")
}

/// Hotel links of a search/listing page, deduplicated by URL, in page order.
pub fn parse_listing_page(
    html: &str,
    base_url: &str,
    selectors: &CompiledSelectors,
    max_hotels: usize,
) -> Vec<HotelTarget> {
    let document = Html::parse_document(html);
    let mut targets: Vec<HotelTarget> = Vec::new();
    for link in document.select(&selectors.listing_hotel_link) {
        if targets.len() >= max_hotels {
            break;
        }
        let Some(href) = link.value().attr("href").map(str::trim).filter(|h| !h.is_empty())
        else {
            continue;
        };
        let url = absolute_url(base_url, href);
        if targets.iter().any(|t| t.url == url) {
            continue;
        }
        let name = text_or_none(link.text().collect::<String>());
        targets.push(HotelTarget::from_url(&url, name.as_deref()));
    }
    targets
}

/// Review cards of one hotel review page; missing fields are left empty for the normalizer.
pub fn parse_review_page(html: &str, selectors: &CompiledSelectors) -> ReviewPage {
    let document = Html::parse_document(html);
    let root = document.root_element();
    let hotel_name = first_text(root, &selectors.hotel_name);
    let reviews = document
        .select(&selectors.review_card)
        .map(|card| RawReview {
            hotel_name: hotel_name.clone(),
            reviewer_name: first_text(card, &selectors.reviewer_name),
            reviewer_score: score_value(first_text(card, &selectors.reviewer_score)),
            review_text: first_text(card, &selectors.review_text),
            review_title: first_text(card, &selectors.review_title),
            review_date: first_text(card, &selectors.review_date),
            room_type: first_text(card, &selectors.room_type),
            stay_duration: first_text(card, &selectors.stay_duration),
            country: None,
            reviewer_country: first_text(card, &selectors.reviewer_country),
            traveler_type: first_text(card, &selectors.traveler_type),
        })
        .collect::<Vec<_>>();
    let has_next = root.select(&selectors.next_page).next().is_some_and(|el| {
        el.value().attr("disabled").is_none()
            && el.value().attr("aria-disabled") != Some("true")
    });
    ReviewPage {
        hotel_name,
        reviews,
        has_next,
    }
}

/// Live booking-site source over HTTP, optionally through a rendering service.
pub struct HtmlReviewSource {
    http: HttpFetcher,
    selectors: CompiledSelectors,
}

#[async_trait]
impl ReviewSource for HtmlReviewSource {
    fn source_id(&self) -> &'static str {
        "booking-site-html"
    }

    async fn discover_hotels(
        &mut self,
        entry_point: &str,
        max_hotels: usize,
    ) -> Result<Vec<HotelTarget>, AdapterError> {
        let page = self.http.fetch_text(entry_point).await?;
        let targets = parse_listing_page(&page.body, &page.final_url, &self.selectors, max_hotels);
        info!(entry_point, hotels = targets.len(), "discovered hotels");
        Ok(targets)
    }

    async fn fetch_review_page(
        &mut self,
        hotel: &HotelTarget,
        page: usize,
    ) -> Result<ReviewPage, AdapterError> {
        let url = review_page_url(&hotel.url, &self.selectors.review_page_param, page);
        let fetched = self.http.fetch_text(&url).await?;
        let parsed = parse_review_page(&fetched.body, &self.selectors);
        debug!(hotel = %hotel.name, page, reviews = parsed.reviews.len(), "fetched review page");
        Ok(parsed)
    }
}

pub struct HtmlSourceLauncher {
    http: HttpClientConfig,
    selectors: SiteSelectors,
}

impl HtmlSourceLauncher {
    pub fn new(http: HttpClientConfig, selectors: SiteSelectors) -> Self {
        Self { http, selectors }
    }
}

#[async_trait]
impl SourceLauncher for HtmlSourceLauncher {
    async fn launch(&self) -> Result<Box<dyn ReviewSource>, AdapterError> {
        let selectors = self.selectors.compile()?;
        let http = HttpFetcher::new(self.http.clone())?;
        http.ready().await?;
        Ok(Box::new(HtmlReviewSource { http, selectors }))
    }
}

/// Recorded site used for offline runs and tests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureSite {
    #[serde(default)]
    pub listing: Vec<HotelTarget>,
    #[serde(default)]
    pub hotels: BTreeMap<String, FixtureHotel>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureHotel {
    #[serde(default)]
    pub hotel_name: Option<String>,
    #[serde(default)]
    pub pages: Vec<Vec<RawReview>>,
    /// Fetching this page (1-based) or any later one fails.
    #[serde(default)]
    pub fail_from_page: Option<usize>,
}

pub fn load_fixture_site(path: impl AsRef<Path>) -> Result<FixtureSite> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

pub struct FixtureReviewSource {
    site: FixtureSite,
    pages_fetched: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl FixtureReviewSource {
    pub fn new(site: FixtureSite) -> Self {
        Self {
            site,
            pages_fetched: Arc::new(AtomicUsize::new(0)),
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched.load(Ordering::SeqCst)
    }

    pub fn site_mut(&mut self) -> &mut FixtureSite {
        &mut self.site
    }
}

#[async_trait]
impl ReviewSource for FixtureReviewSource {
    fn source_id(&self) -> &'static str {
        "fixture"
    }

    async fn discover_hotels(
        &mut self,
        _entry_point: &str,
        max_hotels: usize,
    ) -> Result<Vec<HotelTarget>, AdapterError> {
        Ok(self.site.listing.iter().take(max_hotels).cloned().collect())
    }

    async fn fetch_review_page(
        &mut self,
        hotel: &HotelTarget,
        page: usize,
    ) -> Result<ReviewPage, AdapterError> {
        self.pages_fetched.fetch_add(1, Ordering::SeqCst);
        let fixture = self.site.hotels.get(&hotel.url).ok_or_else(|| {
            AdapterError::Message(format!("navigation failed: no page at {}", hotel.url))
        })?;
        if fixture.fail_from_page.is_some_and(|p| page >= p) {
            return Err(AdapterError::Message(format!(
                "navigation failed: {} page {page}",
                hotel.url
            )));
        }
        let reviews = page
            .checked_sub(1)
            .and_then(|idx| fixture.pages.get(idx))
            .cloned()
            .unwrap_or_default();
        Ok(ReviewPage {
            hotel_name: fixture.hotel_name.clone(),
            reviews,
            has_next: page < fixture.pages.len(),
        })
    }

    async fn close(&mut self) -> Result<(), AdapterError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Launches [`FixtureReviewSource`]s and counts how many sessions were closed.
#[derive(Debug, Clone, Default)]
pub struct FixtureLauncher {
    site: FixtureSite,
    fail_launch: bool,
    closes: Arc<AtomicUsize>,
}

impl FixtureLauncher {
    pub fn new(site: FixtureSite) -> Self {
        Self {
            site,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_launch: true,
            ..Default::default()
        }
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceLauncher for FixtureLauncher {
    async fn launch(&self) -> Result<Box<dyn ReviewSource>, AdapterError> {
        if self.fail_launch {
            return Err(AdapterError::Message(
                "fixture launcher configured to fail".to_string(),
            ));
        }
        let mut source = FixtureReviewSource::new(self.site.clone());
        source.closes = Arc::clone(&self.closes);
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_less_urls_get_https_www() {
        assert_eq!(
            normalize_hotel_url(" site.com/blue-bay/hotel/x.html "),
            "https://www.site.com/blue-bay/hotel/x.html"
        );
        assert_eq!(
            normalize_hotel_url("www.site.com/a"),
            "https://www.site.com/a"
        );
        assert_eq!(normalize_hotel_url("http://site.com/a"), "http://site.com/a");
        let target = HotelTarget::from_url("site.com/blue-bay/hotel/x.html", None);
        assert_eq!(target.name, "Blue Bay");
    }

    #[test]
    fn review_page_urls_append_the_page_parameter() {
        assert_eq!(review_page_url("https://s.com/h", "reviewPage", 1), "https://s.com/h");
        assert_eq!(
            review_page_url("https://s.com/h", "reviewPage", 2),
            "https://s.com/h?reviewPage=2"
        );
        assert_eq!(
            review_page_url("https://s.com/h?cid=1", "reviewPage", 3),
            "https://s.com/h?cid=1&reviewPage=3"
        );
    }

    #[test]
    fn relative_links_resolve_against_origin() {
        assert_eq!(
            absolute_url("https://www.s.com/city/x.html", "/blue/hotel/y.html"),
            "https://www.s.com/blue/hotel/y.html"
        );
        assert_eq!(
            absolute_url("https://www.s.com/city/x.html", "//cdn.s.com/a"),
            "https://cdn.s.com/a"
        );
    }

    #[test]
    fn score_text_is_reduced_to_its_number() {
        assert_eq!(first_number("Exceptional 9,2"), Some(9.2));
        assert_eq!(first_number("8"), Some(8.0));
        assert_eq!(first_number("n/a"), None);
        assert_eq!(
            score_value(Some("n/a".to_string())),
            Some(JsonValue::String("n/a".to_string()))
        );
    }

    #[test]
    fn invalid_selectors_fail_compilation() {
        let selectors = SiteSelectors {
            review_card: "div[".to_string(),
            ..Default::default()
        };
        assert!(matches!(selectors.compile(), Err(AdapterError::Message(_))));
    }

    #[test]
    fn disabled_next_marker_ends_the_listing() {
        let selectors = SiteSelectors::default().compile().unwrap();
        let html = r#"<html><body>
            <div class="Review-comment">
              <div class="Review-comment-reviewer"><strong>Ana</strong></div>
            </div>
            <button data-element-name="review-paginator-next" disabled>Next</button>
        </body></html>"#;
        let page = parse_review_page(html, &selectors);
        assert_eq!(page.reviews.len(), 1);
        assert!(!page.has_next);
    }

    #[tokio::test]
    async fn fixture_source_pages_and_fails_on_request() {
        let mut hotels = BTreeMap::new();
        hotels.insert(
            "https://www.s.com/a/hotel/a.html".to_string(),
            FixtureHotel {
                hotel_name: Some("A".to_string()),
                pages: vec![vec![RawReview::default()], vec![RawReview::default()]],
                fail_from_page: Some(2),
            },
        );
        let mut source = FixtureReviewSource::new(FixtureSite {
            listing: Vec::new(),
            hotels,
        });
        let target = HotelTarget::from_url("https://www.s.com/a/hotel/a.html", Some("A"));

        let first = source.fetch_review_page(&target, 1).await.unwrap();
        assert!(first.has_next);
        assert!(source.fetch_review_page(&target, 2).await.is_err());
        assert_eq!(source.pages_fetched(), 2);
    }

    #[tokio::test]
    async fn failing_launcher_reports_an_error() {
        let launcher = FixtureLauncher::failing();
        assert!(launcher.launch().await.is_err());
        assert_eq!(launcher.close_count(), 0);
    }
}
